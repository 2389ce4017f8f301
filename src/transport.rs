//! Multipath transport abstraction.
//!
//! The core never touches sockets: it emits frames and consumes frames, and
//! everything underneath is whatever implements [`MultipathTransport`]: a
//! real QUIC/UDP stack in production, or the in-memory double below in
//! tests. One frame maps to exactly one transport payload.

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::SocketAddr;

use tracing::{debug, info};

/// Events a transport reports about a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEvent {
    /// Path became usable.
    Up,
    /// Path went down.
    Down,
    /// Fresh RTT measurement in milliseconds.
    RttUpdate(u32),
    /// The given packet number was declared lost.
    LossReport(u64),
}

/// Callback invoked with `(path_id, payload)` for every received datagram.
pub type ReceiveCallback = Box<dyn FnMut(u32, &[u8]) + Send>;

/// Callback invoked with `(path_id, event)` for path lifecycle events.
pub type PathEventCallback = Box<dyn FnMut(u32, PathEvent) + Send>;

/// Capability the host supplies to move frames over concurrent paths.
pub trait MultipathTransport {
    /// Send one payload on one path. Returns the number of bytes written;
    /// 0 means the transport dropped the payload.
    fn send(&mut self, path_id: u32, payload: &[u8]) -> usize;

    /// Open a new path between the given endpoints.
    fn add_path(&mut self, local: SocketAddr, remote: SocketAddr) -> io::Result<u32>;

    /// Tear down a path.
    fn remove_path(&mut self, path_id: u32);

    /// Install the receive hook.
    fn set_receive_callback(&mut self, callback: ReceiveCallback);

    /// Install the path-event hook.
    fn set_path_event_callback(&mut self, callback: PathEventCallback);
}

#[derive(Debug)]
struct MemoryPath {
    queue: VecDeque<Vec<u8>>,
    sent: u64,
    dropped: u64,
    /// Drop every Nth payload; 0 disables the pattern.
    drop_every_n: u64,
    /// Random drop probability, percent.
    loss_percent: u8,
    up: bool,
}

impl MemoryPath {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            sent: 0,
            dropped: 0,
            drop_every_n: 0,
            loss_percent: 0,
            up: true,
        }
    }

    /// Deterministic drop decision: pattern loss plus a multiplicative-hash
    /// "random" roll seeded by the send counter, so runs are reproducible.
    fn should_drop(&self, counter: u64) -> bool {
        if self.drop_every_n > 0 && counter % self.drop_every_n == 0 {
            return true;
        }
        if self.loss_percent > 0 {
            let hash = counter.wrapping_mul(0x9E37_79B9_7F4A_7C15);
            let roll = ((hash >> 56) as u8) % 100;
            if roll < self.loss_percent {
                return true;
            }
        }
        false
    }
}

/// In-memory loopback transport for tests and demos.
///
/// Sent payloads queue per path until [`deliver_pending`](Self::deliver_pending)
/// pumps them into the receive callback, so tests control delivery order and
/// timing. Loss is injected per path, deterministically.
#[derive(Default)]
pub struct MemoryTransport {
    paths: BTreeMap<u32, MemoryPath>,
    next_path_id: u32,
    receive_callback: Option<ReceiveCallback>,
    event_callback: Option<PathEventCallback>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure deterministic pattern loss on a path: drop every Nth
    /// payload (1-based; 0 disables).
    pub fn set_drop_pattern(&mut self, path_id: u32, drop_every_n: u64) {
        if let Some(path) = self.paths.get_mut(&path_id) {
            path.drop_every_n = drop_every_n;
        }
    }

    /// Configure hash-driven random loss on a path, in percent.
    pub fn set_loss_percent(&mut self, path_id: u32, percent: u8) {
        if let Some(path) = self.paths.get_mut(&path_id) {
            path.loss_percent = percent.min(100);
        }
    }

    /// Mark a path up or down and notify the event callback.
    pub fn set_path_up(&mut self, path_id: u32, up: bool) {
        if let Some(path) = self.paths.get_mut(&path_id) {
            path.up = up;
            if let Some(callback) = self.event_callback.as_mut() {
                callback(path_id, if up { PathEvent::Up } else { PathEvent::Down });
            }
        }
    }

    /// Inject a path event (RTT update, loss report) as a real transport
    /// would.
    pub fn inject_event(&mut self, path_id: u32, event: PathEvent) {
        if let Some(callback) = self.event_callback.as_mut() {
            callback(path_id, event);
        }
    }

    /// Deliver every queued payload to the receive callback, path by path
    /// in ascending id order. Returns the number delivered.
    pub fn deliver_pending(&mut self) -> usize {
        let Some(callback) = self.receive_callback.as_mut() else {
            return 0;
        };
        let mut delivered = 0;
        for (&path_id, path) in self.paths.iter_mut() {
            while let Some(payload) = path.queue.pop_front() {
                callback(path_id, &payload);
                delivered += 1;
            }
        }
        delivered
    }

    /// Payloads sent on a path (including dropped ones).
    pub fn sent_count(&self, path_id: u32) -> u64 {
        self.paths.get(&path_id).map_or(0, |p| p.sent)
    }

    /// Payloads dropped on a path by injected loss.
    pub fn dropped_count(&self, path_id: u32) -> u64 {
        self.paths.get(&path_id).map_or(0, |p| p.dropped)
    }
}

impl MultipathTransport for MemoryTransport {
    fn send(&mut self, path_id: u32, payload: &[u8]) -> usize {
        let Some(path) = self.paths.get_mut(&path_id) else {
            return 0;
        };
        if !path.up {
            return 0;
        }
        let counter = path.sent;
        path.sent += 1;
        if path.should_drop(counter) {
            path.dropped += 1;
            debug!(path_id, counter, "memory transport dropped payload");
            return 0;
        }
        path.queue.push_back(payload.to_vec());
        payload.len()
    }

    fn add_path(&mut self, _local: SocketAddr, _remote: SocketAddr) -> io::Result<u32> {
        let path_id = self.next_path_id;
        self.next_path_id += 1;
        self.paths.insert(path_id, MemoryPath::new());
        info!(path_id, "memory transport path added");
        Ok(path_id)
    }

    fn remove_path(&mut self, path_id: u32) {
        self.paths.remove(&path_id);
    }

    fn set_receive_callback(&mut self, callback: ReceiveCallback) {
        self.receive_callback = Some(callback);
    }

    fn set_path_event_callback(&mut self, callback: PathEventCallback) {
        self.event_callback = Some(callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_send_and_deliver() {
        let mut transport = MemoryTransport::new();
        let p0 = transport.add_path(addr(1000), addr(2000)).unwrap();
        let p1 = transport.add_path(addr(1001), addr(2001)).unwrap();
        assert_ne!(p0, p1);

        let received: Arc<Mutex<Vec<(u32, Vec<u8>)>>> = Arc::default();
        let sink = Arc::clone(&received);
        transport.set_receive_callback(Box::new(move |path_id, payload| {
            sink.lock().unwrap().push((path_id, payload.to_vec()));
        }));

        assert_eq!(transport.send(p0, b"alpha"), 5);
        assert_eq!(transport.send(p1, b"beta"), 4);
        assert_eq!(transport.send(42, b"nope"), 0);

        assert_eq!(transport.deliver_pending(), 2);
        let received = received.lock().unwrap();
        assert_eq!(received[0], (p0, b"alpha".to_vec()));
        assert_eq!(received[1], (p1, b"beta".to_vec()));
    }

    #[test]
    fn test_pattern_loss_drops_every_nth() {
        let mut transport = MemoryTransport::new();
        let p0 = transport.add_path(addr(1), addr(2)).unwrap();
        transport.set_drop_pattern(p0, 3);

        for i in 0..9u8 {
            transport.send(p0, &[i]);
        }
        // Counters 0, 3, 6 dropped.
        assert_eq!(transport.dropped_count(p0), 3);
        assert_eq!(transport.sent_count(p0), 9);
    }

    #[test]
    fn test_down_path_drops_everything() {
        let mut transport = MemoryTransport::new();
        let p0 = transport.add_path(addr(1), addr(2)).unwrap();

        let events: Arc<Mutex<Vec<(u32, PathEvent)>>> = Arc::default();
        let sink = Arc::clone(&events);
        transport.set_path_event_callback(Box::new(move |path_id, event| {
            sink.lock().unwrap().push((path_id, event));
        }));

        transport.set_path_up(p0, false);
        assert_eq!(transport.send(p0, b"lost"), 0);
        transport.set_path_up(p0, true);
        assert_eq!(transport.send(p0, b"ok"), 2);

        let events = events.lock().unwrap();
        assert_eq!(events.as_slice(), &[(p0, PathEvent::Down), (p0, PathEvent::Up)]);
    }

    #[test]
    fn test_event_injection() {
        let mut transport = MemoryTransport::new();
        let p0 = transport.add_path(addr(1), addr(2)).unwrap();

        let events: Arc<Mutex<Vec<PathEvent>>> = Arc::default();
        let sink = Arc::clone(&events);
        transport.set_path_event_callback(Box::new(move |_, event| {
            sink.lock().unwrap().push(event);
        }));

        transport.inject_event(p0, PathEvent::RttUpdate(42));
        transport.inject_event(p0, PathEvent::LossReport(7));
        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[PathEvent::RttUpdate(42), PathEvent::LossReport(7)]
        );
    }
}
