//! Session glue: one controller bound to one transport.
//!
//! [`FecSession`] is the thin layer a host embeds when it does not want to
//! wire the controller and transport together by hand. It serializes emitted
//! frames onto the transport, buffers incoming payloads and path events from
//! the transport callbacks, and feeds both through the controller when
//! polled. The controller stays strictly synchronous; the session just moves
//! bytes.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::controller::{FecController, SendPacketMeta};
use crate::scheduler::PathState;
use crate::transport::{MultipathTransport, PathEvent};
use crate::{FecConfig, Result};

type Inbox = Arc<Mutex<VecDeque<(u32, Vec<u8>)>>>;
type EventQueue = Arc<Mutex<VecDeque<(u32, PathEvent)>>>;

/// A controller driving a transport.
pub struct FecSession<T> {
    controller: FecController,
    transport: T,
    inbox: Inbox,
    events: EventQueue,
}

impl<T: MultipathTransport> FecSession<T> {
    /// Bind a new controller to `transport`, installing its callbacks.
    pub fn new(config: FecConfig, mut transport: T) -> Result<Self> {
        let controller = FecController::new(config)?;

        let inbox: Inbox = Arc::default();
        let sink = Arc::clone(&inbox);
        transport.set_receive_callback(Box::new(move |path_id, payload| {
            if let Ok(mut queue) = sink.lock() {
                queue.push_back((path_id, payload.to_vec()));
            }
        }));

        let events: EventQueue = Arc::default();
        let sink = Arc::clone(&events);
        transport.set_path_event_callback(Box::new(move |path_id, event| {
            if let Ok(mut queue) = sink.lock() {
                queue.push_back((path_id, event));
            }
        }));

        Ok(Self {
            controller,
            transport,
            inbox,
            events,
        })
    }

    /// The controller, for configuration and statistics.
    pub fn controller(&self) -> &FecController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut FecController {
        &mut self.controller
    }

    /// The underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Open a transport path and register it with the controller.
    pub fn open_path(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        initial: PathState,
    ) -> io::Result<u32> {
        let path_id = self.transport.add_path(local, remote)?;
        self.controller.add_path(path_id, initial);
        Ok(path_id)
    }

    /// Close a path on both sides.
    pub fn close_path(&mut self, path_id: u32) {
        self.transport.remove_path(path_id);
        self.controller.remove_path(path_id);
    }

    /// Protect and send application bytes. Returns the number of frames
    /// handed to the transport.
    pub fn send(&mut self, payload: &[u8], origin_path_id: u32) -> Result<usize> {
        let packets = self.controller.send_stream_data(payload, origin_path_id)?;
        Ok(self.dispatch(&packets))
    }

    /// Seal and send whatever is buffered in the open group.
    pub fn flush(&mut self) -> Result<usize> {
        let packets = self.controller.flush()?;
        Ok(self.dispatch(&packets))
    }

    /// Drive the periodic control loop: apply queued path events, run the
    /// controller tick, and send any frames it sealed.
    pub fn tick(&mut self) -> usize {
        let pending: Vec<(u32, PathEvent)> = match self.events.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for (path_id, event) in pending {
            self.apply_path_event(path_id, event);
        }

        let packets = self.controller.periodic_update();
        self.dispatch(&packets)
    }

    /// Run queued incoming payloads through the FEC machinery and return
    /// every source block recovered.
    pub fn poll_recovered(&mut self) -> Vec<Vec<u8>> {
        let pending: Vec<(u32, Vec<u8>)> = match self.inbox.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => Vec::new(),
        };

        let mut recovered = Vec::new();
        for (path_id, payload) in pending {
            recovered.extend(self.controller.receive_fec_frame(&payload, path_id));
        }
        recovered
    }

    fn apply_path_event(&mut self, path_id: u32, event: PathEvent) {
        debug!(path_id, ?event, "path event");
        match event {
            PathEvent::Up => {}
            PathEvent::Down => {
                if let Some(mut state) = self.controller.path_state(path_id) {
                    state.loss_rate = 1.0;
                    self.controller.update_path_state(state);
                }
            }
            PathEvent::RttUpdate(rtt_ms) => {
                if let Some(mut state) = self.controller.path_state(path_id) {
                    state.rtt_ms = rtt_ms as f64;
                    self.controller.update_path_state(state);
                }
            }
            PathEvent::LossReport(packet_number) => {
                self.controller.on_packet_lost(path_id, packet_number);
            }
        }
    }

    fn dispatch(&mut self, packets: &[SendPacketMeta]) -> usize {
        let mut sent = 0;
        for packet in packets {
            let wire = packet.frame.serialize();
            if self.transport.send(packet.path_id, &wire) > 0 {
                sent += 1;
            }
        }
        sent
    }
}
