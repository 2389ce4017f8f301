//! Master controller: the send/receive hooks and the periodic control loop.
//!
//! The controller exclusively owns every subcomponent (group manager,
//! receiver, scheduler, redundancy controller, packet mapper, correlation
//! matrix) and is the only mutation path into any of them. It is strictly
//! synchronous and single-threaded from its own perspective; a host that
//! drives it from several threads wraps it in one mutex, matching the
//! single-writer model.

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::correlation::CorrelationMatrix;
use crate::frame::FecFrame;
use crate::group::GroupManager;
use crate::mapper::PacketNumberMapper;
use crate::recover::GroupReceiver;
use crate::redundancy::{FecStrategy, LinkMetrics, RedundancyController, RedundancyDecision};
use crate::scheduler::{PathScheduler, PathState};
use crate::{FecConfig, Result};

/// EWMA weight of the previous RTT estimate (RFC 6298 style smoothing).
const RTT_EWMA_OLD: f64 = 0.875;
/// EWMA weight of a fresh RTT sample.
const RTT_EWMA_NEW: f64 = 0.125;

/// One packet the controller wants on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct SendPacketMeta {
    /// Per-path packet number, strictly increasing and gap-free from 1.
    pub packet_number: u64,
    /// Path the frame must be emitted on.
    pub path_id: u32,
    /// The frame itself.
    pub frame: FecFrame,
    /// When the controller handed the packet over.
    pub send_time: Instant,
    /// Whether the frame carries a repair block.
    pub is_repair: bool,
}

/// Cumulative, monotonic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Statistics {
    pub total_packets_sent: u64,
    pub source_packets_sent: u64,
    pub repair_packets_sent: u64,
    pub packets_recovered: u64,
    pub fec_groups_created: u64,
    pub frame_parse_errors: u64,
    /// `m / k` of the decision currently in force.
    pub current_redundancy_rate: f64,
    /// Mean codec run time per sealed group, microseconds.
    pub avg_encoding_time_us: f64,
}

/// Sliding window of per-path send outcomes (`true` = lost).
#[derive(Debug)]
struct LossWindow {
    outcomes: VecDeque<bool>,
    lost: usize,
    capacity: usize,
}

impl LossWindow {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            lost: 0,
            capacity,
        }
    }

    fn push(&mut self, lost: bool) {
        if self.outcomes.len() == self.capacity {
            if let Some(evicted) = self.outcomes.pop_front() {
                if evicted {
                    self.lost -= 1;
                }
            }
        }
        self.outcomes.push_back(lost);
        if lost {
            self.lost += 1;
        }
    }

    fn loss_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            None
        } else {
            Some(self.lost as f64 / self.outcomes.len() as f64)
        }
    }
}

/// The multipath FEC controller.
pub struct FecController {
    config: FecConfig,
    fec_enabled: bool,
    /// `None` selects the strategy automatically each tick.
    strategy: Option<FecStrategy>,

    groups: GroupManager,
    receiver: GroupReceiver,
    scheduler: PathScheduler,
    redundancy: RedundancyController,
    mapper: PacketNumberMapper,
    correlation: CorrelationMatrix,

    decision: RedundancyDecision,
    next_packet_numbers: BTreeMap<u32, u64>,
    loss_windows: BTreeMap<u32, LossWindow>,
    stats: Statistics,
    last_update: Option<Instant>,
}

impl FecController {
    /// Build a controller from a validated configuration.
    pub fn new(config: FecConfig) -> Result<Self> {
        config.validate()?;
        let groups = GroupManager::new(config.k, config.m, config.block_size)?;
        let decision = RedundancyDecision {
            k: config.k,
            m: config.m,
            redundancy_rate: config.m as f64 / config.k as f64,
            ..RedundancyDecision::default()
        };
        info!(
            k = config.k,
            m = config.m,
            block_size = config.block_size,
            "fec controller initialized"
        );
        Ok(Self {
            config,
            fec_enabled: true,
            strategy: None,
            groups,
            receiver: GroupReceiver::new(),
            scheduler: PathScheduler::new(),
            redundancy: RedundancyController::new(),
            mapper: PacketNumberMapper::new(),
            correlation: CorrelationMatrix::new(),
            decision,
            next_packet_numbers: BTreeMap::new(),
            loss_windows: BTreeMap::new(),
            stats: Statistics::default(),
            last_update: None,
        })
    }

    /// Re-apply coding parameters.
    ///
    /// Validates first and leaves all state untouched on error. The open
    /// group is flushed under its old rate; sealed groups are never
    /// rewritten. Changing `block_size` restarts the group manager.
    pub fn configure(&mut self, k: u32, m: u32, block_size: usize) -> Result<Vec<SendPacketMeta>> {
        let candidate = FecConfig {
            k,
            m,
            block_size,
            ..self.config.clone()
        };
        candidate.validate()?;

        let mut out = Vec::new();
        if block_size != self.groups.block_size() {
            for id in self.groups.flush() {
                self.emit_group(id, &mut out)?;
            }
            self.groups = GroupManager::new(k, m, block_size)?;
        } else {
            for id in self.groups.update_rate(k, m)? {
                self.emit_group(id, &mut out)?;
            }
        }
        self.config = candidate;
        self.decision.k = k;
        self.decision.m = m;
        self.decision.redundancy_rate = m as f64 / k as f64;
        Ok(out)
    }

    /// Register a path with its initial state.
    pub fn add_path(&mut self, path_id: u32, mut state: PathState) {
        state.path_id = path_id;
        self.next_packet_numbers.entry(path_id).or_insert(1);
        self.loss_windows
            .entry(path_id)
            .or_insert_with(|| LossWindow::new(self.config.loss_window));
        self.scheduler.update_path_state(state);
        self.redundancy.update_link_metrics(link_metrics_from(&state));
        info!(path_id, "path added");
    }

    /// Remove a path and its bookkeeping. In-flight mappings stay until the
    /// normal cleanup horizon passes them.
    pub fn remove_path(&mut self, path_id: u32) {
        self.scheduler.remove_path(path_id);
        self.redundancy.remove_path(path_id);
        self.correlation.remove_path(path_id);
        self.next_packet_numbers.remove(&path_id);
        self.loss_windows.remove(&path_id);
        info!(path_id, "path removed");
    }

    /// Refresh a path's link state from transport measurements.
    pub fn update_path_state(&mut self, state: PathState) {
        self.scheduler.update_path_state(state);
        self.redundancy.update_link_metrics(link_metrics_from(&state));
    }

    /// Record the loss-correlation coefficient between two paths.
    pub fn update_loss_correlation(&mut self, path_i: u32, path_j: u32, rho: f64) {
        self.correlation.update(path_i, path_j, rho);
    }

    /// Toggle FEC protection. While disabled, payloads pass through as bare
    /// source frames on the caller's path with no group bookkeeping.
    pub fn set_fec_enabled(&mut self, enabled: bool) {
        self.fec_enabled = enabled;
        info!(enabled, "fec protection toggled");
    }

    /// Pin a redundancy strategy; [`FecStrategy::Dynamic`] restores
    /// automatic selection from live metrics.
    pub fn set_fec_strategy(&mut self, strategy: FecStrategy) {
        let (min_rate, max_rate) = strategy.redundancy_range();
        self.redundancy.set_constraints(min_rate, max_rate);
        self.strategy = match strategy {
            FecStrategy::Dynamic => None,
            pinned => Some(pinned),
        };
        info!(?strategy, "fec strategy set");
    }

    /// Statistics snapshot; always queryable.
    pub fn get_statistics(&self) -> Statistics {
        let mut stats = self.stats;
        stats.packets_recovered = self.receiver.recovered_blocks();
        stats.avg_encoding_time_us = self.groups.avg_encoding_time_us();
        stats.current_redundancy_rate = self.decision.redundancy_rate;
        stats
    }

    /// The decision currently steering emission.
    pub fn current_decision(&self) -> &RedundancyDecision {
        &self.decision
    }

    /// Snapshot of one path's scheduler state.
    pub fn path_state(&self, path_id: u32) -> Option<PathState> {
        self.scheduler.path(path_id).copied()
    }

    /// Slice `payload` into blocks, accumulate them, and emit every group
    /// that seals.
    ///
    /// With FEC disabled the payload is wrapped as a single source frame on
    /// `origin_path_id` and no group state is touched. Fails with
    /// [`Error::NoPathsAvailable`] before mutating anything when no usable
    /// path exists.
    pub fn send_stream_data(
        &mut self,
        payload: &[u8],
        origin_path_id: u32,
    ) -> Result<Vec<SendPacketMeta>> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }

        if !self.fec_enabled {
            let packet_number = self.next_packet_number(origin_path_id);
            let frame = FecFrame::source(0, 0, 1, payload.to_vec());
            self.stats.total_packets_sent += 1;
            self.stats.source_packets_sent += 1;
            return Ok(vec![SendPacketMeta {
                packet_number,
                path_id: origin_path_id,
                frame,
                send_time: Instant::now(),
                is_repair: false,
            }]);
        }

        // Surface path exhaustion before touching group state.
        self.scheduler.select_source_path(self.config.block_size)?;

        let mut out = Vec::new();
        for chunk in payload.chunks(self.groups.block_size()) {
            if let Some(group_id) = self.groups.add_source(chunk)? {
                self.emit_group(group_id, &mut out)?;
            }
        }
        Ok(out)
    }

    /// Seal the in-progress group (zero-padded) and emit it.
    pub fn flush(&mut self) -> Result<Vec<SendPacketMeta>> {
        let mut out = Vec::new();
        for group_id in self.groups.flush() {
            self.emit_group(group_id, &mut out)?;
        }
        Ok(out)
    }

    /// Feed one received transport payload into the FEC machinery.
    ///
    /// Returns any source blocks recovered by this frame (the whole group,
    /// in index order, on the decode that completes it). Parse failures drop
    /// the frame and bump a counter; they never abort the connection.
    pub fn receive_fec_frame(&mut self, data: &[u8], from_path_id: u32) -> Vec<Vec<u8>> {
        let frame = match FecFrame::parse(data) {
            Ok(frame) => frame,
            Err(err) => {
                self.stats.frame_parse_errors += 1;
                warn!(from_path_id, %err, "dropping unparseable frame");
                return Vec::new();
            }
        };
        let recovered = self.receiver.on_frame(frame);
        if !recovered.is_empty() {
            debug!(
                from_path_id,
                blocks = recovered.len(),
                "frames recovered from fec decode"
            );
        }
        recovered
    }

    /// ACK hook: refresh RTT (EWMA) and the delivery outcome window.
    ///
    /// A mapping miss means the ACK refers to a packet past the cleanup
    /// horizon; it is ignored.
    pub fn on_ack(&mut self, path_id: u32, packet_number: u64, rtt_us: u64) {
        if self.mapper.lookup(path_id, packet_number).is_none() {
            debug!(path_id, packet_number, "ack for unknown packet ignored");
            return;
        }

        if let Some(window) = self.loss_windows.get_mut(&path_id) {
            window.push(false);
        }
        let rtt_sample_ms = rtt_us as f64 / 1000.0;
        if let Some(state) = self.scheduler.path(path_id).copied() {
            let mut state = state;
            state.rtt_ms = if state.rtt_ms > 0.0 {
                RTT_EWMA_OLD * state.rtt_ms + RTT_EWMA_NEW * rtt_sample_ms
            } else {
                rtt_sample_ms
            };
            if let Some(loss) = self.loss_windows.get(&path_id).and_then(LossWindow::loss_rate)
            {
                state.loss_rate = loss;
            }
            self.update_path_state(state);
        }
    }

    /// Loss hook: recompute the path's sliding-window loss rate.
    pub fn on_packet_lost(&mut self, path_id: u32, packet_number: u64) {
        if let Some(mapping) = self.mapper.lookup(path_id, packet_number) {
            debug!(
                path_id,
                packet_number,
                group_id = mapping.group_id,
                is_repair = mapping.is_repair,
                "packet reported lost"
            );
        }

        if let Some(window) = self.loss_windows.get_mut(&path_id) {
            window.push(true);
        }
        if let Some(state) = self.scheduler.path(path_id).copied() {
            let mut state = state;
            if let Some(loss) = self.loss_windows.get(&path_id).and_then(LossWindow::loss_rate)
            {
                state.loss_rate = loss;
            }
            self.update_path_state(state);
        }
    }

    /// Periodic control tick; call every ~100 ms.
    ///
    /// Effective at most once per `update_interval`: feeds the optimizer,
    /// recomputes the decision, applies rate changes, ages out the open
    /// group, and retires state past the cleanup horizon. Returns frames for
    /// any group the tick sealed.
    pub fn periodic_update(&mut self) -> Vec<SendPacketMeta> {
        let now = Instant::now();
        if let Some(last) = self.last_update {
            if now.duration_since(last) < self.config.update_interval {
                return Vec::new();
            }
        }
        self.last_update = Some(now);

        // Strategy first: it bounds what the optimizer may pick.
        if self.strategy.is_none() {
            let strategy = FecStrategy::select(self.redundancy.metrics());
            let (min_rate, max_rate) = strategy.redundancy_range();
            self.redundancy.set_constraints(min_rate, max_rate);
        }

        // Single OCO feedback point: observed loss and RTT of the current
        // source path.
        if let Some(source) = self.scheduler.path(self.decision.source_path) {
            self.redundancy.feedback(source.loss_rate, source.rtt_ms);
        }

        let mut out = Vec::new();
        match self.redundancy.compute_optimal(&self.correlation) {
            Ok(decision) => {
                if (decision.k, decision.m) != self.groups.coding_params() {
                    match self.groups.update_rate(decision.k, decision.m) {
                        Ok(flushed) => {
                            for group_id in flushed {
                                if let Err(err) = self.emit_group(group_id, &mut out) {
                                    warn!(%err, group_id, "rate-change flush not emitted");
                                }
                            }
                        }
                        Err(err) => warn!(%err, "rate update rejected"),
                    }
                }
                self.decision = decision;
                self.stats.current_redundancy_rate = decision.redundancy_rate;
            }
            Err(err) => {
                debug!(%err, "keeping previous redundancy decision");
            }
        }

        // Age out the open group so stragglers never wait on a full group.
        if self.groups.current_len() > 0 && self.groups.current_age() >= self.config.flush_age {
            for group_id in self.groups.flush() {
                if let Err(err) = self.emit_group(group_id, &mut out) {
                    warn!(%err, group_id, "age-out flush not emitted");
                }
            }
        }

        if self.groups.sealed_len() > self.config.group_retention {
            let horizon = self
                .groups
                .current_group_id()
                .saturating_sub(self.config.cleanup_keep);
            self.groups.cleanup(horizon);
            self.mapper.cleanup(horizon);
        }
        if self.receiver.len() > self.config.group_retention {
            let horizon = self
                .receiver
                .highest_group_id()
                .saturating_sub(self.config.cleanup_keep);
            self.receiver.cleanup(horizon);
        }

        out
    }

    /// Assign paths and packet numbers to a sealed group and append its
    /// frames to `out`: sources in index order, then repairs.
    fn emit_group(&mut self, group_id: u64, out: &mut Vec<SendPacketMeta>) -> Result<()> {
        let source_path = self.scheduler.select_source_path(self.config.block_size)?;
        let repair_path =
            self.scheduler
                .select_repair_path(source_path, &self.correlation, self.config.block_size)?;

        let group = match self.groups.get(group_id) {
            Some(group) => group,
            None => return Ok(()),
        };
        let frames = group.frames();

        self.decision.source_path = source_path;
        self.decision.repair_path = repair_path;
        self.stats.fec_groups_created += 1;

        for frame in frames {
            let is_repair = frame.is_repair();
            let path_id = if is_repair { repair_path } else { source_path };
            let packet_number = self.next_packet_number(path_id);

            self.mapper.add(
                group_id,
                frame.header.block_index,
                path_id,
                packet_number,
                is_repair,
            );
            if is_repair {
                self.stats.repair_packets_sent += 1;
            } else {
                self.stats.source_packets_sent += 1;
            }
            self.stats.total_packets_sent += 1;

            out.push(SendPacketMeta {
                packet_number,
                path_id,
                frame,
                send_time: Instant::now(),
                is_repair,
            });
        }

        debug!(
            group_id,
            source_path, repair_path, "group assigned to paths and emitted"
        );
        Ok(())
    }

    fn next_packet_number(&mut self, path_id: u32) -> u64 {
        let counter = self.next_packet_numbers.entry(path_id).or_insert(1);
        let number = *counter;
        *counter += 1;
        number
    }
}

fn link_metrics_from(state: &PathState) -> LinkMetrics {
    LinkMetrics {
        path_id: state.path_id,
        rtt_ms: state.rtt_ms,
        loss_rate: state.loss_rate,
        bandwidth_mbps: state.bandwidth_mbps,
        jitter_ms: state.jitter_ms,
        bytes_in_flight: state.cwnd_bytes,
        ..LinkMetrics::default()
    }
}
