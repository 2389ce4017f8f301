//! Multipath packet scheduler.
//!
//! Each path carries a weight, renormalized to a distribution and updated
//! multiplicatively from a per-path cost built out of RTT, loss rate and
//! inverse bandwidth. Multiplicative weights is the online-convex-
//! optimization learner here: regret against the best fixed path in
//! hindsight grows only as O(sqrt(T log N)).
//!
//! Three selection policies sit on top of the weights:
//!
//! - generic packets go weighted-random,
//! - source packets go to the deterministic best path by score,
//! - repair packets go to the path least loss-correlated with the source.

use std::collections::BTreeMap;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::correlation::CorrelationMatrix;
use crate::{Error, Result};

/// Learning rate for the multiplicative-weights update.
const ALPHA: f64 = 0.1;
/// Cost weight on normalized RTT.
const BETA: f64 = 0.5;
/// Cost weight on loss rate.
const GAMMA: f64 = 0.3;
/// Cost weight on inverse bandwidth.
const DELTA: f64 = 0.2;
/// Floor for weights and costs.
const WEIGHT_FLOOR: f64 = 1e-3;

/// A path is schedulable only below this loss rate.
const MAX_USABLE_LOSS: f64 = 0.5;
/// A path is schedulable only above this bandwidth (Mbps).
const MIN_USABLE_BANDWIDTH: f64 = 0.1;

/// Per-path link snapshot, written by feedback and read by the selection
/// policies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathState {
    pub path_id: u32,
    /// Smoothed round-trip time in milliseconds.
    pub rtt_ms: f64,
    /// Loss rate in `[0, 1]`.
    pub loss_rate: f64,
    /// Estimated bandwidth in Mbps.
    pub bandwidth_mbps: f64,
    /// RTT jitter in milliseconds.
    pub jitter_ms: f64,
    /// Congestion window in bytes.
    pub cwnd_bytes: u64,
}

impl PathState {
    /// Snapshot with the commonly measured fields; jitter and cwnd start 0.
    pub fn new(path_id: u32, rtt_ms: f64, loss_rate: f64, bandwidth_mbps: f64) -> Self {
        Self {
            path_id,
            rtt_ms,
            loss_rate,
            bandwidth_mbps,
            jitter_ms: 0.0,
            cwnd_bytes: 0,
        }
    }

    /// Whether the path is usable at all for scheduling.
    pub fn is_available(&self) -> bool {
        self.loss_rate < MAX_USABLE_LOSS && self.bandwidth_mbps > MIN_USABLE_BANDWIDTH
    }

    /// Deterministic source-path score; higher is better.
    fn source_score(&self) -> f64 {
        -0.4 * self.rtt_ms - 0.5 * 1000.0 * self.loss_rate + 0.1 * self.bandwidth_mbps
    }
}

/// Weight-based path scheduler.
#[derive(Debug)]
pub struct PathScheduler {
    paths: BTreeMap<u32, PathState>,
    weights: BTreeMap<u32, f64>,
    rng: SmallRng,
}

impl Default for PathScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PathScheduler {
    pub fn new() -> Self {
        Self {
            paths: BTreeMap::new(),
            weights: BTreeMap::new(),
            rng: SmallRng::from_entropy(),
        }
    }

    /// Number of known paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Current per-path weights; they always sum to 1.
    pub fn weights(&self) -> &BTreeMap<u32, f64> {
        &self.weights
    }

    /// Snapshot of every known path.
    pub fn paths(&self) -> impl Iterator<Item = &PathState> {
        self.paths.values()
    }

    /// Look up one path.
    pub fn path(&self, path_id: u32) -> Option<&PathState> {
        self.paths.get(&path_id)
    }

    /// Insert or refresh a path's state and rebalance the weights.
    pub fn update_path_state(&mut self, state: PathState) {
        let path_id = state.path_id;
        let is_new = self.paths.insert(path_id, state).is_none();
        if is_new {
            let initial = 1.0 / self.paths.len() as f64;
            self.weights.insert(path_id, initial);
            info!(path_id, weight = initial, "path added to scheduler");
        }
        self.update_weights();
    }

    /// Drop a path entirely.
    pub fn remove_path(&mut self, path_id: u32) {
        self.paths.remove(&path_id);
        self.weights.remove(&path_id);
        self.normalize();
    }

    /// Weighted-random path choice for generic traffic.
    pub fn select_path(&mut self, _packet_size: usize) -> Result<u32> {
        let available: Vec<(u32, f64)> = self
            .paths
            .values()
            .filter(|p| p.is_available())
            .map(|p| (p.path_id, self.weights.get(&p.path_id).copied().unwrap_or(0.0)))
            .collect();
        if available.is_empty() {
            return Err(Error::NoPathsAvailable);
        }

        let total: f64 = available.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            return Ok(available[0].0);
        }

        let mut roll = self.rng.gen::<f64>() * total;
        for &(path_id, weight) in &available {
            roll -= weight;
            if roll <= 0.0 {
                debug!(path_id, "weighted-random path selected");
                return Ok(path_id);
            }
        }
        Ok(available[available.len() - 1].0)
    }

    /// Deterministic best path for source packets: argmax of the score
    /// `-0.4·rtt - 500·loss + 0.1·bw` over available paths, ties broken by
    /// ascending path id.
    pub fn select_source_path(&self, _packet_size: usize) -> Result<u32> {
        let mut best: Option<(f64, u32)> = None;
        for path in self.paths.values().filter(|p| p.is_available()) {
            let score = path.source_score();
            let better = match best {
                None => true,
                Some((best_score, _)) => score > best_score,
            };
            if better {
                best = Some((score, path.path_id));
            }
        }
        best.map(|(_, id)| id).ok_or(Error::NoPathsAvailable)
    }

    /// Path for repair packets: least loss-correlated with `source_path`
    /// among the other available paths, falling back to the source path when
    /// it is the only one left.
    pub fn select_repair_path(
        &self,
        source_path: u32,
        correlation: &CorrelationMatrix,
        _packet_size: usize,
    ) -> Result<u32> {
        if !self.paths.values().any(|p| p.is_available()) {
            return Err(Error::NoPathsAvailable);
        }
        let candidates = self
            .paths
            .values()
            .filter(|p| p.is_available() && p.path_id != source_path)
            .map(|p| p.path_id);
        Ok(correlation
            .least_correlated(source_path, candidates)
            .unwrap_or(source_path))
    }

    /// Multiplicative-weights update from the current path costs.
    fn update_weights(&mut self) {
        if self.paths.is_empty() {
            return;
        }

        let costs: BTreeMap<u32, f64> = self
            .paths
            .iter()
            .map(|(&id, state)| (id, path_cost(state)))
            .collect();
        let total_cost: f64 = costs.values().sum();
        let total_cost = total_cost.max(WEIGHT_FLOOR);

        for (id, weight) in self.weights.iter_mut() {
            if let Some(cost) = costs.get(id) {
                *weight *= (-ALPHA * cost / total_cost).exp();
                *weight = weight.max(WEIGHT_FLOOR);
            }
        }
        self.normalize();
    }

    fn normalize(&mut self) {
        let sum: f64 = self.weights.values().sum();
        if sum <= 0.0 {
            return;
        }
        for weight in self.weights.values_mut() {
            *weight /= sum;
        }
    }
}

/// Cost `c = β·(rtt/100ms) + γ·loss + δ·(100Mbps/bw)`, floored away from 0.
fn path_cost(state: &PathState) -> f64 {
    let rtt_normalized = state.rtt_ms / 100.0;
    let inverse_bandwidth = 100.0 / state.bandwidth_mbps.max(1.0);
    let cost = BETA * rtt_normalized + GAMMA * state.loss_rate + DELTA * inverse_bandwidth;
    cost.max(WEIGHT_FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_is_distribution(scheduler: &PathScheduler) {
        let sum: f64 = scheduler.weights().values().sum();
        assert!((sum - 1.0).abs() < 1e-9, "weights sum to {}", sum);
        for (&id, &w) in scheduler.weights() {
            assert!(w >= WEIGHT_FLOOR / 2.0, "path {} weight {} too small", id, w);
        }
    }

    #[test]
    fn test_weights_form_distribution() {
        let mut scheduler = PathScheduler::new();
        scheduler.update_path_state(PathState::new(0, 20.0, 0.01, 100.0));
        assert_is_distribution(&scheduler);

        scheduler.update_path_state(PathState::new(1, 50.0, 0.10, 20.0));
        scheduler.update_path_state(PathState::new(2, 80.0, 0.02, 10.0));
        assert_is_distribution(&scheduler);

        for _ in 0..100 {
            scheduler.update_path_state(PathState::new(1, 50.0, 0.10, 20.0));
            assert_is_distribution(&scheduler);
        }
    }

    #[test]
    fn test_bad_path_loses_weight() {
        let mut scheduler = PathScheduler::new();
        scheduler.update_path_state(PathState::new(0, 10.0, 0.0, 100.0));
        scheduler.update_path_state(PathState::new(1, 300.0, 0.30, 1.0));

        for _ in 0..50 {
            scheduler.update_path_state(PathState::new(0, 10.0, 0.0, 100.0));
            scheduler.update_path_state(PathState::new(1, 300.0, 0.30, 1.0));
        }

        let good = scheduler.weights()[&0];
        let bad = scheduler.weights()[&1];
        assert!(good > bad, "good {} should outweigh bad {}", good, bad);
    }

    #[test]
    fn test_select_source_path_prefers_best_score() {
        let mut scheduler = PathScheduler::new();
        scheduler.update_path_state(PathState::new(0, 20.0, 0.01, 100.0));
        scheduler.update_path_state(PathState::new(1, 200.0, 0.20, 100.0));
        assert_eq!(scheduler.select_source_path(1200).unwrap(), 0);
    }

    #[test]
    fn test_select_source_path_tie_breaks_ascending() {
        let mut scheduler = PathScheduler::new();
        scheduler.update_path_state(PathState::new(5, 20.0, 0.01, 50.0));
        scheduler.update_path_state(PathState::new(2, 20.0, 0.01, 50.0));
        assert_eq!(scheduler.select_source_path(1200).unwrap(), 2);
    }

    #[test]
    fn test_availability_filter() {
        let mut scheduler = PathScheduler::new();
        scheduler.update_path_state(PathState::new(0, 20.0, 0.9, 100.0)); // lossy
        scheduler.update_path_state(PathState::new(1, 20.0, 0.01, 0.05)); // starved
        assert_eq!(
            scheduler.select_source_path(1200),
            Err(Error::NoPathsAvailable)
        );
        assert_eq!(scheduler.select_path(1200), Err(Error::NoPathsAvailable));

        scheduler.update_path_state(PathState::new(2, 40.0, 0.05, 10.0));
        assert_eq!(scheduler.select_source_path(1200).unwrap(), 2);
    }

    #[test]
    fn test_select_repair_path_least_correlated() {
        let mut scheduler = PathScheduler::new();
        scheduler.update_path_state(PathState::new(0, 20.0, 0.01, 100.0));
        scheduler.update_path_state(PathState::new(1, 30.0, 0.02, 80.0));
        scheduler.update_path_state(PathState::new(2, 40.0, 0.03, 60.0));

        let mut correlation = CorrelationMatrix::new();
        correlation.update(0, 1, 0.9);
        correlation.update(0, 2, 0.1);

        assert_eq!(
            scheduler.select_repair_path(0, &correlation, 1200).unwrap(),
            2
        );
    }

    #[test]
    fn test_select_repair_path_falls_back_to_source() {
        let mut scheduler = PathScheduler::new();
        scheduler.update_path_state(PathState::new(0, 20.0, 0.01, 100.0));
        let correlation = CorrelationMatrix::new();
        assert_eq!(
            scheduler.select_repair_path(0, &correlation, 1200).unwrap(),
            0
        );
    }

    #[test]
    fn test_select_path_weighted_random_stays_available() {
        let mut scheduler = PathScheduler::new();
        scheduler.update_path_state(PathState::new(0, 20.0, 0.01, 100.0));
        scheduler.update_path_state(PathState::new(1, 30.0, 0.9, 100.0)); // unavailable

        for _ in 0..50 {
            assert_eq!(scheduler.select_path(1200).unwrap(), 0);
        }
    }

    #[test]
    fn test_remove_path_renormalizes() {
        let mut scheduler = PathScheduler::new();
        scheduler.update_path_state(PathState::new(0, 20.0, 0.01, 100.0));
        scheduler.update_path_state(PathState::new(1, 30.0, 0.02, 80.0));
        scheduler.remove_path(0);
        assert_eq!(scheduler.len(), 1);
        assert_is_distribution(&scheduler);
    }
}
