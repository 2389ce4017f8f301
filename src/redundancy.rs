//! Adaptive redundancy control (online convex optimization).
//!
//! The controller keeps per-path link metrics and the shared loss-correlation
//! matrix, and turns them into a `RedundancyDecision`: the coding rate
//! `(k, m)` plus the preferred source and repair paths. Each decision's cost
//! is `α_loss·loss + α_delay·delay + α_overhead·(m/k)`; ACK feedback drives a
//! gradient step on per-path accumulators so persistent prediction error
//! shifts future decisions.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info, warn};

use crate::correlation::CorrelationMatrix;
use crate::{Error, Result};

/// Learning rate η for the gradient update.
const LEARNING_RATE: f64 = 0.05;
/// Bounded history of `(decision, observed loss)` pairs.
const MAX_HISTORY: usize = 100;

/// Loss rate above which any single path forces the aggressive strategy.
const AGGRESSIVE_LOSS_THRESHOLD: f64 = 0.15;
/// Mean loss rate below which the conservative strategy applies.
const CONSERVATIVE_LOSS_THRESHOLD: f64 = 0.02;

/// Per-path link-quality metrics, as fed by transport feedback.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkMetrics {
    pub path_id: u32,
    pub rtt_ms: f64,
    pub loss_rate: f64,
    pub bandwidth_mbps: f64,
    pub jitter_ms: f64,
    pub packets_sent: u64,
    pub packets_lost: u64,
    pub bytes_in_flight: u64,
}

/// Output of one optimization round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RedundancyDecision {
    /// Source blocks per group.
    pub k: u32,
    /// Repair blocks per group.
    pub m: u32,
    /// `m / k`.
    pub redundancy_rate: f64,
    /// Preferred path for source packets.
    pub source_path: u32,
    /// Preferred path for repair packets.
    pub repair_path: u32,
    /// Confidence in the decision, `1 - loss(source path)`.
    pub confidence: f64,
}

impl Default for RedundancyDecision {
    fn default() -> Self {
        Self {
            k: 4,
            m: 2,
            redundancy_rate: 0.5,
            source_path: 0,
            repair_path: 1,
            confidence: 1.0,
        }
    }
}

/// Coarse redundancy policy bounding the rate the optimizer may pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecStrategy {
    /// High redundancy for hostile networks.
    Aggressive,
    /// Middle-of-the-road default.
    Balanced,
    /// Minimal redundancy for clean networks.
    Conservative,
    /// Full range; the optimizer decides alone.
    Dynamic,
}

impl FecStrategy {
    /// `(min_rate, max_rate)` bounds on `m / k` for this strategy.
    pub fn redundancy_range(self) -> (f64, f64) {
        match self {
            Self::Aggressive => (0.4, 1.0),
            Self::Balanced => (0.2, 0.6),
            Self::Conservative => (0.1, 0.3),
            Self::Dynamic => (0.1, 1.0),
        }
    }

    /// Pick a strategy from current metrics: any path above 15% loss is
    /// aggressive territory, mean loss under 2% conservative, else balanced.
    pub fn select<'a, I>(metrics: I) -> Self
    where
        I: IntoIterator<Item = &'a LinkMetrics>,
    {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut max = 0.0f64;
        for m in metrics {
            count += 1;
            sum += m.loss_rate;
            max = max.max(m.loss_rate);
        }
        if count == 0 {
            return Self::Balanced;
        }
        let mean = sum / count as f64;

        if max > AGGRESSIVE_LOSS_THRESHOLD {
            Self::Aggressive
        } else if mean < CONSERVATIVE_LOSS_THRESHOLD {
            Self::Conservative
        } else {
            Self::Balanced
        }
    }
}

#[derive(Debug, Clone)]
struct DecisionRecord {
    decision: RedundancyDecision,
    /// Source-path loss rate at decision time.
    predicted_loss: f64,
    /// Filled in by feedback; `None` until then.
    observed_loss: Option<f64>,
}

/// Online redundancy optimizer.
#[derive(Debug)]
pub struct RedundancyController {
    metrics: BTreeMap<u32, LinkMetrics>,
    alpha_loss: f64,
    alpha_delay: f64,
    alpha_overhead: f64,
    min_rate: f64,
    max_rate: f64,
    gradient_accumulator: BTreeMap<u32, f64>,
    history: VecDeque<DecisionRecord>,
}

impl Default for RedundancyController {
    fn default() -> Self {
        Self::new()
    }
}

impl RedundancyController {
    pub fn new() -> Self {
        Self {
            metrics: BTreeMap::new(),
            alpha_loss: 0.5,
            alpha_delay: 0.3,
            alpha_overhead: 0.2,
            min_rate: 0.1,
            max_rate: 1.0,
            gradient_accumulator: BTreeMap::new(),
            history: VecDeque::with_capacity(MAX_HISTORY),
        }
    }

    /// Refresh one path's metrics.
    pub fn update_link_metrics(&mut self, metrics: LinkMetrics) {
        self.gradient_accumulator.entry(metrics.path_id).or_insert(0.0);
        self.metrics.insert(metrics.path_id, metrics);
    }

    /// Forget a path.
    pub fn remove_path(&mut self, path_id: u32) {
        self.metrics.remove(&path_id);
        self.gradient_accumulator.remove(&path_id);
    }

    /// Snapshot of all tracked metrics.
    pub fn metrics(&self) -> impl Iterator<Item = &LinkMetrics> {
        self.metrics.values()
    }

    /// Current rate constraints `(min, max)`.
    pub fn constraints(&self) -> (f64, f64) {
        (self.min_rate, self.max_rate)
    }

    /// Replace the cost weights; they are renormalized to sum 1.
    pub fn set_cost_weights(&mut self, loss: f64, delay: f64, overhead: f64) {
        let sum = loss + delay + overhead;
        if sum <= 0.0 {
            warn!("cost weights must be positive, keeping previous values");
            return;
        }
        self.alpha_loss = loss / sum;
        self.alpha_delay = delay / sum;
        self.alpha_overhead = overhead / sum;
        info!(
            alpha_loss = self.alpha_loss,
            alpha_delay = self.alpha_delay,
            alpha_overhead = self.alpha_overhead,
            "cost weights updated"
        );
    }

    /// Constrain the redundancy rate the optimizer may choose.
    pub fn set_constraints(&mut self, min_rate: f64, max_rate: f64) {
        self.min_rate = min_rate.max(0.0);
        self.max_rate = max_rate.min(1.0);
        info!(
            min_rate = self.min_rate,
            max_rate = self.max_rate,
            "redundancy constraints updated"
        );
    }

    /// Compute the optimal decision for the current metrics.
    ///
    /// Fails with [`Error::NoPathsAvailable`] when no usable path exists;
    /// the caller keeps its previous decision in that case.
    pub fn compute_optimal(&mut self, correlation: &CorrelationMatrix) -> Result<RedundancyDecision> {
        let source_path = self.select_source_path()?;
        let repair_path = self.select_repair_path(source_path, correlation);

        let source = self.metrics[&source_path];
        let required = self.estimate_required_redundancy(&source);
        let redundancy_rate = required.clamp(self.min_rate, self.max_rate);
        let (k, m) = rate_to_params(redundancy_rate);

        let decision = RedundancyDecision {
            k,
            m,
            redundancy_rate: m as f64 / k as f64,
            source_path,
            repair_path,
            confidence: 1.0 - source.loss_rate,
        };

        if self.history.len() >= MAX_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(DecisionRecord {
            decision,
            predicted_loss: source.loss_rate,
            observed_loss: None,
        });

        let repair = self.metrics.get(&repair_path).copied().unwrap_or_default();
        debug!(
            k,
            m,
            source_path,
            repair_path,
            rate = decision.redundancy_rate,
            cost = self.cost(k, m, &source, &repair),
            "redundancy decision computed"
        );
        Ok(decision)
    }

    /// Gradient feedback from observed network behavior.
    ///
    /// `observed_loss` is compared against the loss predicted at the last
    /// decision; the error scales a per-path gradient step.
    pub fn feedback(&mut self, observed_loss: f64, observed_rtt_ms: f64) {
        let Some(last) = self.history.back_mut() else {
            return;
        };
        last.observed_loss = Some(observed_loss);
        let error = observed_loss - last.predicted_loss;

        for (path_id, accumulator) in self.gradient_accumulator.iter_mut() {
            let Some(metrics) = self.metrics.get(path_id) else {
                continue;
            };
            let gradient =
                self.alpha_loss * metrics.loss_rate + self.alpha_delay * (metrics.rtt_ms / 100.0);
            *accumulator -= LEARNING_RATE * gradient * error;
        }

        debug!(
            observed_loss,
            observed_rtt_ms, error, "feedback applied to gradient accumulators"
        );
    }

    /// Records kept for online learning.
    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Cost of a candidate configuration.
    fn cost(&self, k: u32, m: u32, source: &LinkMetrics, repair: &LinkMetrics) -> f64 {
        let loss_cost = source.loss_rate;
        let delay_cost = (source.rtt_ms + repair.rtt_ms) / 1000.0;
        let overhead_cost = m as f64 / k as f64;
        self.alpha_loss * loss_cost + self.alpha_delay * delay_cost
            + self.alpha_overhead * overhead_cost
    }

    /// Argmax of the source score over usable paths; ascending-id ties.
    fn select_source_path(&self) -> Result<u32> {
        let mut best: Option<(f64, u32)> = None;
        for (&path_id, metrics) in &self.metrics {
            if metrics.loss_rate >= 0.5 || metrics.bandwidth_mbps <= 0.1 {
                continue;
            }
            let score = -0.4 * metrics.rtt_ms - 0.5 * 1000.0 * metrics.loss_rate
                + 0.1 * metrics.bandwidth_mbps;
            let better = match best {
                None => true,
                Some((best_score, _)) => score > best_score,
            };
            if better {
                best = Some((score, path_id));
            }
        }
        best.map(|(_, id)| id).ok_or(Error::NoPathsAvailable)
    }

    /// Least-correlated alternative to the source path.
    fn select_repair_path(&self, source_path: u32, correlation: &CorrelationMatrix) -> u32 {
        let candidates = self
            .metrics
            .keys()
            .copied()
            .filter(|&id| id != source_path);
        correlation
            .least_correlated(source_path, candidates)
            .unwrap_or(source_path)
    }

    /// Redundancy demanded by a path's loss, inflated for long RTTs where a
    /// retransmission round is costlier.
    fn estimate_required_redundancy(&self, metrics: &LinkMetrics) -> f64 {
        let base = metrics.loss_rate * 2.0;
        let rtt_factor = 1.0 + (metrics.rtt_ms / 200.0) * 0.3;
        (base * rtt_factor).clamp(self.min_rate, self.max_rate)
    }
}

/// Map a target redundancy rate onto concrete `(k, m)`.
///
/// Baseline `k = 8`; low rates stretch the group to `k = 10`, high rates
/// shrink it to `k = 4` so repair latency stays bounded. `m` is the rounded-
/// up product, kept within `[1, k]`.
fn rate_to_params(rate: f64) -> (u32, u32) {
    let k: u32 = if rate < 0.2 {
        10
    } else if rate > 0.6 {
        4
    } else {
        8
    };
    let m = (k as f64 * rate).ceil() as u32;
    (k, m.clamp(1, k))
}
