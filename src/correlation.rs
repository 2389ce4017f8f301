//! Inter-path loss-correlation matrix.
//!
//! ρ(i, j) ∈ [-1, 1] summarizes whether paths i and j tend to lose packets
//! jointly. Repair traffic is steered onto the path least correlated with
//! the source path, so a shared bottleneck cannot take out a group's source
//! and repair blocks together.

use std::collections::BTreeMap;

use tracing::debug;

/// Symmetric correlation matrix keyed by the canonical pair `(min, max)`.
///
/// Self-correlation is 1; absent entries default to 0 (independence).
#[derive(Debug, Clone, Default)]
pub struct CorrelationMatrix {
    entries: BTreeMap<(u32, u32), f64>,
}

impl CorrelationMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store ρ for a path pair, clamped to `[-1, 1]`.
    pub fn update(&mut self, path_i: u32, path_j: u32, rho: f64) {
        if path_i == path_j {
            return;
        }
        let rho = rho.clamp(-1.0, 1.0);
        self.entries.insert(canonical(path_i, path_j), rho);
        debug!(path_i, path_j, rho, "loss correlation updated");
    }

    /// ρ(i, j): 1 on the diagonal, the stored value, or 0 if unknown.
    pub fn get(&self, path_i: u32, path_j: u32) -> f64 {
        if path_i == path_j {
            return 1.0;
        }
        self.entries
            .get(&canonical(path_i, path_j))
            .copied()
            .unwrap_or(0.0)
    }

    /// The candidate minimizing `|ρ(path_id, c)|`, ties broken by ascending
    /// path id. `None` when `candidates` yields nothing.
    pub fn least_correlated<I>(&self, path_id: u32, candidates: I) -> Option<u32>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut best: Option<(f64, u32)> = None;
        for candidate in candidates {
            if candidate == path_id {
                continue;
            }
            let corr = self.get(path_id, candidate).abs();
            let better = match best {
                None => true,
                Some((best_corr, best_id)) => {
                    corr < best_corr || (corr == best_corr && candidate < best_id)
                }
            };
            if better {
                best = Some((corr, candidate));
            }
        }
        best.map(|(_, id)| id)
    }

    /// Forget every entry touching `path_id` (path removed).
    pub fn remove_path(&mut self, path_id: u32) {
        self.entries
            .retain(|&(a, b), _| a != path_id && b != path_id);
    }
}

fn canonical(path_i: u32, path_j: u32) -> (u32, u32) {
    (path_i.min(path_j), path_i.max(path_j))
}
