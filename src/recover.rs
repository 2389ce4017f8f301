//! Receive-side group reassembly and recovery.
//!
//! Frames arrive out of order, across paths, and possibly duplicated. Each
//! frame is slotted into its group by block index; once any `k` distinct
//! blocks are present the codec runs exactly once and the group moves to
//! `Recovered` (or `Abandoned` on decode failure). Late frames for finished
//! groups are dropped.
//!
//! The wire header carries `total_blocks = k + m` but not `k` itself, so the
//! receiver infers `k` from frame-type evidence: every source index is below
//! `k` and every repair index at least `k`, and the sender keeps
//! `1 <= m <= k`. When the resulting interval still contains more than one
//! candidate, the sender's default 2:1 shape breaks the tie.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use crate::codec::BlockCodec;
use crate::frame::FecFrame;

/// Lifecycle of a receive-side group. Transitions are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupState {
    Collecting,
    Recovered,
    Abandoned,
}

#[derive(Debug)]
struct ReceivedGroup {
    total_blocks: u32,
    block_size: usize,
    /// block index -> payload
    blocks: BTreeMap<u32, Vec<u8>>,
    /// Highest source index seen; `k` must exceed it.
    max_source_index: Option<u32>,
    /// Lowest repair index seen; `k` cannot exceed it.
    min_repair_index: Option<u32>,
    state: GroupState,
}

impl ReceivedGroup {
    fn new(total_blocks: u32, block_size: usize) -> Self {
        Self {
            total_blocks,
            block_size,
            blocks: BTreeMap::new(),
            max_source_index: None,
            min_repair_index: None,
            state: GroupState::Collecting,
        }
    }

    /// Infer `(k, m)` from the evidence gathered so far.
    fn inferred_rate(&self) -> (u32, u32) {
        let total = self.total_blocks.max(2);
        // k > max source index, k <= min repair index, 1 <= m <= k.
        let lo = self
            .max_source_index
            .map_or(1, |i| i + 1)
            .max((total + 1) / 2);
        let hi = self.min_repair_index.unwrap_or(total - 1).min(total - 1);
        let k = if lo >= hi {
            hi.max(1)
        } else {
            ((total * 2) / 3).clamp(lo, hi)
        };
        (k, total - k)
    }
}

/// Receive-side mirror of the group manager.
#[derive(Debug, Default)]
pub struct GroupReceiver {
    groups: HashMap<u64, ReceivedGroup>,
    /// Codec cache keyed by rate; rates repeat far more often than groups.
    codecs: HashMap<(u32, u32, usize), BlockCodec>,
    /// Cumulative count of source blocks reconstructed by decode.
    recovered_blocks: u64,
    highest_group_id: u64,
}

impl GroupReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of groups currently tracked.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Highest group id observed so far.
    pub fn highest_group_id(&self) -> u64 {
        self.highest_group_id
    }

    /// Cumulative source blocks handed back by successful decodes.
    pub fn recovered_blocks(&self) -> u64 {
        self.recovered_blocks
    }

    /// Insert one frame and attempt recovery.
    ///
    /// Returns the group's `k` source blocks in index order on the first
    /// successful decode, and an empty vector otherwise. Duplicate frames
    /// and frames for finished groups are silently dropped.
    pub fn on_frame(&mut self, frame: FecFrame) -> Vec<Vec<u8>> {
        // Ungrouped passthrough frame (sender had FEC disabled): deliver the
        // payload as-is, no group state.
        if frame.header.total_blocks <= 1 && frame.is_source() {
            return vec![frame.payload];
        }

        let group_id = frame.header.group_id;
        self.highest_group_id = self.highest_group_id.max(group_id);

        let (k, m, block_size) = {
            let group = self.groups.entry(group_id).or_insert_with(|| {
                ReceivedGroup::new(frame.header.total_blocks, frame.payload.len())
            });

            if group.state != GroupState::Collecting {
                debug!(group_id, "late frame for finished group dropped");
                return Vec::new();
            }
            if frame.payload.len() != group.block_size
                || frame.header.block_index >= group.total_blocks
            {
                warn!(
                    group_id,
                    block_index = frame.header.block_index,
                    "malformed frame for group dropped"
                );
                return Vec::new();
            }
            let index = frame.header.block_index;
            if group.blocks.contains_key(&index) {
                debug!(group_id, block_index = index, "duplicate frame dropped");
                return Vec::new();
            }

            if frame.is_source() {
                group.max_source_index =
                    Some(group.max_source_index.map_or(index, |i| i.max(index)));
            } else {
                group.min_repair_index =
                    Some(group.min_repair_index.map_or(index, |i| i.min(index)));
            }
            group.blocks.insert(index, frame.payload);

            let (k, m) = group.inferred_rate();
            if (group.blocks.len() as u32) < k {
                return Vec::new();
            }
            (k, m, group.block_size)
        };

        // Enough blocks: decode exactly once.
        let key = (k, m, block_size);
        if !self.codecs.contains_key(&key) {
            match BlockCodec::new(k, m, block_size) {
                Ok(codec) => {
                    self.codecs.insert(key, codec);
                }
                Err(err) => {
                    // total_blocks from the wire is untrusted; an unusable
                    // inferred rate means the group can never decode.
                    warn!(group_id, k, m, %err, "inferred rate unusable, abandoning group");
                    if let Some(group) = self.groups.get_mut(&group_id) {
                        group.state = GroupState::Abandoned;
                    }
                    return Vec::new();
                }
            }
        }

        let codec = match self.codecs.get(&key) {
            Some(codec) => codec,
            None => return Vec::new(),
        };
        let group = match self.groups.get_mut(&group_id) {
            Some(group) => group,
            None => return Vec::new(),
        };

        let shares: Vec<(u32, &[u8])> = group
            .blocks
            .iter()
            .map(|(&i, block)| (i, block.as_slice()))
            .collect();

        match codec.decode(&shares) {
            Ok(recovered) => {
                group.state = GroupState::Recovered;
                self.recovered_blocks += recovered.len() as u64;
                info!(group_id, k, m, "group recovered");
                recovered
            }
            Err(err) => {
                warn!(group_id, %err, "decode failed, abandoning group");
                group.state = GroupState::Abandoned;
                Vec::new()
            }
        }
    }

    /// Drop all groups with `group_id < before_id`; groups still collecting
    /// move straight to abandoned.
    pub fn cleanup(&mut self, before_id: u64) {
        let before = self.groups.len();
        self.groups.retain(|&id, _| id >= before_id);
        let dropped = before - self.groups.len();
        if dropped > 0 {
            debug!(before_id, dropped, "receive groups retired");
        }
    }
}
