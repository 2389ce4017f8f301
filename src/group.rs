//! Sender-side encoding group management.
//!
//! Source blocks accumulate into the current group until it holds `k` of
//! them, at which point the group is sealed: the codec produces the `m`
//! repair blocks and the group is retained for emission and for answering
//! retransmission-era lookups until the cleanup horizon passes it.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::codec::BlockCodec;
use crate::frame::FecFrame;
use crate::pool::BlockPool;
use crate::{Error, Result};

/// Immutable identity of an encoding group, fixed at creation.
///
/// Rate changes apply to subsequent groups only; a sealed group keeps the
/// `(k, m)` it was born with.
#[derive(Debug, Clone)]
pub struct FecGroupInfo {
    /// Monotonically increasing, unique per sender.
    pub group_id: u64,
    /// Source blocks per group.
    pub k: u32,
    /// Repair blocks per group.
    pub m: u32,
    /// Length of every block in the group.
    pub block_size: usize,
    /// Creation instant, used for the flush-on-age-out policy.
    pub created_at: Instant,
}

impl FecGroupInfo {
    /// Total blocks (`k + m`).
    pub fn total_blocks(&self) -> u32 {
        self.k + self.m
    }
}

/// A sender-side group: open while accumulating, sealed once encoded.
#[derive(Debug)]
pub struct EncodingGroup {
    pub info: FecGroupInfo,
    /// Ordered source blocks, each exactly `block_size` bytes; at most `k`.
    pub source_blocks: Vec<Vec<u8>>,
    /// Empty until sealed, then exactly `m` blocks.
    pub repair_blocks: Vec<Vec<u8>>,
    /// Set once the codec has run; sealed groups never change again.
    pub sealed: bool,
}

impl EncodingGroup {
    fn new(info: FecGroupInfo) -> Self {
        let k = info.k as usize;
        Self {
            info,
            source_blocks: Vec::with_capacity(k),
            repair_blocks: Vec::new(),
            sealed: false,
        }
    }

    /// Time since the group was created.
    pub fn age(&self) -> Duration {
        self.info.created_at.elapsed()
    }

    /// Wire frames for the whole group: sources `0..k` in index order, then
    /// repairs `k..k+m`.
    pub fn frames(&self) -> Vec<FecFrame> {
        let total = self.info.total_blocks();
        let mut frames = Vec::with_capacity(total as usize);
        for (i, block) in self.source_blocks.iter().enumerate() {
            frames.push(FecFrame::source(
                self.info.group_id,
                i as u32,
                total,
                block.clone(),
            ));
        }
        for (r, block) in self.repair_blocks.iter().enumerate() {
            frames.push(FecFrame::repair(
                self.info.group_id,
                self.info.k + r as u32,
                total,
                block.clone(),
            ));
        }
        frames
    }
}

/// Accumulates source blocks into groups and drives the codec.
#[derive(Debug)]
pub struct GroupManager {
    k: u32,
    m: u32,
    block_size: usize,
    codec: BlockCodec,
    pool: BlockPool,
    current: EncodingGroup,
    sealed: BTreeMap<u64, EncodingGroup>,
    next_group_id: u64,
    encode_time_total: Duration,
    encode_count: u64,
}

impl GroupManager {
    /// Create a manager with the given initial rate and block size.
    pub fn new(k: u32, m: u32, block_size: usize) -> Result<Self> {
        let codec = BlockCodec::new(k, m, block_size)?;
        let manager = Self {
            k,
            m,
            block_size,
            codec,
            pool: BlockPool::new(block_size, 64),
            current: EncodingGroup::new(FecGroupInfo {
                group_id: 1,
                k,
                m,
                block_size,
                created_at: Instant::now(),
            }),
            sealed: BTreeMap::new(),
            next_group_id: 2,
            encode_time_total: Duration::ZERO,
            encode_count: 0,
        };
        info!(k, m, block_size, "group manager initialized");
        Ok(manager)
    }

    /// Current coding parameters `(k, m)`.
    pub fn coding_params(&self) -> (u32, u32) {
        (self.k, self.m)
    }

    /// Block size every group uses.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Id of the open group.
    pub fn current_group_id(&self) -> u64 {
        self.current.info.group_id
    }

    /// Blocks accumulated in the open group so far.
    pub fn current_len(&self) -> usize {
        self.current.source_blocks.len()
    }

    /// Age of the open group.
    pub fn current_age(&self) -> Duration {
        self.current.age()
    }

    /// Number of sealed groups currently retained.
    pub fn sealed_len(&self) -> usize {
        self.sealed.len()
    }

    /// Mean codec run time in microseconds across all seals so far.
    pub fn avg_encoding_time_us(&self) -> f64 {
        if self.encode_count == 0 {
            return 0.0;
        }
        self.encode_time_total.as_micros() as f64 / self.encode_count as f64
    }

    /// Append one source block to the open group.
    ///
    /// `data` may be shorter than the block size and is zero-padded; longer
    /// input is rejected with [`Error::BlockSizeMismatch`]. Returns the group
    /// id when this block completed the group and triggered encoding.
    pub fn add_source(&mut self, data: &[u8]) -> Result<Option<u64>> {
        if data.len() > self.block_size {
            return Err(Error::BlockSizeMismatch {
                expected: self.block_size,
                got: data.len(),
            });
        }

        let mut block = self.pool.alloc();
        block[..data.len()].copy_from_slice(data);
        self.current.source_blocks.push(block);

        debug!(
            group_id = self.current.info.group_id,
            filled = self.current.source_blocks.len(),
            k = self.current.info.k,
            "source block queued"
        );

        if self.current.source_blocks.len() >= self.current.info.k as usize {
            let id = self.seal_current()?;
            return Ok(Some(id));
        }
        Ok(None)
    }

    /// Seal the open group even if it is short, padding the missing source
    /// blocks with zeros. A no-op on an empty group.
    pub fn flush(&mut self) -> Vec<u64> {
        if self.current.source_blocks.is_empty() {
            return Vec::new();
        }
        match self.seal_current() {
            Ok(id) => {
                info!(group_id = id, "flushed incomplete group");
                vec![id]
            }
            Err(err) => {
                // Encoding over zero-padded blocks cannot fail for a rate the
                // constructor accepted; surface it in the log regardless.
                tracing::error!(%err, "flush failed to seal group");
                Vec::new()
            }
        }
    }

    /// Change the rate for future groups, implicitly flushing the open group
    /// under its original rate first. Returns any group ids flushed.
    pub fn update_rate(&mut self, k: u32, m: u32) -> Result<Vec<u64>> {
        if k == self.k && m == self.m {
            return Ok(Vec::new());
        }
        let codec = BlockCodec::new(k, m, self.block_size)?;

        let flushed = self.flush();
        info!(
            old_k = self.k,
            old_m = self.m,
            k,
            m,
            "coding rate updated"
        );
        self.k = k;
        self.m = m;
        self.codec = codec;
        // The open (empty) group was created under the old rate; restart it.
        self.current = self.fresh_group();
        Ok(flushed)
    }

    /// Sealed group lookup.
    pub fn get(&self, group_id: u64) -> Option<&EncodingGroup> {
        self.sealed.get(&group_id)
    }

    /// Drop sealed groups with `group_id < before_id`, recycling their
    /// blocks.
    pub fn cleanup(&mut self, before_id: u64) {
        let keep = self.sealed.split_off(&before_id);
        let dropped = std::mem::replace(&mut self.sealed, keep);
        let count = dropped.len();
        for (_, group) in dropped {
            for block in group.source_blocks {
                self.pool.recycle(block);
            }
            for block in group.repair_blocks {
                self.pool.recycle(block);
            }
        }
        if count > 0 {
            debug!(before_id, count, "retired sealed groups");
        }
    }

    fn fresh_group(&mut self) -> EncodingGroup {
        let info = FecGroupInfo {
            group_id: self.next_group_id,
            k: self.k,
            m: self.m,
            block_size: self.block_size,
            created_at: Instant::now(),
        };
        self.next_group_id += 1;
        EncodingGroup::new(info)
    }

    fn seal_current(&mut self) -> Result<u64> {
        let fresh = self.fresh_group();
        let mut group = std::mem::replace(&mut self.current, fresh);

        while group.source_blocks.len() < group.info.k as usize {
            group.source_blocks.push(self.pool.alloc());
        }

        let mut repairs: Vec<Vec<u8>> = (0..group.info.m).map(|_| self.pool.alloc()).collect();
        let started = Instant::now();
        self.codec.encode_into(&group.source_blocks, &mut repairs)?;
        self.encode_time_total += started.elapsed();
        self.encode_count += 1;

        group.repair_blocks = repairs;
        group.sealed = true;

        let id = group.info.group_id;
        debug!(
            group_id = id,
            k = group.info.k,
            m = group.info.m,
            "group sealed and encoded"
        );
        self.sealed.insert(id, group);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_seals_at_k() {
        let mut manager = GroupManager::new(3, 2, 8).unwrap();
        assert_eq!(manager.add_source(&[1u8; 8]).unwrap(), None);
        assert_eq!(manager.add_source(&[2u8; 8]).unwrap(), None);
        assert_eq!(manager.add_source(&[3u8; 8]).unwrap(), Some(1));

        let group = manager.get(1).unwrap();
        assert!(group.sealed);
        assert_eq!(group.source_blocks.len(), 3);
        assert_eq!(group.repair_blocks.len(), 2);
        assert_eq!(manager.current_group_id(), 2);
    }

    #[test]
    fn test_group_ids_strictly_monotonic() {
        let mut manager = GroupManager::new(1, 1, 4).unwrap();
        let mut last = 0;
        for i in 0..5 {
            let id = manager.add_source(&[i as u8; 4]).unwrap().unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn test_short_block_zero_padded() {
        let mut manager = GroupManager::new(1, 1, 8).unwrap();
        let id = manager.add_source(&[0xAB, 0xCD]).unwrap().unwrap();
        let group = manager.get(id).unwrap();
        assert_eq!(
            group.source_blocks[0],
            vec![0xAB, 0xCD, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn test_oversized_block_rejected() {
        let mut manager = GroupManager::new(2, 1, 8).unwrap();
        assert_eq!(
            manager.add_source(&[0u8; 9]),
            Err(Error::BlockSizeMismatch {
                expected: 8,
                got: 9
            })
        );
        assert_eq!(manager.current_len(), 0);
    }

    #[test]
    fn test_flush_pads_to_k() {
        let mut manager = GroupManager::new(4, 2, 8).unwrap();
        manager.add_source(&[1u8; 8]).unwrap();
        manager.add_source(&[2u8; 8]).unwrap();

        let flushed = manager.flush();
        assert_eq!(flushed, vec![1]);

        let group = manager.get(1).unwrap();
        assert_eq!(group.source_blocks.len(), 4);
        assert_eq!(group.source_blocks[2], vec![0u8; 8]);
        assert_eq!(group.source_blocks[3], vec![0u8; 8]);
        assert_eq!(group.repair_blocks.len(), 2);
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let mut manager = GroupManager::new(4, 2, 8).unwrap();
        assert!(manager.flush().is_empty());
        assert_eq!(manager.current_group_id(), 1);
    }

    #[test]
    fn test_update_rate_flushes_under_old_rate() {
        let mut manager = GroupManager::new(4, 2, 8).unwrap();
        manager.add_source(&[7u8; 8]).unwrap();

        let flushed = manager.update_rate(8, 3).unwrap();
        assert_eq!(flushed, vec![1]);

        // The flushed group keeps its original rate.
        let group = manager.get(1).unwrap();
        assert_eq!((group.info.k, group.info.m), (4, 2));
        assert_eq!(group.source_blocks.len(), 4);

        // Future groups use the new rate.
        assert_eq!(manager.coding_params(), (8, 3));
        for i in 0..7 {
            assert_eq!(manager.add_source(&[i as u8; 8]).unwrap(), None);
        }
        let id = manager.add_source(&[9u8; 8]).unwrap().unwrap();
        let group = manager.get(id).unwrap();
        assert_eq!((group.info.k, group.info.m), (8, 3));
    }

    #[test]
    fn test_update_rate_rejects_invalid() {
        let mut manager = GroupManager::new(4, 2, 8).unwrap();
        assert!(manager.update_rate(0, 2).is_err());
        assert_eq!(manager.coding_params(), (4, 2));
    }

    #[test]
    fn test_same_rate_update_keeps_group_open() {
        let mut manager = GroupManager::new(4, 2, 8).unwrap();
        manager.add_source(&[1u8; 8]).unwrap();
        assert!(manager.update_rate(4, 2).unwrap().is_empty());
        assert_eq!(manager.current_len(), 1);
    }

    #[test]
    fn test_cleanup_drops_old_groups() {
        let mut manager = GroupManager::new(1, 1, 4).unwrap();
        for i in 0..6 {
            manager.add_source(&[i as u8; 4]).unwrap();
        }
        assert_eq!(manager.sealed_len(), 6);

        manager.cleanup(4);
        assert_eq!(manager.sealed_len(), 3);
        assert!(manager.get(3).is_none());
        assert!(manager.get(4).is_some());
    }

    #[test]
    fn test_frames_emitted_in_index_order() {
        let mut manager = GroupManager::new(3, 2, 4).unwrap();
        for i in 0..3 {
            manager.add_source(&[i as u8 + 1; 4]).unwrap();
        }
        let frames = manager.get(1).unwrap().frames();
        assert_eq!(frames.len(), 5);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.header.block_index, i as u32);
            assert_eq!(frame.header.total_blocks, 5);
            assert_eq!(frame.is_repair(), i >= 3);
        }
    }

    #[test]
    fn test_encoding_time_tracked() {
        let mut manager = GroupManager::new(2, 1, 1200).unwrap();
        manager.add_source(&[1u8; 1200]).unwrap();
        manager.add_source(&[2u8; 1200]).unwrap();
        assert!(manager.avg_encoding_time_us() >= 0.0);
        assert_eq!(manager.encode_count, 1);
    }
}
