//! Packet-number to encoding-group mapping.
//!
//! Each path runs its own packet-number space, so an ACK or loss report for
//! `(path, packet_number)` has to be translated back to the logical block it
//! carried. The mapper maintains the forward index for that lookup and a
//! per-group index so a whole group's packets can be found when the group is
//! retired.

use std::collections::HashMap;

use tracing::debug;

/// One emitted packet's place in the FEC universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMapping {
    /// Encoding group the packet belongs to.
    pub group_id: u64,
    /// Block index within the group, `0..k+m`.
    pub block_index: u32,
    /// Path the packet was emitted on.
    pub path_id: u32,
    /// Per-path packet number assigned at emission.
    pub packet_number: u64,
    /// Whether the packet carried a repair block.
    pub is_repair: bool,
}

/// Bidirectional mapping between `(path, packet_number)` and group blocks.
#[derive(Debug, Default)]
pub struct PacketNumberMapper {
    by_packet: HashMap<(u32, u64), PacketMapping>,
    by_group: HashMap<u64, Vec<PacketMapping>>,
}

impl PacketNumberMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.by_packet.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_packet.is_empty()
    }

    /// Record an emitted packet in both indices.
    pub fn add(
        &mut self,
        group_id: u64,
        block_index: u32,
        path_id: u32,
        packet_number: u64,
        is_repair: bool,
    ) {
        let mapping = PacketMapping {
            group_id,
            block_index,
            path_id,
            packet_number,
            is_repair,
        };
        self.by_packet.insert((path_id, packet_number), mapping);
        self.by_group.entry(group_id).or_default().push(mapping);
    }

    /// Look up the block a packet carried.
    pub fn lookup(&self, path_id: u32, packet_number: u64) -> Option<&PacketMapping> {
        self.by_packet.get(&(path_id, packet_number))
    }

    /// All packets emitted for a group, in emission order.
    pub fn lookup_group(&self, group_id: u64) -> &[PacketMapping] {
        self.by_group
            .get(&group_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Drop every mapping whose group is below the horizon, from both
    /// indices atomically.
    pub fn cleanup(&mut self, before_group_id: u64) {
        let by_packet = &mut self.by_packet;
        let mut dropped = 0usize;
        self.by_group.retain(|&group_id, mappings| {
            if group_id < before_group_id {
                for mapping in mappings.iter() {
                    by_packet.remove(&(mapping.path_id, mapping.packet_number));
                    dropped += 1;
                }
                false
            } else {
                true
            }
        });
        if dropped > 0 {
            debug!(before_group_id, dropped, "stale packet mappings removed");
        }
    }
}
