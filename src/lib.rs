//! # mpfec: Multipath FEC Transport Accelerator
//!
//! `mpfec` delivers application byte streams with low tail latency over two or
//! more concurrent network paths by fusing a systematic MDS erasure code with
//! a multipath packet scheduler. Instead of waiting for retransmissions, the
//! sender proactively injects repair blocks and dispatches source and repair
//! packets along paths whose loss events are as statistically independent as
//! possible.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                      FecController                         │
//! ├────────────────────────────────────────────────────────────┤
//! │  GroupManager ──→ BlockCodec          PathScheduler        │
//! │       │                                    │               │
//! │  PacketNumberMapper     RedundancyController (OCO)         │
//! │       │                                    │               │
//! │       └──────── CorrelationMatrix ─────────┘               │
//! └────────────────────────────────────────────────────────────┘
//!                  │ FecFrame (25-byte header + block)
//!                  ▼
//!          MultipathTransport (host-provided)
//! ```
//!
//! On send, stream data is sliced into fixed-size blocks and accumulated into
//! encoding groups of `k` blocks. When a group fills (or ages out), the codec
//! produces `m` repair blocks, the redundancy controller picks the paths, and
//! the controller emits `k + m` frames with per-path packet numbers. On
//! receive, frames are slotted into their group until any `k` distinct blocks
//! are present, at which point the missing source blocks are recovered
//! exactly.
//!
//! The rate `(k, m)` is not static: an online-convex-optimization controller
//! re-derives it from per-path loss, RTT and bandwidth every periodic tick,
//! and a loss-correlation matrix steers repair traffic onto the path least
//! correlated with the source path.
//!
//! ## Example
//!
//! ```rust
//! use mpfec::{FecConfig, FecController, PathState};
//!
//! let mut ctl = FecController::new(FecConfig::default()).unwrap();
//! ctl.add_path(0, PathState::new(0, 20.0, 0.01, 100.0));
//! ctl.add_path(1, PathState::new(1, 35.0, 0.05, 50.0));
//! ctl.update_loss_correlation(0, 1, 0.2);
//!
//! // 4 * 1200 bytes fills one group with the default rate (k=4, m=2).
//! let packets = ctl.send_stream_data(&[0u8; 4800], 0).unwrap();
//! assert_eq!(packets.len(), 6); // 4 source + 2 repair frames
//! ```
//!
//! The core is strictly synchronous and performs no I/O of its own; the host
//! owns the event loop and drives [`FecController::periodic_update`] on a
//! timer. See [`transport::MultipathTransport`] for the capability the host
//! supplies and [`session::FecSession`] for the glue binding both together.

use std::time::Duration;

use thiserror::Error;

pub mod codec;
pub mod controller;
pub mod correlation;
pub mod frame;
pub mod gf;
pub mod group;
pub mod mapper;
pub mod pool;
pub mod recover;
pub mod redundancy;
pub mod scheduler;
pub mod session;
pub mod transport;

#[cfg(test)]
mod tests;

pub use codec::BlockCodec;
pub use controller::{FecController, SendPacketMeta, Statistics};
pub use correlation::CorrelationMatrix;
pub use frame::{FecFrame, FrameHeader, FrameType};
pub use group::{EncodingGroup, FecGroupInfo, GroupManager};
pub use mapper::{PacketMapping, PacketNumberMapper};
pub use recover::GroupReceiver;
pub use redundancy::{FecStrategy, LinkMetrics, RedundancyController, RedundancyDecision};
pub use scheduler::{PathScheduler, PathState};
pub use session::FecSession;
pub use transport::{MultipathTransport, PathEvent};

/// Largest permitted total block count (`k + m`) per encoding group.
///
/// Block positions double as GF(2^8) evaluation points in the codec's
/// generator matrix, so a group can never span more than 255 blocks.
pub const MAX_TOTAL_BLOCKS: u32 = 255;

/// Error type for all fallible operations in this crate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Fewer than `k` distinct blocks were available for decoding.
    #[error("insufficient blocks for decoding: have {have}, need {need}")]
    InsufficientBlocks { have: usize, need: usize },

    /// The same block index was supplied more than once to the decoder.
    #[error("duplicate block index {0}")]
    DuplicateIndex(u32),

    /// Frame shorter than the fixed 25-byte header.
    #[error("short frame header: {0} bytes")]
    ShortHeader(usize),

    /// Frame shorter than header plus the advertised payload length.
    #[error("short frame payload: expected {expected} bytes, have {have}")]
    ShortPayload { expected: usize, have: usize },

    /// The frame type byte is neither source (0xF0) nor repair (0xF1).
    #[error("unknown frame type byte 0x{0:02x}")]
    UnknownFrameType(u8),

    /// Every known path is unusable (loss too high or bandwidth too low).
    #[error("no paths available for transmission")]
    NoPathsAvailable,

    /// Invalid coding rate: `k` and `m` must be at least 1 and `k + m` at
    /// most 255.
    #[error("invalid coding rate: k={k}, m={m}")]
    InvalidRate { k: u32, m: u32 },

    /// A block did not have the expected length.
    #[error("block size mismatch: expected {expected} bytes, got {got}")]
    BlockSizeMismatch { expected: usize, got: usize },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration for a [`FecController`].
#[derive(Debug, Clone)]
pub struct FecConfig {
    /// Default number of source blocks per encoding group.
    pub k: u32,

    /// Default number of repair blocks per encoding group.
    pub m: u32,

    /// Block size in bytes. Every block in a group has exactly this length;
    /// short trailing blocks are zero-padded.
    pub block_size: usize,

    /// Minimum interval between effective [`FecController::periodic_update`]
    /// runs. Calls arriving earlier are no-ops.
    pub update_interval: Duration,

    /// Age after which a partially filled group is sealed with zero padding.
    pub flush_age: Duration,

    /// Number of retained sealed groups that triggers a cleanup pass.
    pub group_retention: usize,

    /// Number of most recent groups kept alive by a cleanup pass.
    pub cleanup_keep: u64,

    /// Number of per-path send outcomes tracked for the sliding loss rate.
    pub loss_window: usize,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            k: 4,
            m: 2,
            block_size: 1200,
            update_interval: Duration::from_millis(100),
            flush_age: Duration::from_millis(200),
            group_retention: 1000,
            cleanup_keep: 500,
            loss_window: 256,
        }
    }
}

impl FecConfig {
    /// Profile for latency-critical traffic (VoIP, interactive video).
    ///
    /// Small groups seal quickly and the 50% baseline redundancy absorbs a
    /// loss burst without waiting for the next group.
    pub fn low_latency() -> Self {
        Self {
            k: 4,
            m: 2,
            flush_age: Duration::from_millis(50),
            ..Self::default()
        }
    }

    /// Profile for bulk transfer: larger groups amortize repair overhead.
    pub fn high_throughput() -> Self {
        Self {
            k: 10,
            m: 2,
            block_size: 1400,
            flush_age: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Validate the coding parameters.
    ///
    /// Surfaces [`Error::InvalidRate`] or [`Error::BlockSizeMismatch`]
    /// without mutating anything.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 || self.m == 0 || self.k + self.m > MAX_TOTAL_BLOCKS {
            return Err(Error::InvalidRate {
                k: self.k,
                m: self.m,
            });
        }
        if self.block_size == 0 {
            return Err(Error::BlockSizeMismatch {
                expected: 1,
                got: 0,
            });
        }
        Ok(())
    }
}
