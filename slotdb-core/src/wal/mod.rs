//! Write-Ahead Log (WAL) implementation
//!
//! A WAL here is a fan-out queue rooted at a directory. One producer
//! appends framed records into fixed-size segment files; any number of named
//! consumers read the records independently and acknowledge them. The
//! consumer cursors live in a small `meta` page next to the segments.
//!
//! ```text
//! <dir>/
//!   segment-<base_seq>.log
//!   meta
//! ```

mod meta;
mod queue;
mod record;
mod segment;

pub use meta::{Cursor, MetaPage, META_FILE};
pub use queue::{Consumer, FanOutQueue};
pub(crate) use segment::sync_dir;

use serde::{Deserialize, Serialize};

/// WAL sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    #[default]
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync explicitly; segments are still synced on rollover
    None,
}

/// Queue options
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Segment size limit in bytes
    pub data_size_limit: u64,
    /// Sync policy
    pub sync_policy: SyncPolicy,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            data_size_limit: crate::config::WAL_DATA_SIZE_LIMIT_MB * 1024 * 1024,
            sync_policy: SyncPolicy::default(),
        }
    }
}
