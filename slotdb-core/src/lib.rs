//! SlotDB Core - storage and replay engine of a column-oriented time-series database
//!
//! # Architecture
//!
//! - **WAL**: a fan-out queue per replication partition; the leader appends
//!   compressed row batches and every replica consumes them independently
//! - **MemDB**: per-family write buffer of slot-indexed value pages
//! - **Tables**: immutable column files, one metric block per metric,
//!   tracked per family by a versioned file set and merged by compaction
//! - **Tag index**: forward and inverted blocks per tag key, using a
//!   succinct LOUDS trie for tag values
//! - **Query contract**: filter result sets and data loaders consumed by the
//!   executor

pub mod bitmap;
pub mod compaction;
pub mod compression;
pub mod log_limiter;
pub mod memdb;
pub mod query;
pub mod replica;
pub mod sstable;
pub mod storage;
pub mod tagindex;
pub mod trie;
pub mod version;
pub mod wal;

mod error;
pub mod types;

pub use error::{Result, SlotError};
pub use types::*;

/// SlotDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// WAL segment size in MiB
    pub const WAL_DATA_SIZE_LIMIT_MB: u64 = 512;

    /// Interval of the WAL segment removal task
    pub const WAL_REMOVE_TASK_INTERVAL: Duration = Duration::from_secs(60);

    /// Maximum size of one memdb before it is frozen (500MB)
    pub const MAX_MEMDB_SIZE: u64 = 500 * 1024 * 1024;

    /// Maximum size of all memdbs of a shard (2GB)
    pub const MAX_MEMDB_TOTAL_SIZE: u64 = 2 * 1024 * 1024 * 1024;

    /// Maximum number of memdbs alive in a shard
    pub const MAX_MEMDB_NUMBER: usize = 5;

    /// Age at which a mutable memdb is frozen
    pub const MUTABLE_MEMDB_TTL: Duration = Duration::from_secs(30 * 60);

    /// Resident memory ratio that forces flushes
    pub const MAX_MEM_USAGE_BEFORE_FLUSH: f64 = 0.75;

    /// Resident memory ratio at which forced flushes stop
    pub const TARGET_MEM_USAGE_AFTER_FLUSH: f64 = 0.60;

    /// Series ids one shard may allocate
    pub const MAX_SERIES_IDS: u32 = 200_000;

    /// Tag keys one metric may carry
    pub const MAX_TAG_KEYS: usize = 32;

    /// Level 0 tables before compaction
    pub const L0_COMPACTION_TRIGGER: usize = 4;

    /// Open table readers per engine
    pub const TABLE_CACHE_SIZE: usize = 512;

    /// Consecutive flush failures before a family is degraded
    pub const MAX_FLUSH_FAILURES: u32 = 2;

    /// Grace period after a family's end before its partitions expire
    pub const PARTITION_EXPIRE_GRACE: Duration = Duration::from_secs(15 * 60);

    /// Time a family channel buffers rows before flushing
    pub const BATCH_TIMEOUT: Duration = Duration::from_secs(2);

    /// Size of one buffered row batch (256KB)
    pub const BATCH_BLOCK_SIZE: usize = 256 * 1024;

    /// Buffered batches per family channel
    pub const FAMILY_CHANNEL_CAPACITY: usize = 2;

    /// Send attempts of one batch before it is dropped
    pub const MAX_RETRY_BUF: usize = 100;

    /// Window of the data-path log limiter
    pub const LOG_LIMIT_WINDOW: Duration = Duration::from_secs(10);
}
