//! Storage engine - shards, data families and the tag index
//!
//! The [`Engine`] owns one [`Shard`] per `(database, shard id)` hosted on
//! this node. A shard holds an [`IntervalSegment`] of time-bucketed
//! [`DataFamily`]s, the [`IndexDatabase`] of its series and the write log
//! partitions that feed its families.

mod config;
mod engine;
mod family;
mod flush;
mod index;
mod kv;
mod segment;
mod shard;

pub use config::{duration, AcceptWindow, LoggingConfig, StorageConfig, TsdbConfig, WalConfig, WriteConfig};
pub use engine::Engine;
pub use family::{DataFamily, DataFamilyOptions};
pub use flush::{pick_families, FlushReason, MemoryWatcher};
pub use index::{IndexDatabase, IndexOptions};
pub use kv::KvFamily;
pub use segment::{IntervalSegment, SegmentOptions};
pub use shard::{Shard, ShardOptions};
