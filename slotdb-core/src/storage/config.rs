//! Storage configuration
//!
//! Loaded from TOML by the server; every section falls back to its
//! defaults, so an empty file is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config;
use crate::types::timeutil::{ONE_HOUR, ONE_SECOND};
use crate::types::{Interval, TimeRange, Timestamp};
use crate::wal::{QueueOptions, SyncPolicy};
use crate::{Result, SlotError};

const MIB: u64 = 1024 * 1024;

/// Storage engine configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub tsdb: TsdbConfig,
    pub wal: WalConfig,
    pub write: WriteConfig,
    pub logging: LoggingConfig,
}

/// Memdb, flush and series limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsdbConfig {
    pub dir: PathBuf,
    pub max_memdb_size: u64,
    pub max_memdb_total_size: u64,
    pub max_memdb_number: usize,
    #[serde(with = "duration")]
    pub mutable_memdb_ttl: Duration,
    pub max_mem_usage_before_flush: f64,
    pub target_mem_usage_after_flush: f64,
    pub flush_concurrency: usize,
    pub max_series_ids: u32,
    pub max_tag_keys: usize,
    #[serde(with = "duration")]
    pub accept_ahead: Duration,
    #[serde(with = "duration")]
    pub accept_behind: Duration,
    #[serde(with = "duration")]
    pub family_width: Duration,
    #[serde(with = "duration")]
    pub interval: Duration,
    pub table_cache_size: usize,
}

impl Default for TsdbConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/storage/data"),
            max_memdb_size: config::MAX_MEMDB_SIZE,
            max_memdb_total_size: config::MAX_MEMDB_TOTAL_SIZE,
            max_memdb_number: config::MAX_MEMDB_NUMBER,
            mutable_memdb_ttl: config::MUTABLE_MEMDB_TTL,
            max_mem_usage_before_flush: config::MAX_MEM_USAGE_BEFORE_FLUSH,
            target_mem_usage_after_flush: config::TARGET_MEM_USAGE_AFTER_FLUSH,
            flush_concurrency: default_flush_concurrency(),
            max_series_ids: config::MAX_SERIES_IDS,
            max_tag_keys: config::MAX_TAG_KEYS,
            accept_ahead: Duration::from_millis(ONE_HOUR as u64),
            accept_behind: Duration::from_millis(ONE_HOUR as u64),
            family_width: Duration::from_millis(ONE_HOUR as u64),
            interval: Duration::from_millis(10 * ONE_SECOND as u64),
            table_cache_size: config::TABLE_CACHE_SIZE,
        }
    }
}

impl TsdbConfig {
    pub fn family_width_millis(&self) -> i64 {
        self.family_width.as_millis() as i64
    }

    pub fn interval(&self) -> Result<Interval> {
        Interval::from_millis(self.interval.as_millis() as i64)
    }

    pub fn accept_ahead_millis(&self) -> i64 {
        self.accept_ahead.as_millis() as i64
    }

    pub fn accept_behind_millis(&self) -> i64 {
        self.accept_behind.as_millis() as i64
    }

    pub fn accept_window(&self) -> AcceptWindow {
        AcceptWindow {
            ahead: self.accept_ahead_millis(),
            behind: self.accept_behind_millis(),
        }
    }
}

/// Timestamps a node accepts relative to its clock:
/// `[now - ahead, now + behind]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptWindow {
    pub ahead: i64,
    pub behind: i64,
}

impl AcceptWindow {
    pub fn range(&self, now: Timestamp) -> TimeRange {
        TimeRange::new(now.saturating_sub(self.ahead), now.saturating_add(self.behind))
    }

    pub fn check(&self, ts: Timestamp, now: Timestamp) -> Result<()> {
        let range = self.range(now);
        if range.contains(ts) {
            Ok(())
        } else {
            Err(SlotError::OutOfAcceptRange {
                timestamp: ts,
                start: range.start,
                end: range.end,
            })
        }
    }
}

fn default_flush_concurrency() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    cpus.div_ceil(2).max(1)
}

/// Write-ahead log settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    pub dir: PathBuf,
    /// Segment size in MiB, clamped to [1, 1024]
    pub data_size_limit: u64,
    #[serde(with = "duration")]
    pub remove_task_interval: Duration,
    pub sync_policy: SyncPolicy,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/storage/wal"),
            data_size_limit: config::WAL_DATA_SIZE_LIMIT_MB,
            remove_task_interval: config::WAL_REMOVE_TASK_INTERVAL,
            sync_policy: SyncPolicy::default(),
        }
    }
}

impl WalConfig {
    /// Segment size in bytes after clamping
    pub fn data_size_limit_bytes(&self) -> u64 {
        self.data_size_limit.clamp(1, 1024) * MIB
    }

    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            data_size_limit: self.data_size_limit_bytes(),
            sync_policy: self.sync_policy,
        }
    }
}

/// Ingest batching and replication settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteConfig {
    #[serde(with = "duration")]
    pub batch_timeout: Duration,
    pub batch_block_size: usize,
    pub max_retry_buf: usize,
}

impl Default for WriteConfig {
    fn default() -> Self {
        Self {
            batch_timeout: config::BATCH_TIMEOUT,
            batch_block_size: config::BATCH_BLOCK_SIZE,
            max_retry_buf: config::MAX_RETRY_BUF,
        }
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl StorageConfig {
    /// Replace zero values with defaults and reject unusable settings
    pub fn validate(&mut self) -> Result<()> {
        let tsdb = TsdbConfig::default();
        if self.tsdb.dir.as_os_str().is_empty() {
            return Err(SlotError::Config("tsdb.dir must not be empty".into()));
        }
        if self.tsdb.max_memdb_size == 0 {
            self.tsdb.max_memdb_size = tsdb.max_memdb_size;
        }
        if self.tsdb.max_memdb_total_size == 0 {
            self.tsdb.max_memdb_total_size = tsdb.max_memdb_total_size;
        }
        if self.tsdb.max_memdb_number == 0 {
            self.tsdb.max_memdb_number = tsdb.max_memdb_number;
        }
        if self.tsdb.mutable_memdb_ttl.is_zero() {
            self.tsdb.mutable_memdb_ttl = tsdb.mutable_memdb_ttl;
        }
        if self.tsdb.max_mem_usage_before_flush <= 0.0 || self.tsdb.max_mem_usage_before_flush > 1.0 {
            self.tsdb.max_mem_usage_before_flush = tsdb.max_mem_usage_before_flush;
        }
        if self.tsdb.target_mem_usage_after_flush <= 0.0
            || self.tsdb.target_mem_usage_after_flush >= self.tsdb.max_mem_usage_before_flush
        {
            self.tsdb.target_mem_usage_after_flush = tsdb
                .target_mem_usage_after_flush
                .min(self.tsdb.max_mem_usage_before_flush * 0.8);
        }
        if self.tsdb.flush_concurrency == 0 {
            self.tsdb.flush_concurrency = tsdb.flush_concurrency;
        }
        if self.tsdb.max_series_ids == 0 {
            self.tsdb.max_series_ids = tsdb.max_series_ids;
        }
        if self.tsdb.max_tag_keys == 0 {
            self.tsdb.max_tag_keys = tsdb.max_tag_keys;
        }
        if self.tsdb.accept_ahead.is_zero() {
            self.tsdb.accept_ahead = tsdb.accept_ahead;
        }
        if self.tsdb.accept_behind.is_zero() {
            self.tsdb.accept_behind = tsdb.accept_behind;
        }
        if self.tsdb.family_width.is_zero() {
            self.tsdb.family_width = tsdb.family_width;
        }
        if self.tsdb.interval.is_zero() {
            self.tsdb.interval = tsdb.interval;
        }
        if self.tsdb.interval > self.tsdb.family_width {
            return Err(SlotError::Config(format!(
                "tsdb.interval {:?} exceeds tsdb.family_width {:?}",
                self.tsdb.interval, self.tsdb.family_width
            )));
        }
        if self.tsdb.family_width_millis() / self.tsdb.interval.as_millis().max(1) as i64 > u16::MAX as i64 + 1 {
            return Err(SlotError::Config("family holds more than 65536 slots".into()));
        }
        if self.tsdb.table_cache_size == 0 {
            self.tsdb.table_cache_size = tsdb.table_cache_size;
        }

        let wal = WalConfig::default();
        if self.wal.dir.as_os_str().is_empty() {
            self.wal.dir = wal.dir;
        }
        self.wal.data_size_limit = self.wal.data_size_limit.clamp(1, 1024);
        if self.wal.remove_task_interval.is_zero() {
            self.wal.remove_task_interval = wal.remove_task_interval;
        }

        let write = WriteConfig::default();
        if self.write.batch_timeout.is_zero() {
            self.write.batch_timeout = write.batch_timeout;
        }
        if self.write.batch_block_size == 0 {
            self.write.batch_block_size = write.batch_block_size;
        }
        if self.write.max_retry_buf == 0 {
            self.write.max_retry_buf = write.max_retry_buf;
        }
        Ok(())
    }
}

/// Durations as integer seconds or strings such as `500ms`, `10s`, `30m`, `1h`
pub mod duration {
    use std::time::Duration;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = value.as_millis();
        if ms % 1000 == 0 {
            serializer.serialize_str(&format!("{}s", ms / 1000))
        } else {
            serializer.serialize_str(&format!("{ms}ms"))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        struct DurationVisitor;

        impl<'de> Visitor<'de> for DurationVisitor {
            type Value = Duration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("seconds or a string with a ms|s|m|h suffix")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Duration, E> {
                Ok(Duration::from_secs(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Duration, E> {
                u64::try_from(v)
                    .map(Duration::from_secs)
                    .map_err(|_| E::custom(format!("negative duration {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Duration, E> {
                parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }

    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("duration {s:?} has no unit"))?;
        let (num, unit) = s.split_at(split);
        let n: u64 = num.parse().map_err(|_| format!("bad duration {s:?}"))?;
        match unit {
            "ms" => Ok(Duration::from_millis(n)),
            "s" => Ok(Duration::from_secs(n)),
            "m" => Ok(Duration::from_secs(n * 60)),
            "h" => Ok(Duration::from_secs(n * 3600)),
            _ => Err(format!("unknown duration unit {unit:?} in {s:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_parse() {
        assert_eq!(duration::parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(duration::parse("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(duration::parse("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(duration::parse("1h").unwrap(), Duration::from_secs(3600));
        assert!(duration::parse("12").is_err());
        assert!(duration::parse("3d").is_err());
    }

    #[test]
    fn test_validate_fills_defaults() {
        let mut config = StorageConfig::default();
        config.tsdb.max_memdb_number = 0;
        config.tsdb.mutable_memdb_ttl = Duration::ZERO;
        config.wal.data_size_limit = 4096;
        config.write.batch_block_size = 0;
        config.validate().unwrap();
        assert_eq!(config.tsdb.max_memdb_number, config::MAX_MEMDB_NUMBER);
        assert_eq!(config.tsdb.mutable_memdb_ttl, config::MUTABLE_MEMDB_TTL);
        assert_eq!(config.wal.data_size_limit, 1024);
        assert_eq!(config.write.batch_block_size, config::BATCH_BLOCK_SIZE);

        config.tsdb.dir = PathBuf::new();
        assert!(config.validate().is_err());

        let mut config = StorageConfig::default();
        config.tsdb.interval = Duration::from_secs(7200);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_accept_window() {
        let window = TsdbConfig::default().accept_window();
        let now = 10 * ONE_HOUR;
        assert!(window.check(now - ONE_HOUR, now).is_ok());
        assert!(window.check(now + ONE_HOUR, now).is_ok());
        assert!(matches!(
            window.check(now - ONE_HOUR - 1, now),
            Err(SlotError::OutOfAcceptRange { start, .. }) if start == 9 * ONE_HOUR
        ));
        assert!(window.check(now + ONE_HOUR + 1, now).is_err());
    }

    #[test]
    fn test_wal_size_clamp() {
        let wal = WalConfig {
            data_size_limit: 0,
            ..Default::default()
        };
        assert_eq!(wal.data_size_limit_bytes(), MIB);
        assert_eq!(WalConfig::default().data_size_limit_bytes(), 512 * MIB);
    }
}
