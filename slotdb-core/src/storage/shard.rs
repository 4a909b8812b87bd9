//! Shard: the families, tag index and write log partitions of one database
//! shard on this node
//!
//! ```text
//! <tsdb.dir>/<db>/shard-<id>/data/interval-<ms>/family-<time>/
//! <tsdb.dir>/<db>/shard-<id>/index/{forward,inverted,meta}/
//! <wal.dir>/<db>/shard-<id>/partition-<family time>-<leader>/
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::config::{AcceptWindow, StorageConfig};
use super::family::DataFamily;
use super::index::{IndexDatabase, IndexOptions};
use super::segment::{IntervalSegment, SegmentOptions};
use crate::log_limiter::LogLimiter;
use crate::query::{FilterContext, FilterResultSet};
use crate::replica::{FamilyLogReplicaState, Partition, PartitionOptions, StreamFactory};
use crate::types::{timeutil, NodeId, Row, ShardId, TaggedRow, TimeRange, Timestamp};
use crate::version::TableCache;
use crate::wal::QueueOptions;
use crate::Result;

const PARTITION_DIR_PREFIX: &str = "partition-";

/// Settings a shard takes from the engine
#[derive(Debug, Clone)]
pub struct ShardOptions {
    pub database: String,
    pub shard_id: ShardId,
    pub current_node: NodeId,
    pub segment: SegmentOptions,
    pub index: IndexOptions,
    pub window: AcceptWindow,
    pub queue: QueueOptions,
    pub max_retry_buf: usize,
}

impl ShardOptions {
    pub fn from_config(config: &StorageConfig, database: &str, shard_id: ShardId, current_node: NodeId) -> Result<Self> {
        Ok(Self {
            database: database.to_string(),
            shard_id,
            current_node,
            segment: SegmentOptions {
                family_width: config.tsdb.family_width_millis(),
                interval: config.tsdb.interval()?,
                max_memdb_size: config.tsdb.max_memdb_size,
                mutable_memdb_ttl: config.tsdb.mutable_memdb_ttl,
            },
            index: IndexOptions {
                max_series_ids: config.tsdb.max_series_ids,
                max_tag_keys: config.tsdb.max_tag_keys,
            },
            window: config.tsdb.accept_window(),
            queue: config.wal.queue_options(),
            max_retry_buf: config.write.max_retry_buf,
        })
    }
}

pub struct Shard {
    options: ShardOptions,
    dir: PathBuf,
    wal_dir: PathBuf,
    segment: IntervalSegment,
    index: IndexDatabase,
    partitions: RwLock<BTreeMap<(Timestamp, NodeId), Arc<Partition>>>,
    factory: Arc<dyn StreamFactory>,
    cancel: CancellationToken,
    limiter: LogLimiter,
}

impl Shard {
    /// Open the shard under `dir` with its partitions under `wal_dir`.
    /// Existing partitions are reopened and their replicators rebuilt.
    pub fn open(
        dir: &Path,
        wal_dir: &Path,
        options: ShardOptions,
        cache: Arc<TableCache>,
        factory: Arc<dyn StreamFactory>,
        parent: &CancellationToken,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        fs::create_dir_all(wal_dir)?;
        let interval = options.segment.interval;
        let segment = IntervalSegment::open(
            &dir.join("data").join(format!("interval-{}", interval.millis())),
            options.shard_id,
            options.segment,
            cache.clone(),
        )?;
        let index = IndexDatabase::open(&dir.join("index"), options.index, cache)?;
        let shard = Self {
            options,
            dir: dir.to_path_buf(),
            wal_dir: wal_dir.to_path_buf(),
            segment,
            index,
            partitions: RwLock::new(BTreeMap::new()),
            factory,
            cancel: parent.child_token(),
            limiter: LogLimiter::default(),
        };
        shard.recover_partitions()?;
        info!(
            database = %shard.options.database,
            shard = shard.options.shard_id,
            families = shard.segment.families().len(),
            partitions = shard.partitions.read().len(),
            "shard opened"
        );
        Ok(shard)
    }

    fn recover_partitions(&self) -> Result<()> {
        for entry in fs::read_dir(&self.wal_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some((family_time, leader)) = name.to_str().and_then(parse_partition_dir) else {
                continue;
            };
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let partition = self.get_or_create_partition(family_time, leader)?;
            partition.recovery()?;
        }
        Ok(())
    }

    pub fn database(&self) -> &str {
        &self.options.database
    }

    pub fn id(&self) -> ShardId {
        self.options.shard_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn segment(&self) -> &IntervalSegment {
        &self.segment
    }

    pub fn index(&self) -> &IndexDatabase {
        &self.index
    }

    /// Timestamps accepted as of `now`
    pub fn accept_range(&self, now: Timestamp) -> TimeRange {
        self.options.window.range(now)
    }

    pub fn check_accept(&self, ts: Timestamp) -> Result<()> {
        self.options.window.check(ts, timeutil::now())
    }

    /// Write rows straight into their families, bypassing replication.
    /// Rows outside the accept window are dropped; returns the rows written.
    pub fn write_rows(&self, rows: &[Row]) -> Result<usize> {
        let now = timeutil::now();
        let mut by_family: BTreeMap<Timestamp, Vec<Row>> = BTreeMap::new();
        for row in rows {
            if let Err(e) = self.options.window.check(row.timestamp, now) {
                crate::limited!(
                    self.limiter,
                    "accept",
                    warn,
                    database = %self.options.database,
                    shard = self.options.shard_id,
                    error = %e,
                    "drop row"
                );
                continue;
            }
            by_family
                .entry(self.segment.family_time(row.timestamp))
                .or_default()
                .push(row.clone());
        }
        let mut written = 0;
        for (family_time, rows) in by_family {
            written += self.segment.get_or_create_family(family_time)?.write_rows(&rows)?;
        }
        Ok(written)
    }

    /// Resolve the series of every row, then write them. A series or tag
    /// key limit fails the whole batch before any row reaches a memdb.
    pub fn write_tagged_rows(&self, rows: &[TaggedRow]) -> Result<usize> {
        let mut resolved = Vec::with_capacity(rows.len());
        for row in rows {
            let tags: Vec<(&str, &str)> = row.tags.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
            let series_id = self.index.get_or_create_series_id(row.metric_id, &tags)?;
            resolved.push(Row {
                metric_id: row.metric_id,
                series_id,
                timestamp: row.timestamp,
                fields: row.fields.clone(),
            });
        }
        self.write_rows(&resolved)
    }

    /// Result sets of every family overlapping the query range, in family
    /// time order
    pub fn filter(&self, ctx: &FilterContext) -> Result<Vec<FilterResultSet>> {
        let mut out = Vec::new();
        for family in self.segment.families_in(&ctx.time_range) {
            out.extend(family.filter(ctx)?);
        }
        Ok(out)
    }

    /// Partition of `(family_time, leader)`, opening its log and family
    pub fn get_or_create_partition(&self, family_time: Timestamp, leader: NodeId) -> Result<Arc<Partition>> {
        let family_time = self.segment.family_time(family_time);
        if let Some(p) = self.partition(family_time, leader) {
            return Ok(p);
        }
        let mut partitions = self.partitions.write();
        if let Some(p) = partitions.get(&(family_time, leader)) {
            return Ok(p.clone());
        }
        let family = self.segment.get_or_create_family(family_time)?;
        let partition = Arc::new(Partition::open(
            &self.wal_dir.join(partition_dir(family_time, leader)),
            PartitionOptions {
                database: self.options.database.clone(),
                shard_id: self.options.shard_id,
                current_node: self.options.current_node,
                leader,
                queue: self.options.queue.clone(),
                max_retry_buf: self.options.max_retry_buf,
                accept_ahead: self.options.window.ahead,
            },
            family,
            self.factory.clone(),
            &self.cancel,
        )?);
        partitions.insert((family_time, leader), partition.clone());
        Ok(partition)
    }

    pub fn partition(&self, family_time: Timestamp, leader: NodeId) -> Option<Arc<Partition>> {
        self.partitions.read().get(&(family_time, leader)).cloned()
    }

    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        self.partitions.read().values().cloned().collect()
    }

    /// Tell every partition that `leader` now leads the shard
    pub fn leader_changed(&self, leader: NodeId) {
        for partition in self.partitions() {
            partition.leader_changed(leader);
        }
    }

    pub fn replica_states(&self) -> Vec<FamilyLogReplicaState> {
        self.partitions().iter().map(|p| p.replica_state()).collect()
    }

    /// Destroy partitions whose consumers are drained and whose family can
    /// no longer receive writes. Returns the number removed.
    pub fn remove_expired_partitions(&self, now: Timestamp) -> usize {
        let expired: Vec<_> = {
            let mut partitions = self.partitions.write();
            let keys: Vec<_> = partitions
                .iter()
                .filter(|(_, p)| p.is_expired(now))
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter().filter_map(|k| partitions.remove(&k)).collect()
        };
        for partition in &expired {
            if let Err(e) = partition.destroy() {
                error!(
                    database = %self.options.database,
                    shard = self.options.shard_id,
                    family = partition.family_time(),
                    error = %e,
                    "failed to remove expired partition"
                );
            }
        }
        expired.len()
    }

    /// Unlink acknowledged log segments of every partition
    pub fn remove_expired_wal_segments(&self, ttl: Duration) -> usize {
        let mut removed = 0;
        for partition in self.partitions() {
            match partition.remove_expired_segments(ttl) {
                Ok(n) => removed += n,
                Err(e) => warn!(dir = ?partition.dir(), error = %e, "failed to remove WAL segments"),
            }
        }
        removed
    }

    pub fn families(&self) -> Vec<Arc<DataFamily>> {
        self.segment.families()
    }

    /// Memdb bytes of every family
    pub fn memdb_size(&self) -> u64 {
        self.families().iter().map(|f| f.memdb_size()).sum()
    }

    pub fn num_memdbs(&self) -> usize {
        self.families().iter().map(|f| f.num_memdbs()).sum()
    }

    /// Flush the index and every family holding memdbs.
    /// Returns the number of memdbs flushed.
    pub fn flush(&self) -> Result<usize> {
        self.index.flush()?;
        let mut flushed = 0;
        for family in self.families() {
            if family.num_memdbs() > 0 {
                flushed += family.flush()?;
            }
        }
        Ok(flushed)
    }

    /// Stop replication and persist the index
    pub fn close(&self) -> Result<()> {
        for partition in self.partitions() {
            if let Err(e) = partition.close() {
                warn!(dir = ?partition.dir(), error = %e, "failed to close partition");
            }
        }
        self.cancel.cancel();
        self.index.flush()
    }
}

fn partition_dir(family_time: Timestamp, leader: NodeId) -> String {
    format!("{PARTITION_DIR_PREFIX}{family_time}-{leader}")
}

fn parse_partition_dir(name: &str) -> Option<(Timestamp, NodeId)> {
    let rest = name.strip_prefix(PARTITION_DIR_PREFIX)?;
    // family times before the epoch carry a sign, so split at the last dash
    let (family_time, leader) = rest.rsplit_once('-')?;
    Some((family_time.parse().ok()?, leader.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{Chunk, NoopStreamFactory};
    use crate::types::timeutil::ONE_HOUR;
    use crate::types::{FieldMeta, FieldMetas, FieldType, Interval};
    use crate::SlotError;
    use roaring::RoaringBitmap;
    use std::time::Instant;
    use tempfile::TempDir;

    fn open(dir: &TempDir, node: NodeId) -> Shard {
        open_with(dir, node, |_| {})
    }

    fn open_with(dir: &TempDir, node: NodeId, tune: impl FnOnce(&mut StorageConfig)) -> Shard {
        let mut config = StorageConfig::default();
        tune(&mut config);
        config.tsdb.dir = dir.path().join("data");
        config.wal.dir = dir.path().join("wal");
        config.validate().unwrap();
        Shard::open(
            &dir.path().join("data/db/shard-1"),
            &dir.path().join("wal/db/shard-1"),
            ShardOptions::from_config(&config, "db", 1, node).unwrap(),
            Arc::new(TableCache::new(16)),
            Arc::new(NoopStreamFactory),
            &CancellationToken::new(),
        )
        .unwrap()
    }

    fn ctx(range: TimeRange) -> FilterContext {
        FilterContext {
            metric_id: 1,
            series_ids: [1u32].into_iter().collect::<RoaringBitmap>(),
            fields: [FieldMeta::new(1, FieldType::Sum)].into_iter().collect::<FieldMetas>(),
            time_range: range,
            interval: Interval::from_millis(10_000).unwrap(),
        }
    }

    fn row(ts: Timestamp) -> Row {
        Row::new(1, 1, ts).with_field(1, FieldType::Sum, 1.0)
    }

    #[test]
    fn test_partition_dir_names() {
        assert_eq!(parse_partition_dir(&partition_dir(3_600_000, 7)), Some((3_600_000, 7)));
        assert_eq!(parse_partition_dir(&partition_dir(-3_600_000, 2)), Some((-3_600_000, 2)));
        assert_eq!(parse_partition_dir("family-1"), None);
        assert_eq!(parse_partition_dir("partition-x-1"), None);
    }

    #[test]
    fn test_write_rows_checks_accept_window() {
        let dir = TempDir::new().unwrap();
        let shard = open(&dir, 1);
        let now = timeutil::now();
        assert!(shard.check_accept(now).is_ok());
        assert!(shard.check_accept(now - 2 * ONE_HOUR).is_err());
        let written = shard
            .write_rows(&[row(now), row(now - 10 * ONE_HOUR), row(now + 10 * ONE_HOUR)])
            .unwrap();
        assert_eq!(written, 1);
        let sets = shard.filter(&ctx(shard.accept_range(now))).unwrap();
        assert_eq!(sets.len(), 1);
    }

    #[test]
    fn test_tagged_rows_respect_series_limits() {
        let dir = TempDir::new().unwrap();
        let shard = open_with(&dir, 1, |c| {
            c.tsdb.max_series_ids = 2;
            c.tsdb.max_tag_keys = 1;
        });
        let now = timeutil::now();
        let tagged = |host: &str| TaggedRow::new(1, &[("host", host)], now).with_field(1, FieldType::Sum, 1.0);

        assert_eq!(shard.write_tagged_rows(&[tagged("a"), tagged("a")]).unwrap(), 2);
        assert_eq!(shard.num_memdbs(), 1);
        let before = shard.memdb_size();

        let wide = TaggedRow::new(2, &[("host", "a"), ("dc", "x")], now).with_field(1, FieldType::Sum, 1.0);
        let err = shard.write_tagged_rows(&[tagged("a"), wide]).unwrap_err();
        assert!(matches!(err, SlotError::TagKeysLimitExceeded { metric_id: 2, limit: 1 }));
        assert_eq!(shard.memdb_size(), before);

        // the second new series hits the limit, the first must not be written
        let err = shard.write_tagged_rows(&[tagged("b"), tagged("c")]).unwrap_err();
        assert!(matches!(err, SlotError::SeriesLimitExceeded { limit: 2 }));
        assert_eq!(shard.memdb_size(), before);

        // known series still write
        assert_eq!(shard.write_tagged_rows(&[tagged("b")]).unwrap(), 1);
        let host_a = shard.index().get_series_id(1, &[("host", "a")]).unwrap();
        let sets = shard.filter(&FilterContext {
            series_ids: [host_a].into_iter().collect(),
            ..ctx(shard.accept_range(now))
        });
        assert_eq!(sets.unwrap().len(), 1);
    }

    #[test]
    fn test_partitions_recover_on_open() {
        let dir = TempDir::new().unwrap();
        let now = timeutil::now();
        let family_time = timeutil::family_time(now, ONE_HOUR);
        {
            let shard = open(&dir, 1);
            let partition = shard.get_or_create_partition(now, 1).unwrap();
            assert_eq!(partition.family_time(), family_time);
            partition.build_replica_for_leader(1, &[1]).unwrap();
            let mut chunk = Chunk::new(1024);
            chunk.write(&row(now)).unwrap();
            partition.write_log(&chunk.compress().unwrap()).unwrap();
            shard.close().unwrap();
        }

        let shard = open(&dir, 1);
        let partition = shard.partition(family_time, 1).unwrap();
        assert_eq!(partition.head_seq(), 1);
        let deadline = Instant::now() + Duration::from_secs(10);
        let family = shard.segment().get_family(family_time).unwrap();
        while family.applied_sequence(1) != Some(0) {
            assert!(Instant::now() < deadline, "record not replayed");
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(shard.num_memdbs(), 1);
        assert_eq!(shard.flush().unwrap(), 1);
        shard.close().unwrap();
    }

    #[test]
    fn test_expired_partitions_are_removed() {
        let dir = TempDir::new().unwrap();
        let shard = open(&dir, 1);
        let now = timeutil::now();
        let partition = shard.get_or_create_partition(now, 1).unwrap();
        let path = partition.dir().to_path_buf();
        drop(partition);
        assert_eq!(shard.remove_expired_partitions(now), 0);
        assert_eq!(shard.remove_expired_partitions(now + 3 * ONE_HOUR), 1);
        assert!(shard.partitions().is_empty());
        assert!(!path.exists());
    }
}
