//! Data family: one time bucket of a shard
//!
//! A family buffers writes in a mutable memdb. A full or old memdb is frozen
//! and flushed into a table of the family's kv store; the flush commits the
//! WAL sequences the memdb covered in the same version edit, so a restart
//! replays exactly the rows that never reached a table.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info};

use super::kv::KvFamily;
use crate::compaction::CompactionConfig;
use crate::memdb::{self, MemoryDatabase, MemoryDatabaseOptions};
use crate::query::{FilterContext, FilterResultSet};
use crate::sstable::{filter_table, DataMerger, MetricFlusher, TableFilter};
use crate::types::{Interval, NodeId, Row, ShardId, TimeRange, Timestamp};
use crate::version::{TableCache, VersionEdit};
use crate::{Result, SlotError};

/// Family construction options
#[derive(Debug, Clone, Copy)]
pub struct DataFamilyOptions {
    pub family_time: Timestamp,
    pub family_width: i64,
    pub interval: Interval,
    pub max_memdb_size: u64,
    pub mutable_memdb_ttl: Duration,
}

struct FrozenMemDb {
    memdb: Arc<MemoryDatabase>,
    /// Applied sequences when the memdb was frozen
    sequences: BTreeMap<NodeId, u64>,
}

#[derive(Default)]
struct MemState {
    mutable: Option<Arc<MemoryDatabase>>,
    /// Oldest first
    immutable: Vec<FrozenMemDb>,
}

pub struct DataFamily {
    shard_id: ShardId,
    options: DataFamilyOptions,
    kv: KvFamily,

    state: RwLock<MemState>,
    /// Serializes writes against freezes
    write_lock: Mutex<()>,
    flush_lock: Mutex<()>,
    /// Highest sequence applied per leader
    applied: Mutex<BTreeMap<NodeId, u64>>,

    flush_failures: AtomicU32,
    degraded: AtomicBool,
}

impl DataFamily {
    pub fn open(dir: &Path, shard_id: ShardId, options: DataFamilyOptions, cache: Arc<TableCache>) -> Result<Self> {
        let family_id = memdb::family_id(options.family_time, options.family_width) as u32;
        let kv = KvFamily::open(
            dir,
            family_id,
            cache,
            Arc::new(DataMerger),
            CompactionConfig::default(),
        )?;
        let applied = kv.version().sequences().clone();
        info!(
            shard = shard_id,
            family = options.family_time,
            files = kv.version().num_files(),
            "data family opened"
        );
        Ok(Self {
            shard_id,
            options,
            kv,
            state: RwLock::new(MemState::default()),
            write_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            applied: Mutex::new(applied),
            flush_failures: AtomicU32::new(0),
            degraded: AtomicBool::new(false),
        })
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn family_time(&self) -> Timestamp {
        self.options.family_time
    }

    pub fn interval(&self) -> Interval {
        self.options.interval
    }

    /// `[family_time, family_time + width)` as an inclusive range
    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(
            self.options.family_time,
            self.options.family_time + self.options.family_width - 1,
        )
    }

    pub fn kv(&self) -> &KvFamily {
        &self.kv
    }

    /// Sequence of `leader` whose rows are all in tables
    pub fn persisted_sequence(&self, leader: NodeId) -> Option<u64> {
        self.kv.version().sequence(leader)
    }

    /// Sequence of `leader` whose rows are all in memdbs or tables
    pub fn applied_sequence(&self, leader: NodeId) -> Option<u64> {
        self.applied.lock().get(&leader).copied()
    }

    /// Mutable memdb, freezing the current one once it reached its size limit
    fn mutable_memdb(&self) -> Arc<MemoryDatabase> {
        {
            let state = self.state.read();
            if let Some(db) = &state.mutable {
                if !db.is_frozen() && (db.approx_size() as u64) < self.options.max_memdb_size {
                    return db.clone();
                }
            }
        }
        let mut state = self.state.write();
        if let Some(db) = &state.mutable {
            if !db.is_frozen() && (db.approx_size() as u64) < self.options.max_memdb_size {
                return db.clone();
            }
        }
        self.freeze_locked(&mut state);
        let db = Arc::new(MemoryDatabase::new(MemoryDatabaseOptions {
            family_time: self.options.family_time,
            family_width: self.options.family_width,
            interval: self.options.interval,
        }));
        state.mutable = Some(db.clone());
        db
    }

    fn freeze_locked(&self, state: &mut MemState) {
        if let Some(db) = state.mutable.take() {
            db.freeze();
            if db.is_empty() {
                return;
            }
            debug!(
                shard = self.shard_id,
                family = self.options.family_time,
                size = db.approx_size(),
                "memdb frozen"
            );
            state.immutable.push(FrozenMemDb {
                memdb: db,
                sequences: self.applied.lock().clone(),
            });
        }
    }

    /// Write rows outside of replication; returns the rows written
    pub fn write_rows(&self, rows: &[Row]) -> Result<usize> {
        let _guard = self.write_lock.lock();
        Ok(self.mutable_memdb().write_rows(rows))
    }

    /// Apply the rows of WAL record `seq` from `leader`.
    /// Records at or below the applied sequence are skipped.
    pub fn apply(&self, leader: NodeId, seq: u64, rows: &[Row]) -> Result<usize> {
        let _guard = self.write_lock.lock();
        if self.applied_sequence(leader).is_some_and(|s| seq <= s) {
            debug!(family = self.options.family_time, leader, seq, "skip applied record");
            return Ok(0);
        }
        let written = self.mutable_memdb().write_rows(rows);
        self.applied.lock().insert(leader, seq);
        Ok(written)
    }

    /// Freeze the mutable memdb so the next flush persists it
    pub fn freeze(&self) {
        let _guard = self.write_lock.lock();
        self.freeze_locked(&mut self.state.write());
    }

    pub fn memdb_size(&self) -> u64 {
        let state = self.state.read();
        state.mutable.iter().map(|m| m.approx_size() as u64).sum::<u64>()
            + state.immutable.iter().map(|f| f.memdb.approx_size() as u64).sum::<u64>()
    }

    pub fn num_memdbs(&self) -> usize {
        let state = self.state.read();
        state.mutable.iter().count() + state.immutable.len()
    }

    /// Age of the mutable memdb
    pub fn mutable_age(&self) -> Option<Duration> {
        self.state.read().mutable.as_ref().map(|m| m.age())
    }

    /// Whether the family has data to flush under its own limits
    pub fn is_flushable(&self) -> bool {
        let state = self.state.read();
        if !state.immutable.is_empty() {
            return true;
        }
        match &state.mutable {
            Some(db) if !db.is_empty() => {
                db.age() >= self.options.mutable_memdb_ttl
                    || db.approx_size() as u64 >= self.options.max_memdb_size
            }
            _ => false,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Freeze the mutable memdb and flush every frozen memdb, oldest first.
    /// Returns the number of memdbs flushed.
    pub fn flush(&self) -> Result<usize> {
        let _flush = self.flush_lock.lock();
        self.freeze();
        match self.flush_frozen() {
            Ok(n) => {
                self.flush_failures.store(0, Ordering::Release);
                if self.degraded.swap(false, Ordering::AcqRel) {
                    info!(shard = self.shard_id, family = self.options.family_time, "family recovered");
                }
                Ok(n)
            }
            Err(e) => {
                let failures = self.flush_failures.fetch_add(1, Ordering::AcqRel) + 1;
                error!(
                    shard = self.shard_id,
                    family = self.options.family_time,
                    failures,
                    error = %e,
                    "flush failed"
                );
                if failures >= crate::config::MAX_FLUSH_FAILURES {
                    self.degraded.store(true, Ordering::Release);
                }
                Err(e)
            }
        }
    }

    fn flush_frozen(&self) -> Result<usize> {
        let mut flushed = 0;
        loop {
            let next = {
                let state = self.state.read();
                state
                    .immutable
                    .first()
                    .map(|f| (f.memdb.clone(), f.sequences.clone()))
            };
            let Some((db, sequences)) = next else {
                break;
            };

            let mut flusher = MetricFlusher::new(self.kv.new_table_writer()?);
            if let Err(e) = db.flush_to(&mut flusher) {
                flusher.abort()?;
                return Err(e);
            }
            let file = flusher.commit()?;
            let mut edit = VersionEdit::new(0);
            for (leader, seq) in &sequences {
                edit.sequence(*leader, *seq);
            }

            // publish the table and drop the memdb atomically for readers
            let mut state = self.state.write();
            self.kv.commit_flush(file.clone(), edit)?;
            state.immutable.remove(0);
            drop(state);

            info!(
                shard = self.shard_id,
                family = self.options.family_time,
                file = file.as_ref().map(|f| f.number),
                rows = db.rows_written(),
                "memdb flushed"
            );
            flushed += 1;
        }
        if flushed > 0 && self.kv.need_compact() {
            self.kv.compact()?;
        }
        Ok(flushed)
    }

    /// Result sets of every table and memdb holding data for `ctx`.
    /// Tables come first, oldest data first, then memdbs.
    pub fn filter(&self, ctx: &FilterContext) -> Result<Vec<FilterResultSet>> {
        if ctx.interval != self.options.interval {
            return Err(SlotError::InvalidFormat(format!(
                "query interval {} differs from family interval {}",
                ctx.interval, self.options.interval
            )));
        }
        let Some(slot_range) = ctx.slot_range(
            self.options.family_time,
            self.options.family_width,
            self.options.interval,
        ) else {
            return Ok(Vec::new());
        };

        let (snapshot, memdbs) = {
            let state = self.state.read();
            let memdbs: Vec<Arc<MemoryDatabase>> = state
                .immutable
                .iter()
                .map(|f| f.memdb.clone())
                .chain(state.mutable.iter().cloned())
                .collect();
            (self.kv.snapshot(), memdbs)
        };

        let query = TableFilter {
            metric_id: ctx.metric_id,
            fields: &ctx.fields,
            series_ids: &ctx.series_ids,
            slot_range,
            family_time: self.options.family_time,
            interval: self.options.interval,
        };
        let mut out = Vec::new();
        for table in self.kv.readers(&snapshot)? {
            if let Some(rs) = filter_table(table, &query, Some(snapshot.clone()))? {
                out.push(FilterResultSet::File(rs));
            }
        }
        for db in memdbs {
            if let Some(rs) = db.filter(ctx.metric_id, &ctx.fields, &ctx.series_ids, slot_range) {
                out.push(FilterResultSet::Memory(rs));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ScanExecutor;
    use crate::types::timeutil::{ONE_HOUR, ONE_SECOND};
    use crate::types::{FieldId, FieldMeta, FieldMetas, FieldType};
    use roaring::RoaringBitmap;
    use tempfile::TempDir;

    fn options(max_memdb_size: u64) -> DataFamilyOptions {
        DataFamilyOptions {
            family_time: 0,
            family_width: ONE_HOUR,
            interval: Interval::from_millis(10 * ONE_SECOND).unwrap(),
            max_memdb_size,
            mutable_memdb_ttl: Duration::from_secs(1800),
        }
    }

    fn ctx() -> FilterContext {
        FilterContext {
            metric_id: 1,
            series_ids: [1u32].into_iter().collect::<RoaringBitmap>(),
            fields: [FieldMeta::new(1, FieldType::Sum)].into_iter().collect::<FieldMetas>(),
            time_range: TimeRange::new(0, ONE_HOUR - 1),
            interval: Interval::from_millis(10 * ONE_SECOND).unwrap(),
        }
    }

    fn row(ts: i64, v: f64) -> Row {
        Row::new(1, 1, ts).with_field(1, FieldType::Sum, v)
    }

    fn total(family: &DataFamily) -> f64 {
        let rs = family.filter(&ctx()).unwrap();
        ScanExecutor::new(&ctx()).execute(&rs).unwrap()[0].fields[&1]
            .points
            .values()
            .sum()
    }

    #[test]
    fn test_flush_keeps_data_visible() {
        let dir = TempDir::new().unwrap();
        let family = DataFamily::open(dir.path(), 1, options(1 << 30), Arc::new(TableCache::new(8))).unwrap();
        family.apply(7, 1, &[row(1000, 1.0)]).unwrap();
        family.apply(7, 2, &[row(1000, 2.5)]).unwrap();
        assert_eq!(family.apply(7, 2, &[row(1000, 100.0)]).unwrap(), 0);
        assert_eq!(total(&family), 3.5);

        assert_eq!(family.flush().unwrap(), 1);
        assert_eq!(family.persisted_sequence(7), Some(2));
        assert_eq!(family.num_memdbs(), 0);
        family.apply(7, 3, &[row(2000, 1.0)]).unwrap();
        let rs = family.filter(&ctx()).unwrap();
        assert_eq!(rs.len(), 2);
        assert!(matches!(rs[0], FilterResultSet::File(_)));
        assert_eq!(total(&family), 4.5);
    }

    #[test]
    fn test_compaction_keeps_first_and_last() {
        let dir = TempDir::new().unwrap();
        let family = DataFamily::open(dir.path(), 1, options(1 << 30), Arc::new(TableCache::new(8))).unwrap();
        for i in 1..=crate::config::L0_COMPACTION_TRIGGER {
            let v = i as f64;
            let row = Row::new(1, 1, 1000)
                .with_field(2, FieldType::First, v)
                .with_field(3, FieldType::Last, v)
                .with_field(4, FieldType::Sum, v);
            family.write_rows(&[row]).unwrap();
            assert_eq!(family.flush().unwrap(), 1);
        }
        assert_eq!(family.kv().version().num_files(), 1);

        let mut ctx = ctx();
        ctx.fields = [
            FieldMeta::new(2, FieldType::First),
            FieldMeta::new(3, FieldType::Last),
            FieldMeta::new(4, FieldType::Sum),
        ]
        .into_iter()
        .collect();
        let rs = family.filter(&ctx).unwrap();
        assert_eq!(rs.len(), 1);
        let series = ScanExecutor::new(&ctx).execute(&rs).unwrap();
        let value = |field: FieldId| series[0].fields[&field].points[&0];
        assert_eq!(value(2), 1.0);
        let n = crate::config::L0_COMPACTION_TRIGGER as f64;
        assert_eq!(value(3), n);
        assert_eq!(value(4), n * (n + 1.0) / 2.0);
    }

    #[test]
    fn test_full_memdb_frozen_on_next_write() {
        let dir = TempDir::new().unwrap();
        let family = DataFamily::open(dir.path(), 1, options(1), Arc::new(TableCache::new(8))).unwrap();
        family.write_rows(&[row(0, 1.0)]).unwrap();
        assert_eq!(family.num_memdbs(), 1);
        assert!(family.is_flushable());
        family.write_rows(&[row(10_000, 1.0)]).unwrap();
        assert_eq!(family.num_memdbs(), 2);
        assert_eq!(total(&family), 2.0);
    }

    #[test]
    fn test_sequences_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let family = DataFamily::open(dir.path(), 1, options(1 << 30), Arc::new(TableCache::new(8))).unwrap();
            family.apply(3, 10, &[row(0, 1.0)]).unwrap();
            family.flush().unwrap();
        }
        let family = DataFamily::open(dir.path(), 1, options(1 << 30), Arc::new(TableCache::new(8))).unwrap();
        assert_eq!(family.applied_sequence(3), Some(10));
        assert_eq!(family.apply(3, 9, &[row(0, 1.0)]).unwrap(), 0);
        assert_eq!(total(&family), 1.0);
        // query window outside the family
        let mut outside = ctx();
        outside.time_range = TimeRange::new(ONE_HOUR, 2 * ONE_HOUR);
        assert!(family.filter(&outside).unwrap().is_empty());
    }
}
