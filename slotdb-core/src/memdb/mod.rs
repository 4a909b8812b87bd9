//! Memory database (memdb)
//!
//! A memdb buffers the writes of one family: a metric -> series -> field
//! tree whose leaves are slot-indexed value pages. Writes hold the memdb lock
//! in read mode for a whole batch and only lock the touched metric; flush
//! takes the memdb lock in write mode so it sees a quiescent tree.

mod field_store;
mod filter;
mod metric_store;
mod ts_store;

pub use field_store::FieldStore;
pub use filter::{MemDataLoader, MemFilterResultSet, MemSeriesData, MEMORY_IDENTIFIER};
pub use metric_store::MetricStore;
pub use ts_store::TimeSeriesStore;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use tracing::debug;

use crate::sstable::MetricFlusher;
use crate::types::timeutil::{self, ONE_DAY};
use crate::types::{FamilyId, FieldMetas, Interval, MetricId, Row, SlotRange, Timestamp};
use crate::{Result, SlotError};

use metric_store::EMPTY_METRIC_STORE_SIZE;

/// Family id of a family time: the bucket index within its day
pub fn family_id(family_time: Timestamp, family_width: i64) -> FamilyId {
    (family_time.rem_euclid(ONE_DAY) / family_width.max(1)) as FamilyId
}

/// Memdb construction options
#[derive(Debug, Clone, Copy)]
pub struct MemoryDatabaseOptions {
    pub family_time: Timestamp,
    pub family_width: i64,
    pub interval: Interval,
}

/// Write buffer of one family
pub struct MemoryDatabase {
    family_time: Timestamp,
    family_width: i64,
    family_id: FamilyId,
    interval: Interval,
    max_slot: u16,

    /// Read mode for writes and filters, write mode for flush
    lock: RwLock<()>,
    metrics: SkipMap<MetricId, Arc<RwLock<MetricStore>>>,

    size: AtomicUsize,
    rows: AtomicU64,
    frozen: AtomicBool,
    created_at: Instant,
}

impl MemoryDatabase {
    pub fn new(options: MemoryDatabaseOptions) -> Self {
        let slots = options.interval.slots_per_family(options.family_width);
        Self {
            family_time: options.family_time,
            family_width: options.family_width,
            family_id: family_id(options.family_time, options.family_width),
            interval: options.interval,
            max_slot: slots.saturating_sub(1).min(u16::MAX as usize) as u16,
            lock: RwLock::new(()),
            metrics: SkipMap::new(),
            size: AtomicUsize::new(0),
            rows: AtomicU64::new(0),
            frozen: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    pub fn family_time(&self) -> Timestamp {
        self.family_time
    }

    pub fn family_id(&self) -> FamilyId {
        self.family_id
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    /// Whether `ts` falls into this memdb's bucket
    pub fn accepts(&self, ts: Timestamp) -> bool {
        timeutil::family_time(ts, self.family_width) == self.family_time
    }

    /// Write one row
    pub fn write(&self, row: &Row) -> Result<()> {
        let _guard = self.lock.read();
        self.write_locked(row)
    }

    /// Write a batch under one read lock; rows that fail are skipped.
    /// Returns the number of rows written.
    pub fn write_rows(&self, rows: &[Row]) -> usize {
        let _guard = self.lock.read();
        let mut written = 0;
        for row in rows {
            match self.write_locked(row) {
                Ok(()) => written += 1,
                Err(e) => {
                    debug!(
                        metric = row.metric_id,
                        series = row.series_id,
                        error = %e,
                        "skip row"
                    );
                }
            }
        }
        written
    }

    fn write_locked(&self, row: &Row) -> Result<()> {
        if self.is_frozen() {
            return Err(SlotError::Closed(format!(
                "memdb of family {} is frozen",
                timeutil::format_timestamp(self.family_time)
            )));
        }
        if !self.accepts(row.timestamp) {
            return Err(SlotError::OutOfAcceptRange {
                timestamp: row.timestamp,
                start: self.family_time,
                end: self.family_time + self.family_width - 1,
            });
        }
        if row.fields.is_empty() {
            return Ok(());
        }
        let slot = timeutil::slot(row.timestamp, self.family_time, self.interval).min(self.max_slot);

        let mut allocated = 0;
        let store = match self.metrics.get(&row.metric_id) {
            Some(entry) => entry.value().clone(),
            None => {
                let entry = self
                    .metrics
                    .get_or_insert_with(row.metric_id, || {
                        allocated += EMPTY_METRIC_STORE_SIZE;
                        Arc::new(RwLock::new(MetricStore::new()))
                    });
                entry.value().clone()
            }
        };
        allocated += store
            .write()
            .write(row.series_id, self.family_id, slot, &row.fields)?;

        self.size.fetch_add(allocated, Ordering::Relaxed);
        self.rows.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Copy out the matching data of one metric
    pub fn filter(
        &self,
        metric_id: MetricId,
        fields: &FieldMetas,
        series_ids: &RoaringBitmap,
        slot_range: SlotRange,
    ) -> Option<MemFilterResultSet> {
        let _guard = self.lock.read();
        let entry = self.metrics.get(&metric_id)?;
        let store = entry.value().read();
        store
            .filter(self.family_id, fields, series_ids, slot_range)
            .map(|data| MemFilterResultSet::new(self.family_time, self.interval, data))
    }

    /// Field metas of a metric, if written
    pub fn fields(&self, metric_id: MetricId) -> Option<FieldMetas> {
        let entry = self.metrics.get(&metric_id)?;
        let fields = entry.value().read().fields().clone();
        Some(fields)
    }

    /// Write every metric, ascending, into `flusher`
    pub fn flush_to(&self, flusher: &mut MetricFlusher) -> Result<()> {
        let _guard = self.lock.write();
        for entry in self.metrics.iter() {
            let store = entry.value().read();
            store.flush_to(flusher, *entry.key(), self.family_id)?;
        }
        Ok(())
    }

    /// Stop accepting writes
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Bytes allocated by writes so far
    pub fn approx_size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn rows_written(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    pub fn num_metrics(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::{MetricReader, TableReader, TableWriter};
    use crate::types::timeutil::{ONE_HOUR, ONE_SECOND};
    use crate::types::{FieldMeta, FieldType};
    use tempfile::TempDir;

    fn memdb(family_time: Timestamp) -> MemoryDatabase {
        MemoryDatabase::new(MemoryDatabaseOptions {
            family_time,
            family_width: ONE_HOUR,
            interval: Interval::from_millis(10 * ONE_SECOND).unwrap(),
        })
    }

    fn all() -> RoaringBitmap {
        (0..1000u32).collect()
    }

    fn sum_fields() -> FieldMetas {
        [FieldMeta::new(1, FieldType::Sum)].into_iter().collect()
    }

    #[test]
    fn test_family_id() {
        assert_eq!(family_id(0, ONE_HOUR), 0);
        assert_eq!(family_id(5 * ONE_HOUR, ONE_HOUR), 5);
        assert_eq!(family_id(ONE_DAY + 23 * ONE_HOUR, ONE_HOUR), 23);
    }

    #[test]
    fn test_write_and_filter() {
        let db = memdb(ONE_HOUR);
        let row = Row::new(1, 1, ONE_HOUR + 1000).with_field(1, FieldType::Sum, 1.0);
        db.write(&row).unwrap();
        db.write(&Row::new(1, 1, ONE_HOUR + 1000).with_field(1, FieldType::Sum, 2.5))
            .unwrap();
        assert!(db.approx_size() > 0);
        assert_eq!(db.rows_written(), 2);

        let rs = db.filter(1, &sum_fields(), &all(), SlotRange::new(0, 359)).unwrap();
        assert_eq!(rs.identifier(), MEMORY_IDENTIFIER);
        assert_eq!(rs.slot_range(), SlotRange::new(0, 0));
        let container = crate::bitmap::container(rs.series_ids(), 0).unwrap();
        let loader = rs.load(&container, &sum_fields()).unwrap();
        let mut value = None;
        loader
            .load(1, |_, getter| {
                value = getter.get_value(0)?;
                Ok(())
            })
            .unwrap();
        assert_eq!(value, Some(3.5));

        assert!(db.filter(2, &sum_fields(), &all(), SlotRange::new(0, 359)).is_none());
    }

    #[test]
    fn test_reject_out_of_bucket_and_frozen() {
        let db = memdb(0);
        let late = Row::new(1, 1, ONE_HOUR).with_field(1, FieldType::Sum, 1.0);
        assert!(matches!(db.write(&late), Err(SlotError::OutOfAcceptRange { .. })));

        let rows = vec![
            Row::new(1, 1, 0).with_field(1, FieldType::Sum, 1.0),
            late,
            Row::new(1, 2, 10 * ONE_SECOND).with_field(1, FieldType::Sum, 1.0),
        ];
        assert_eq!(db.write_rows(&rows), 2);

        db.freeze();
        assert!(db.is_frozen());
        assert!(matches!(db.write(&rows[0]), Err(SlotError::Closed(_))));
    }

    #[test]
    fn test_boundary_slots_flush() {
        let dir = TempDir::new().unwrap();
        let db = memdb(0);
        db.write(&Row::new(7, 3, 0).with_field(1, FieldType::Sum, 1.0)).unwrap();
        db.write(&Row::new(7, 3, ONE_HOUR - 1).with_field(1, FieldType::Sum, 2.0))
            .unwrap();
        db.write(&Row::new(2, 9, 20 * ONE_SECOND).with_field(4, FieldType::Last, 6.0))
            .unwrap();

        let mut flusher = MetricFlusher::new(TableWriter::create(dir.path(), 1).unwrap());
        db.flush_to(&mut flusher).unwrap();
        let meta = flusher.commit().unwrap().unwrap();
        assert_eq!((meta.min_key, meta.max_key), (2, 7));

        let table = Arc::new(TableReader::open(dir.path(), 1).unwrap());
        let reader = MetricReader::open(table.clone(), 7).unwrap().unwrap();
        assert_eq!(reader.get_time_range(), SlotRange::new(0, 359));
        assert_eq!(reader.get_series_ids().iter().collect::<Vec<_>>(), vec![3]);

        let container = crate::bitmap::container(reader.get_series_ids(), 0).unwrap();
        let loader = reader.load(&container, &sum_fields()).unwrap();
        let mut values = Vec::new();
        loader
            .load(3, |_, getter| {
                values.push(getter.get_value(0)?);
                values.push(getter.get_value(359)?);
                Ok(())
            })
            .unwrap();
        assert_eq!(values, vec![Some(1.0), Some(2.0)]);
    }
}
