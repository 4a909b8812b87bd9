//! Filter/load contract between storage and query execution
//!
//! A filter over a shard yields one [`FilterResultSet`] per memdb and per
//! table file holding matching data. The executor walks the series ids of a
//! result set container by container, asks for a [`DataLoader`] and reads
//! slot values through [`ValueGetter`]s.

mod aggregates;
mod executor;

pub use aggregates::{accumulator_for, Accumulator};
pub use executor::{FieldPoints, ScanExecutor, SeriesPoints};

use roaring::RoaringBitmap;

use crate::bitmap::Container;
use crate::compression::TsdDecoder;
use crate::memdb::{MemDataLoader, MemFilterResultSet};
use crate::sstable::{FileDataLoader, FileFilterResultSet};
use crate::types::{FieldMeta, FieldMetas, Interval, MetricId, SlotRange, TimeRange, Timestamp};
use crate::Result;

/// Random access to the values of one field block
pub trait ValueGetter {
    fn get_value(&mut self, slot: u16) -> Result<Option<f64>>;
}

impl ValueGetter for TsdDecoder<'_> {
    fn get_value(&mut self, slot: u16) -> Result<Option<f64>> {
        TsdDecoder::get_value(self, slot)
    }
}

/// What a query wants from a shard
#[derive(Debug, Clone)]
pub struct FilterContext {
    pub metric_id: MetricId,
    pub series_ids: RoaringBitmap,
    pub fields: FieldMetas,
    pub time_range: TimeRange,
    pub interval: Interval,
}

impl FilterContext {
    /// Slot range of `time_range` within the family starting at
    /// `family_time`; `None` when they do not overlap
    pub fn slot_range(&self, family_time: Timestamp, family_width: i64, interval: Interval) -> Option<SlotRange> {
        let family = TimeRange::new(family_time, family_time + family_width - 1);
        let range = family.intersect(&self.time_range)?;
        let step = interval.millis();
        let start = (range.start - family_time) / step;
        let end = (range.end - family_time) / step;
        Some(SlotRange::new(start as u16, end as u16))
    }
}

/// Matching data of one memdb or one table file
#[derive(Debug, Clone)]
pub enum FilterResultSet {
    Memory(MemFilterResultSet),
    File(FileFilterResultSet),
}

impl FilterResultSet {
    /// `memory` or the table file path
    pub fn identifier(&self) -> &str {
        match self {
            FilterResultSet::Memory(rs) => rs.identifier(),
            FilterResultSet::File(rs) => rs.identifier(),
        }
    }

    pub fn series_ids(&self) -> &RoaringBitmap {
        match self {
            FilterResultSet::Memory(rs) => rs.series_ids(),
            FilterResultSet::File(rs) => rs.series_ids(),
        }
    }

    pub fn family_time(&self) -> Timestamp {
        match self {
            FilterResultSet::Memory(rs) => rs.family_time(),
            FilterResultSet::File(rs) => rs.family_time(),
        }
    }

    pub fn slot_range(&self) -> SlotRange {
        match self {
            FilterResultSet::Memory(rs) => rs.slot_range(),
            FilterResultSet::File(rs) => rs.slot_range(),
        }
    }

    pub fn interval(&self) -> Interval {
        match self {
            FilterResultSet::Memory(rs) => rs.interval(),
            FilterResultSet::File(rs) => rs.interval(),
        }
    }

    /// Loader for the series of `container`; `high_key` must match it
    pub fn load(&self, high_key: u16, container: &Container, fields: &FieldMetas) -> Option<DataLoader> {
        if container.high_key != high_key {
            return None;
        }
        match self {
            FilterResultSet::Memory(rs) => rs.load(container, fields).map(DataLoader::Memory),
            FilterResultSet::File(rs) => rs.load(container, fields).map(DataLoader::File),
        }
    }
}

/// Per series access to field blocks
#[derive(Debug)]
pub enum DataLoader {
    Memory(MemDataLoader),
    File(FileDataLoader),
}

impl DataLoader {
    /// Low series ids holding data, ascending
    pub fn lows(&self) -> Vec<u16> {
        match self {
            DataLoader::Memory(l) => l.lows().collect(),
            DataLoader::File(l) => l.lows().collect(),
        }
    }

    /// Call `f` with a value getter for each present field of `low`
    pub fn load<F>(&self, low: u16, f: F) -> Result<()>
    where
        F: FnMut(&FieldMeta, &mut dyn ValueGetter) -> Result<()>,
    {
        match self {
            DataLoader::Memory(l) => l.load(low, f),
            DataLoader::File(l) => l.load(low, f),
        }
    }
}
