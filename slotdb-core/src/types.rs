//! Core types for SlotDB

use crate::{Result, SlotError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

pub type MetricId = u32;
pub type TagKeyId = u32;
pub type TagValueId = u32;
pub type SeriesId = u32;
pub type ShardId = u32;
pub type NodeId = u32;
/// Field id, unique within a metric
pub type FieldId = u8;
/// Family id inside a memdb
pub type FamilyId = u8;

/// Sampling interval in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Interval(i64);

impl Interval {
    /// Create an interval, rejecting non-positive durations
    pub fn from_millis(ms: i64) -> Result<Self> {
        if ms <= 0 {
            return Err(SlotError::Config(format!("interval must be positive, got {ms}")));
        }
        Ok(Self(ms))
    }

    /// Interval length in milliseconds
    pub fn millis(&self) -> i64 {
        self.0
    }

    /// Number of slots a family of `family_width` ms holds
    pub fn slots_per_family(&self, family_width: i64) -> usize {
        (family_width / self.0) as usize
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Time range for queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// Intersection of two ranges
    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        if !self.overlaps(other) {
            return None;
        }
        Some(TimeRange::new(self.start.max(other.start), self.end.min(other.end)))
    }

    /// Duration in milliseconds
    pub fn duration(&self) -> i64 {
        self.end - self.start
    }
}

/// Inclusive range of slot indexes within one family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
}

impl SlotRange {
    pub fn new(start: u16, end: u16) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Range holding a single slot
    pub fn single(slot: u16) -> Self {
        Self { start: slot, end: slot }
    }

    pub fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Widen the range so it covers `slot`
    pub fn set_slot(&mut self, slot: u16) {
        self.start = self.start.min(slot);
        self.end = self.end.max(slot);
    }

    pub fn intersect(&self, other: &SlotRange) -> Option<SlotRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(SlotRange { start, end })
    }

    pub fn union(&self, other: &SlotRange) -> SlotRange {
        SlotRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Number of slots covered
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

/// Field type, fixing the merge and down-sampling function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldType {
    Sum = 1,
    Min = 2,
    Max = 3,
    Last = 4,
    First = 5,
    Histogram = 6,
    Gauge = 7,
}

impl TryFrom<u8> for FieldType {
    type Error = SlotError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(FieldType::Sum),
            2 => Ok(FieldType::Min),
            3 => Ok(FieldType::Max),
            4 => Ok(FieldType::Last),
            5 => Ok(FieldType::First),
            6 => Ok(FieldType::Histogram),
            7 => Ok(FieldType::Gauge),
            _ => Err(SlotError::InvalidFormat(format!("Invalid field type: {}", value))),
        }
    }
}

impl FieldType {
    /// Merge `new` into `old` when both land on the same slot.
    ///
    /// `old` is the earlier value in write (or file) order.
    #[inline]
    pub fn merge(self, old: f64, new: f64) -> f64 {
        match self {
            FieldType::Sum | FieldType::Histogram => old + new,
            FieldType::Min => old.min(new),
            FieldType::Max => old.max(new),
            FieldType::Last | FieldType::Gauge => new,
            FieldType::First => old,
        }
    }

    /// Down-sample a run of values ordered by time
    pub fn aggregate(self, values: &[f64]) -> Option<f64> {
        let (first, rest) = values.split_first()?;
        Some(rest.iter().fold(*first, |acc, v| self.merge(acc, *v)))
    }
}

/// Field metadata within a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldMeta {
    pub id: FieldId,
    pub field_type: FieldType,
}

impl FieldMeta {
    pub fn new(id: FieldId, field_type: FieldType) -> Self {
        Self { id, field_type }
    }
}

/// Field metas kept sorted by field id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetas(Vec<FieldMeta>);

impl FieldMetas {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Insert a meta, keeping id order. Existing ids are left untouched.
    pub fn insert(&mut self, meta: FieldMeta) -> bool {
        match self.0.binary_search_by_key(&meta.id, |m| m.id) {
            Ok(_) => false,
            Err(pos) => {
                self.0.insert(pos, meta);
                true
            }
        }
    }

    pub fn get(&self, id: FieldId) -> Option<&FieldMeta> {
        self.0
            .binary_search_by_key(&id, |m| m.id)
            .ok()
            .map(|idx| &self.0[idx])
    }

    /// Position of a field id in id order
    pub fn index_of(&self, id: FieldId) -> Option<usize> {
        self.0.binary_search_by_key(&id, |m| m.id).ok()
    }

    /// Metas present in both sets, plus whether every wanted field was found
    pub fn intersects(&self, wanted: &FieldMetas) -> (FieldMetas, bool) {
        let found: Vec<FieldMeta> = wanted
            .iter()
            .filter(|m| self.get(m.id).is_some())
            .copied()
            .collect();
        let all = found.len() == wanted.len();
        (FieldMetas(found), all)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldMeta> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[FieldMeta] {
        &self.0
    }
}

impl FromIterator<FieldMeta> for FieldMetas {
    fn from_iter<I: IntoIterator<Item = FieldMeta>>(iter: I) -> Self {
        let mut metas = FieldMetas::new();
        for meta in iter {
            metas.insert(meta);
        }
        metas
    }
}

/// One field value of a row
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RowField {
    pub id: FieldId,
    pub field_type: FieldType,
    pub value: f64,
}

/// An already-routed, schema-validated metric row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub metric_id: MetricId,
    pub series_id: SeriesId,
    pub timestamp: Timestamp,
    pub fields: Vec<RowField>,
}

impl Row {
    pub fn new(metric_id: MetricId, series_id: SeriesId, timestamp: Timestamp) -> Self {
        Self {
            metric_id,
            series_id,
            timestamp,
            fields: Vec::new(),
        }
    }

    /// Add a field value
    pub fn with_field(mut self, id: FieldId, field_type: FieldType, value: f64) -> Self {
        self.fields.push(RowField {
            id,
            field_type,
            value,
        });
        self
    }

    /// Encoded size in bytes
    pub fn size(&self) -> usize {
        4 + 4 + 8 + 1 + self.fields.len() * 10
    }
}

/// A row addressed by tags; the shard resolves its series id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedRow {
    pub metric_id: MetricId,
    pub tags: Vec<(String, String)>,
    pub timestamp: Timestamp,
    pub fields: Vec<RowField>,
}

impl TaggedRow {
    pub fn new(metric_id: MetricId, tags: &[(&str, &str)], timestamp: Timestamp) -> Self {
        Self {
            metric_id,
            tags: tags.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            timestamp,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, id: FieldId, field_type: FieldType, value: f64) -> Self {
        self.fields.push(RowField {
            id,
            field_type,
            value,
        });
        self
    }
}

/// Time helpers
pub mod timeutil {
    use super::{Interval, Timestamp};
    use chrono::{TimeZone, Utc};

    pub const ONE_SECOND: i64 = 1_000;
    pub const ONE_MINUTE: i64 = 60 * ONE_SECOND;
    pub const ONE_HOUR: i64 = 60 * ONE_MINUTE;
    pub const ONE_DAY: i64 = 24 * ONE_HOUR;

    /// Wall clock in milliseconds
    pub fn now() -> Timestamp {
        Utc::now().timestamp_millis()
    }

    /// Bucket start of the family holding `ts`
    pub fn family_time(ts: Timestamp, family_width: i64) -> Timestamp {
        ts - ts.rem_euclid(family_width)
    }

    /// Slot of `ts` inside the family starting at `family_time`
    pub fn slot(ts: Timestamp, family_time: Timestamp, interval: Interval) -> u16 {
        ((ts - family_time) / interval.millis()) as u16
    }

    /// Timestamp of a slot
    pub fn slot_time(slot: u16, family_time: Timestamp, interval: Interval) -> Timestamp {
        family_time + slot as i64 * interval.millis()
    }

    /// Human readable form used in logs and directory names
    pub fn format_timestamp(ts: Timestamp) -> String {
        match Utc.timestamp_millis_opt(ts).single() {
            Some(dt) => dt.format("%Y%m%d%H%M%S").to_string(),
            None => ts.to_string(),
        }
    }
}
