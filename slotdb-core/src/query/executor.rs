//! Scan executor
//!
//! Reads every matching value out of a set of filter result sets, merging
//! values that several sources hold for the same slot, and optionally
//! down-samples them to a coarser interval.

use std::collections::BTreeMap;

use super::{accumulator_for, FilterContext, FilterResultSet};
use crate::bitmap;
use crate::types::timeutil;
use crate::types::{FieldId, FieldMeta, FieldMetas, Interval, SeriesId, TimeRange, Timestamp};
use crate::{Result, SlotError};

/// Values of one field of one series, keyed by timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPoints {
    pub field: FieldMeta,
    pub points: BTreeMap<Timestamp, f64>,
}

/// All loaded fields of one series
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoints {
    pub series_id: SeriesId,
    pub fields: BTreeMap<FieldId, FieldPoints>,
}

/// Query executor over filter result sets
pub struct ScanExecutor {
    fields: FieldMetas,
    time_range: TimeRange,
    downsample: Option<Interval>,
}

impl ScanExecutor {
    pub fn new(ctx: &FilterContext) -> Self {
        Self {
            fields: ctx.fields.clone(),
            time_range: ctx.time_range,
            downsample: None,
        }
    }

    /// Fold values into buckets of `interval` with each field's aggregate
    pub fn with_downsample(mut self, interval: Interval) -> Self {
        self.downsample = Some(interval);
        self
    }

    /// Load every series of `result_sets`, ordered by series id.
    ///
    /// Result sets are applied in the given order, older sources first, so a
    /// slot held by several sources is combined with the field's merge
    /// function.
    pub fn execute(&self, result_sets: &[FilterResultSet]) -> Result<Vec<SeriesPoints>> {
        let mut series: BTreeMap<SeriesId, SeriesPoints> = BTreeMap::new();

        for rs in result_sets {
            let slot_range = rs.slot_range();
            let family_time = rs.family_time();
            let interval = rs.interval();

            for container in bitmap::containers(rs.series_ids()) {
                let Some(loader) = rs.load(container.high_key, &container, &self.fields) else {
                    continue;
                };
                for low in loader.lows() {
                    let series_id = container.series_id(low);
                    let entry = series.entry(series_id).or_insert_with(|| SeriesPoints {
                        series_id,
                        fields: BTreeMap::new(),
                    });
                    loader.load(low, |meta, getter| {
                        let points = &mut entry
                            .fields
                            .entry(meta.id)
                            .or_insert_with(|| FieldPoints {
                                field: *meta,
                                points: BTreeMap::new(),
                            })
                            .points;
                        for slot in slot_range.iter() {
                            let Some(value) = getter.get_value(slot)? else {
                                continue;
                            };
                            let ts = timeutil::slot_time(slot, family_time, interval);
                            if !self.time_range.contains(ts) {
                                continue;
                            }
                            points
                                .entry(ts)
                                .and_modify(|old| *old = meta.field_type.merge(*old, value))
                                .or_insert(value);
                        }
                        Ok(())
                    })?;
                }
            }
        }

        let mut out: Vec<SeriesPoints> = series
            .into_values()
            .filter(|s| s.fields.values().any(|f| !f.points.is_empty()))
            .collect();
        if let Some(interval) = self.downsample {
            for s in out.iter_mut() {
                for f in s.fields.values_mut() {
                    f.points = downsample(f.field, &f.points, interval)?;
                }
            }
        }
        Ok(out)
    }
}

/// Fold `points` into buckets of `interval`, keyed by bucket start
fn downsample(
    field: FieldMeta,
    points: &BTreeMap<Timestamp, f64>,
    interval: Interval,
) -> Result<BTreeMap<Timestamp, f64>> {
    let step = interval.millis();
    if step <= 0 {
        return Err(SlotError::Config(format!("down-sample interval {interval}")));
    }
    let mut out = BTreeMap::new();
    let mut acc = accumulator_for(field.field_type);
    let mut bucket: Option<Timestamp> = None;
    for (ts, value) in points {
        let start = ts - ts.rem_euclid(step);
        if bucket != Some(start) {
            if let (Some(b), Some(v)) = (bucket, acc.result()) {
                out.insert(b, v);
            }
            acc.reset();
            bucket = Some(start);
        }
        acc.add(*value);
    }
    if let (Some(b), Some(v)) = (bucket, acc.result()) {
        out.insert(b, v);
    }
    Ok(out)
}
