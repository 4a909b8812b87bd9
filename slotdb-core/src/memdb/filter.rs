//! Memdb side of the filter/load contract

use std::sync::Arc;

use bytes::Bytes;
use roaring::RoaringBitmap;

use crate::bitmap::{self, Container};
use crate::compression::TsdDecoder;
use crate::query::ValueGetter;
use crate::types::{FieldMeta, FieldMetas, Interval, SeriesId, SlotRange, Timestamp};
use crate::Result;

/// Identifier advertised by memdb result sets
pub const MEMORY_IDENTIFIER: &str = "memory";

/// Field blocks copied out of a memdb under its read lock
#[derive(Debug)]
pub struct MemSeriesData {
    pub fields: FieldMetas,
    pub slot_range: SlotRange,
    pub series_ids: RoaringBitmap,
    /// One entry per series, ascending; blocks aligned with `fields`
    pub rows: Vec<(SeriesId, Vec<Option<Bytes>>)>,
}

/// Filter result of one metric within a memdb
#[derive(Debug, Clone)]
pub struct MemFilterResultSet {
    family_time: Timestamp,
    interval: Interval,
    data: Arc<MemSeriesData>,
}

impl MemFilterResultSet {
    pub(crate) fn new(family_time: Timestamp, interval: Interval, data: MemSeriesData) -> Self {
        Self {
            family_time,
            interval,
            data: Arc::new(data),
        }
    }

    pub fn identifier(&self) -> &str {
        MEMORY_IDENTIFIER
    }

    pub fn series_ids(&self) -> &RoaringBitmap {
        &self.data.series_ids
    }

    pub fn family_time(&self) -> Timestamp {
        self.family_time
    }

    pub fn slot_range(&self) -> SlotRange {
        self.data.slot_range
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn fields(&self) -> &FieldMetas {
        &self.data.fields
    }

    /// Loader over the series of `container` holding any of `fields`
    pub fn load(&self, container: &Container, fields: &FieldMetas) -> Option<MemDataLoader> {
        let indexes: Vec<(FieldMeta, usize)> = fields
            .iter()
            .filter_map(|f| self.data.fields.index_of(f.id).map(|idx| (*f, idx)))
            .collect();
        if indexes.is_empty() {
            return None;
        }

        let first = bitmap::join(container.high_key, 0);
        let start = self.data.rows.partition_point(|(id, _)| *id < first);
        let mut rows = Vec::new();
        for (id, blocks) in &self.data.rows[start..] {
            if bitmap::high(*id) != container.high_key {
                break;
            }
            let low = bitmap::low(*id);
            if !container.contains(low) {
                continue;
            }
            let picked: Vec<Option<Bytes>> = indexes
                .iter()
                .map(|(_, idx)| blocks.get(*idx).cloned().flatten())
                .collect();
            if picked.iter().any(Option::is_some) {
                rows.push((low, picked));
            }
        }
        if rows.is_empty() {
            return None;
        }
        Some(MemDataLoader {
            fields: indexes.into_iter().map(|(f, _)| f).collect(),
            rows,
        })
    }
}

/// Per low series id access to copied field blocks
#[derive(Debug)]
pub struct MemDataLoader {
    fields: Vec<FieldMeta>,
    rows: Vec<(u16, Vec<Option<Bytes>>)>,
}

impl MemDataLoader {
    /// Low ids with data, ascending
    pub fn lows(&self) -> impl Iterator<Item = u16> + '_ {
        self.rows.iter().map(|(low, _)| *low)
    }

    /// Hand a value getter for each present field of series `low` to `f`
    pub fn load<F>(&self, low: u16, mut f: F) -> Result<()>
    where
        F: FnMut(&FieldMeta, &mut dyn ValueGetter) -> Result<()>,
    {
        let Ok(idx) = self.rows.binary_search_by_key(&low, |(l, _)| *l) else {
            return Ok(());
        };
        for (meta, block) in self.fields.iter().zip(&self.rows[idx].1) {
            if let Some(block) = block {
                let mut decoder = TsdDecoder::new(block)?;
                f(meta, &mut decoder)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::TsdEncoder;
    use crate::types::FieldType;

    fn block(values: &[(u16, f64)]) -> Option<Bytes> {
        let mut enc = TsdEncoder::new(values[0].0);
        for (slot, v) in values {
            enc.push(*slot, *v);
        }
        enc.finish().map(Bytes::from)
    }

    fn result_set() -> MemFilterResultSet {
        let fields: FieldMetas = [FieldMeta::new(1, FieldType::Sum), FieldMeta::new(2, FieldType::Max)]
            .into_iter()
            .collect();
        let rows = vec![
            (3, vec![block(&[(0, 1.0)]), None]),
            (70_000, vec![None, block(&[(2, 9.0), (4, 7.0)])]),
        ];
        let data = MemSeriesData {
            fields,
            slot_range: SlotRange::new(0, 4),
            series_ids: [3u32, 70_000].into_iter().collect(),
            rows,
        };
        MemFilterResultSet::new(0, Interval::from_millis(10_000).unwrap(), data)
    }

    #[test]
    fn test_load_by_container() {
        let rs = result_set();
        assert_eq!(rs.identifier(), "memory");
        let wanted: FieldMetas = [FieldMeta::new(2, FieldType::Max)].into_iter().collect();

        let low = bitmap::container(rs.series_ids(), 0).unwrap();
        // series 3 only has field 1
        assert!(rs.load(&low, &wanted).is_none());

        let high = bitmap::container(rs.series_ids(), 1).unwrap();
        let loader = rs.load(&high, &wanted).unwrap();
        assert_eq!(loader.lows().collect::<Vec<_>>(), vec![bitmap::low(70_000)]);

        let mut seen = Vec::new();
        loader
            .load(bitmap::low(70_000), |meta, getter| {
                seen.push((meta.id, getter.get_value(2)?, getter.get_value(3)?, getter.get_value(4)?));
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![(2, Some(9.0), None, Some(7.0))]);
    }
}
