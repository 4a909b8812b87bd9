//! Table side of the filter/load contract

use std::sync::Arc;

use roaring::RoaringBitmap;

use super::metric::MetricReader;
use super::table::TableReader;
use crate::bitmap::Container;
use crate::compression::TsdDecoder;
use crate::query::ValueGetter;
use crate::types::{FieldMeta, FieldMetas, Interval, MetricId, SlotRange, Timestamp};
use crate::version::Snapshot;
use crate::Result;

/// Filter result of one metric within one table file
#[derive(Debug, Clone)]
pub struct FileFilterResultSet {
    reader: MetricReader,
    identifier: String,
    family_time: Timestamp,
    interval: Interval,
    slot_range: SlotRange,
    fields: FieldMetas,
    series_ids: RoaringBitmap,
    /// Keeps the table referenced until the result set is dropped
    _snapshot: Option<Snapshot>,
}

impl FileFilterResultSet {
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn series_ids(&self) -> &RoaringBitmap {
        &self.series_ids
    }

    pub fn family_time(&self) -> Timestamp {
        self.family_time
    }

    pub fn slot_range(&self) -> SlotRange {
        self.slot_range
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn fields(&self) -> &FieldMetas {
        &self.fields
    }

    pub fn load(&self, container: &Container, fields: &FieldMetas) -> Option<FileDataLoader> {
        self.reader.load(container, fields)
    }
}

/// Query parameters of a table filter
#[derive(Debug, Clone, Copy)]
pub struct TableFilter<'a> {
    pub metric_id: MetricId,
    pub fields: &'a FieldMetas,
    pub series_ids: &'a RoaringBitmap,
    pub slot_range: SlotRange,
    pub family_time: Timestamp,
    pub interval: Interval,
}

/// Filter one table. `None` when the metric, the fields, the series or the
/// slot range do not match.
pub fn filter_table(
    table: Arc<TableReader>,
    query: &TableFilter<'_>,
    snapshot: Option<Snapshot>,
) -> Result<Option<FileFilterResultSet>> {
    let Some(reader) = MetricReader::open(table, query.metric_id)? else {
        return Ok(None);
    };
    let (fields, _) = reader.get_fields().intersects(query.fields);
    if fields.is_empty() {
        return Ok(None);
    }
    let series_ids = reader.get_series_ids() & query.series_ids;
    if series_ids.is_empty() {
        return Ok(None);
    }
    let Some(slot_range) = reader.get_time_range().intersect(&query.slot_range) else {
        return Ok(None);
    };
    let identifier = reader.table().path().display().to_string();
    Ok(Some(FileFilterResultSet {
        reader,
        identifier,
        family_time: query.family_time,
        interval: query.interval,
        slot_range,
        fields,
        series_ids,
        _snapshot: snapshot,
    }))
}

/// Positioned field blocks of the series of one container
#[derive(Debug)]
pub struct FileDataLoader {
    reader: MetricReader,
    fields: FieldMetas,
    /// (low id, series index), ascending
    rows: Vec<(u16, usize)>,
}

impl FileDataLoader {
    pub(crate) fn new(reader: MetricReader, fields: FieldMetas, rows: Vec<(u16, usize)>) -> Self {
        Self {
            reader,
            fields,
            rows,
        }
    }

    pub fn lows(&self) -> impl Iterator<Item = u16> + '_ {
        self.rows.iter().map(|(low, _)| *low)
    }

    /// Hand a value getter for each present field of series `low` to `f`
    pub fn load<F>(&self, low: u16, mut f: F) -> Result<()>
    where
        F: FnMut(&FieldMeta, &mut dyn ValueGetter) -> Result<()>,
    {
        let Ok(pos) = self.rows.binary_search_by_key(&low, |(l, _)| *l) else {
            return Ok(());
        };
        let block = self.reader.block()?;
        let series = self.reader.meta().series_block(block, self.rows[pos].1)?;
        for meta in self.fields.iter() {
            if let Some(data) = series.field(meta.id) {
                let mut decoder = TsdDecoder::new(data)?;
                f(meta, &mut decoder)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap;
    use crate::compression::TsdEncoder;
    use crate::sstable::{MetricFlusher, TableWriter};
    use crate::types::FieldType;
    use tempfile::TempDir;

    fn table(dir: &TempDir) -> Arc<TableReader> {
        let mut flusher = MetricFlusher::new(TableWriter::create(dir.path(), 1).unwrap());
        let fields: FieldMetas = [FieldMeta::new(1, FieldType::Sum), FieldMeta::new(2, FieldType::Min)]
            .into_iter()
            .collect();
        flusher.flush_field_metas(&fields);
        for series in [1u32, 2, 3] {
            let mut enc = TsdEncoder::new(10);
            enc.push(10, series as f64);
            enc.push(12, series as f64 * 2.0);
            flusher.flush_field(1, &enc.finish().unwrap()).unwrap();
            flusher.flush_series(series).unwrap();
        }
        flusher.flush_metric(1).unwrap();
        flusher.commit().unwrap();
        Arc::new(TableReader::open(dir.path(), 1).unwrap())
    }

    fn query<'a>(
        metric_id: MetricId,
        fields: &'a FieldMetas,
        series_ids: &'a RoaringBitmap,
        slot_range: SlotRange,
    ) -> TableFilter<'a> {
        TableFilter {
            metric_id,
            fields,
            series_ids,
            slot_range,
            family_time: 0,
            interval: Interval::from_millis(10_000).unwrap(),
        }
    }

    #[test]
    fn test_filter_table() {
        let dir = TempDir::new().unwrap();
        let table = table(&dir);
        let fields: FieldMetas = [FieldMeta::new(1, FieldType::Sum)].into_iter().collect();
        let other: FieldMetas = [FieldMeta::new(9, FieldType::Sum)].into_iter().collect();
        let series: RoaringBitmap = [2u32, 3, 4].into_iter().collect();

        let miss = RoaringBitmap::from_iter([9u32]);
        for q in [
            query(2, &fields, &series, SlotRange::new(0, 100)),
            query(1, &other, &series, SlotRange::new(0, 100)),
            query(1, &fields, &miss, SlotRange::new(0, 100)),
            query(1, &fields, &series, SlotRange::new(13, 100)),
        ] {
            assert!(filter_table(table.clone(), &q, None).unwrap().is_none());
        }

        let rs = filter_table(table.clone(), &query(1, &fields, &series, SlotRange::new(11, 100)), None)
            .unwrap()
            .unwrap();
        assert!(rs.identifier().ends_with("000001.sst"));
        assert_eq!(rs.slot_range(), SlotRange::new(11, 12));
        assert_eq!(rs.series_ids().iter().collect::<Vec<_>>(), vec![2, 3]);

        let container = bitmap::container(rs.series_ids(), 0).unwrap();
        let loader = rs.load(&container, &fields).unwrap();
        assert_eq!(loader.lows().collect::<Vec<_>>(), vec![2, 3]);
        let mut got = Vec::new();
        for low in [2u16, 3] {
            loader
                .load(low, |meta, getter| {
                    got.push((low, meta.id, getter.get_value(12)?));
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(got, vec![(2, 1, Some(4.0)), (3, 1, Some(6.0))]);
    }
}
