//! Metric blocks of data tables
//!
//! A data table stores one metric block per metric id:
//!
//! ```text
//! [series block]...          [field count u8][field ids][fixed-offset table][TSD blocks]
//! [series offsets]           fixed-offset table, relative to block start
//! [series bitmap]
//! [field metas]              [count u8][(id u8, type u8)]...
//! [slot_start u16][slot_end u16][offsets_pos u32][bitmap_pos u32][fields_pos u32][crc u32]
//! ```

use std::sync::Arc;

use bytes::{Buf, BufMut};
use roaring::RoaringBitmap;

use super::filter::FileDataLoader;
use super::table::{TableReader, TableWriter};
use crate::bitmap::{self, Container};
use crate::compression::{tsd_slot_range, FixedOffsetDecoder, FixedOffsetEncoder};
use crate::types::{FieldId, FieldMeta, FieldMetas, FieldType, MetricId, SeriesId, SlotRange};
use crate::version::FileMeta;
use crate::{Result, SlotError};

const METRIC_FOOTER_SIZE: usize = 2 + 2 + 4 + 4 + 4 + 4;

fn corrupt(msg: impl Into<String>) -> SlotError {
    SlotError::Corruption(msg.into())
}

/// Builds one metric block in memory
#[derive(Debug, Default)]
pub struct MetricBlockBuilder {
    buf: Vec<u8>,
    fields: FieldMetas,
    series_ids: RoaringBitmap,
    series_offsets: FixedOffsetEncoder,
    slot_range: Option<SlotRange>,
    last_series: Option<SeriesId>,

    field_ids: Vec<FieldId>,
    field_offsets: FixedOffsetEncoder,
    field_data: Vec<u8>,
}

impl MetricBlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fields(&mut self, fields: &FieldMetas) {
        self.fields = fields.clone();
    }

    /// Add a TSD block of the current series; field ids must ascend
    pub fn add_field(&mut self, field_id: FieldId, data: &[u8]) -> Result<()> {
        if self.fields.get(field_id).is_none() {
            return Err(SlotError::InvalidFormat(format!(
                "field {field_id} missing from field metas"
            )));
        }
        if matches!(self.field_ids.last(), Some(last) if *last >= field_id) {
            return Err(SlotError::InvalidFormat(format!(
                "field {field_id} out of order"
            )));
        }
        let range = tsd_slot_range(data)?;
        self.slot_range = Some(match self.slot_range {
            Some(r) => r.union(&range),
            None => range,
        });
        self.field_ids.push(field_id);
        self.field_offsets.add(self.field_data.len() as u32);
        self.field_data.extend_from_slice(data);
        Ok(())
    }

    /// Close the current series. A series without field blocks is dropped.
    pub fn finish_series(&mut self, series_id: SeriesId) -> Result<()> {
        if self.field_ids.is_empty() {
            return Ok(());
        }
        if matches!(self.last_series, Some(last) if last >= series_id) {
            return Err(SlotError::InvalidFormat(format!(
                "series {series_id} out of order"
            )));
        }
        self.series_offsets.add(self.buf.len() as u32);
        self.series_ids.insert(series_id);
        self.last_series = Some(series_id);

        self.buf.put_u8(self.field_ids.len() as u8);
        self.buf.extend_from_slice(&self.field_ids);
        self.field_offsets.write_to(&mut self.buf);
        self.buf.extend_from_slice(&self.field_data);

        self.field_ids.clear();
        self.field_offsets.reset();
        self.field_data.clear();
        Ok(())
    }

    pub fn num_series(&self) -> u64 {
        self.series_ids.len()
    }

    /// Seal the block and reset the builder; `None` when no series was added
    pub fn finish(&mut self) -> Result<Option<Vec<u8>>> {
        let slot_range = match self.slot_range {
            Some(range) if !self.series_ids.is_empty() => range,
            _ => {
                *self = Self::default();
                return Ok(None);
            }
        };
        let mut buf = std::mem::take(&mut self.buf);

        let offsets_pos = buf.len() as u32;
        self.series_offsets.write_to(&mut buf);
        let bitmap_pos = buf.len() as u32;
        bitmap::serialize_into(&self.series_ids, &mut buf)?;
        let fields_pos = buf.len() as u32;
        buf.put_u8(self.fields.len() as u8);
        for f in self.fields.iter() {
            buf.put_u8(f.id);
            buf.put_u8(f.field_type as u8);
        }

        buf.put_u16_le(slot_range.start);
        buf.put_u16_le(slot_range.end);
        buf.put_u32_le(offsets_pos);
        buf.put_u32_le(bitmap_pos);
        buf.put_u32_le(fields_pos);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);

        *self = Self::default();
        Ok(Some(buf))
    }
}

/// Streaming writer driven by a memdb flush
pub struct MetricFlusher {
    writer: TableWriter,
    builder: MetricBlockBuilder,
}

impl MetricFlusher {
    pub fn new(writer: TableWriter) -> Self {
        Self {
            writer,
            builder: MetricBlockBuilder::new(),
        }
    }

    pub fn file_number(&self) -> u64 {
        self.writer.file_number()
    }

    pub fn flush_field_metas(&mut self, fields: &FieldMetas) {
        self.builder.set_fields(fields);
    }

    pub fn flush_field(&mut self, field_id: FieldId, data: &[u8]) -> Result<()> {
        self.builder.add_field(field_id, data)
    }

    pub fn flush_series(&mut self, series_id: SeriesId) -> Result<()> {
        self.builder.finish_series(series_id)
    }

    pub fn flush_metric(&mut self, metric_id: MetricId) -> Result<()> {
        match self.builder.finish()? {
            Some(block) => self.writer.add(metric_id, &block),
            None => Ok(()),
        }
    }

    /// Close the table; `None` when nothing was flushed
    pub fn commit(self) -> Result<Option<FileMeta>> {
        self.writer.close()
    }

    pub fn abort(self) -> Result<()> {
        self.writer.abort()
    }
}

/// Decoded footer sections of a metric block
#[derive(Debug)]
pub struct MetricMeta {
    fields: FieldMetas,
    series_ids: RoaringBitmap,
    series: Vec<SeriesId>,
    series_offsets: Vec<u32>,
    series_end: usize,
    slot_range: SlotRange,
}

impl MetricMeta {
    pub fn parse(block: &[u8]) -> Result<Self> {
        if block.len() < METRIC_FOOTER_SIZE {
            return Err(corrupt(format!("metric block too short: {}", block.len())));
        }
        let footer_pos = block.len() - METRIC_FOOTER_SIZE;
        let mut footer = &block[footer_pos..];
        let slot_start = footer.get_u16_le();
        let slot_end = footer.get_u16_le();
        let offsets_pos = footer.get_u32_le() as usize;
        let bitmap_pos = footer.get_u32_le() as usize;
        let fields_pos = footer.get_u32_le() as usize;
        let expected = footer.get_u32_le();
        let actual = crc32fast::hash(&block[..footer_pos + METRIC_FOOTER_SIZE - 4]);
        if expected != actual {
            return Err(SlotError::ChecksumMismatch { expected, actual });
        }
        if !(offsets_pos <= bitmap_pos && bitmap_pos <= fields_pos && fields_pos < footer_pos)
            || slot_start > slot_end
        {
            return Err(corrupt("metric footer positions out of order"));
        }

        let offsets = FixedOffsetDecoder::new(&block[offsets_pos..bitmap_pos])?;
        let series_ids = bitmap::deserialize(&block[bitmap_pos..fields_pos])?;
        if offsets.len() != series_ids.len() as usize {
            return Err(corrupt(format!(
                "{} series offsets for {} series",
                offsets.len(),
                series_ids.len()
            )));
        }

        let mut metas = &block[fields_pos..footer_pos];
        if metas.is_empty() {
            return Err(corrupt("field metas missing"));
        }
        let count = metas.get_u8() as usize;
        if metas.len() < count * 2 {
            return Err(corrupt("field metas truncated"));
        }
        let mut fields = FieldMetas::new();
        for _ in 0..count {
            let id = metas.get_u8();
            let field_type = FieldType::try_from(metas.get_u8())?;
            fields.insert(FieldMeta::new(id, field_type));
        }

        Ok(Self {
            fields,
            series: series_ids.iter().collect(),
            series_ids,
            series_offsets: offsets.iter().collect(),
            series_end: offsets_pos,
            slot_range: SlotRange::new(slot_start, slot_end),
        })
    }

    pub fn fields(&self) -> &FieldMetas {
        &self.fields
    }

    pub fn series_ids(&self) -> &RoaringBitmap {
        &self.series_ids
    }

    pub fn slot_range(&self) -> SlotRange {
        self.slot_range
    }

    pub fn num_series(&self) -> usize {
        self.series.len()
    }

    /// Position of `series_id` in series order
    pub fn series_index(&self, series_id: SeriesId) -> Option<usize> {
        self.series.binary_search(&series_id).ok()
    }

    /// Indexes of the series of `container`, as (low, index) pairs
    pub fn container_indexes(&self, container: &Container) -> Vec<(u16, usize)> {
        let first = bitmap::join(container.high_key, 0);
        let start = self.series.partition_point(|id| *id < first);
        self.series[start..]
            .iter()
            .enumerate()
            .take_while(|(_, id)| bitmap::high(**id) == container.high_key)
            .filter(|(_, id)| container.contains(bitmap::low(**id)))
            .map(|(i, id)| (bitmap::low(*id), start + i))
            .collect()
    }

    /// Series block at `idx` of `block`
    pub fn series_block<'a>(&self, block: &'a [u8], idx: usize) -> Result<SeriesBlock<'a>> {
        let start = *self
            .series_offsets
            .get(idx)
            .ok_or_else(|| corrupt(format!("series index {idx} out of range")))? as usize;
        let end = match self.series_offsets.get(idx + 1) {
            Some(next) => *next as usize,
            None => self.series_end,
        };
        if start > end || end > block.len() {
            return Err(corrupt(format!("series block [{start}, {end}) out of bounds")));
        }
        SeriesBlock::parse(&block[start..end])
    }

    /// Every series with its block, in series order
    pub fn iter<'a>(&'a self, block: &'a [u8]) -> impl Iterator<Item = Result<(SeriesId, SeriesBlock<'a>)>> + 'a {
        self.series
            .iter()
            .enumerate()
            .map(move |(idx, id)| self.series_block(block, idx).map(|b| (*id, b)))
    }
}

/// Field blocks of one series
#[derive(Debug, Clone, Copy)]
pub struct SeriesBlock<'a> {
    field_ids: &'a [u8],
    offsets: FixedOffsetDecoder<'a>,
    data: &'a [u8],
}

impl<'a> SeriesBlock<'a> {
    pub fn parse(block: &'a [u8]) -> Result<Self> {
        let count = *block.first().ok_or_else(|| corrupt("empty series block"))? as usize;
        if block.len() < 1 + count {
            return Err(corrupt("series field ids truncated"));
        }
        let field_ids = &block[1..1 + count];
        let offsets = FixedOffsetDecoder::new(&block[1 + count..])?;
        if offsets.len() != count {
            return Err(corrupt("series field offsets mismatch"));
        }
        let data = &block[1 + count + offsets.encoded_len()..];
        Ok(Self {
            field_ids,
            offsets,
            data,
        })
    }

    pub fn field_ids(&self) -> &'a [u8] {
        self.field_ids
    }

    pub fn field(&self, field_id: FieldId) -> Option<&'a [u8]> {
        let idx = self.field_ids.binary_search(&field_id).ok()?;
        let (start, end) = self.offsets.get_block(idx, self.data.len())?;
        Some(&self.data[start..end])
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldId, &'a [u8])> + '_ {
        self.field_ids
            .iter()
            .filter_map(move |id| self.field(*id).map(|d| (*id, d)))
    }
}

/// Reader of one metric within a data table
#[derive(Debug, Clone)]
pub struct MetricReader {
    table: Arc<TableReader>,
    metric_id: MetricId,
    meta: Arc<MetricMeta>,
}

impl MetricReader {
    /// `None` when the table holds no block for `metric_id`
    pub fn open(table: Arc<TableReader>, metric_id: MetricId) -> Result<Option<Self>> {
        let Some(block) = table.get(metric_id) else {
            return Ok(None);
        };
        let meta = MetricMeta::parse(block)?;
        Ok(Some(Self {
            table,
            metric_id,
            meta: Arc::new(meta),
        }))
    }

    pub fn metric_id(&self) -> MetricId {
        self.metric_id
    }

    pub fn table(&self) -> &Arc<TableReader> {
        &self.table
    }

    pub fn get_fields(&self) -> &FieldMetas {
        self.meta.fields()
    }

    pub fn get_series_ids(&self) -> &RoaringBitmap {
        self.meta.series_ids()
    }

    pub fn get_time_range(&self) -> SlotRange {
        self.meta.slot_range()
    }

    pub fn meta(&self) -> &MetricMeta {
        &self.meta
    }

    pub(crate) fn block(&self) -> Result<&[u8]> {
        self.table.get(self.metric_id).ok_or_else(|| {
            corrupt(format!(
                "metric {} vanished from {:?}",
                self.metric_id,
                self.table.path()
            ))
        })
    }

    /// Field blocks of one series
    pub fn series_block(&self, series_id: SeriesId) -> Result<Option<SeriesBlock<'_>>> {
        let Some(idx) = self.meta.series_index(series_id) else {
            return Ok(None);
        };
        self.meta.series_block(self.block()?, idx).map(Some)
    }

    /// Loader over the series of `container` holding any of `fields`.
    /// Decoding is left to the caller.
    pub fn load(&self, container: &Container, fields: &FieldMetas) -> Option<FileDataLoader> {
        let (wanted, _) = self.meta.fields().intersects(fields);
        if wanted.is_empty() {
            return None;
        }
        let rows = self.meta.container_indexes(container);
        if rows.is_empty() {
            return None;
        }
        Some(FileDataLoader::new(self.clone(), wanted, rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{TsdDecoder, TsdEncoder};
    use tempfile::TempDir;

    fn tsd(values: &[(u16, f64)]) -> Vec<u8> {
        let mut enc = TsdEncoder::new(values[0].0);
        for (s, v) in values {
            enc.push(*s, *v);
        }
        enc.finish().unwrap()
    }

    fn metas() -> FieldMetas {
        [FieldMeta::new(1, FieldType::Sum), FieldMeta::new(2, FieldType::Last)]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_metric_block_roundtrip() {
        let mut builder = MetricBlockBuilder::new();
        builder.set_fields(&metas());
        builder.add_field(1, &tsd(&[(5, 1.0)])).unwrap();
        builder.add_field(2, &tsd(&[(9, 2.0), (20, 3.0)])).unwrap();
        builder.finish_series(4).unwrap();
        // no data, dropped
        builder.finish_series(5).unwrap();
        builder.add_field(2, &tsd(&[(1, 7.0)])).unwrap();
        builder.finish_series(70_000).unwrap();
        assert!(builder.add_field(9, &tsd(&[(1, 1.0)])).is_err());

        let block = builder.finish().unwrap().unwrap();
        let meta = MetricMeta::parse(&block).unwrap();
        assert_eq!(meta.slot_range(), SlotRange::new(1, 20));
        assert_eq!(meta.series_ids().iter().collect::<Vec<_>>(), vec![4, 70_000]);
        assert_eq!(meta.fields().len(), 2);

        let series: Vec<_> = meta.iter(&block).collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(series[0].1.field_ids(), &[1, 2]);
        assert_eq!(series[1].1.field_ids(), &[2]);
        let mut dec = TsdDecoder::new(series[0].1.field(2).unwrap()).unwrap();
        assert_eq!(dec.get_value(20).unwrap(), Some(3.0));
        assert!(series[1].1.field(1).is_none());

        let c = bitmap::container(meta.series_ids(), 1).unwrap();
        assert_eq!(meta.container_indexes(&c), vec![(bitmap::low(70_000), 1)]);
    }

    #[test]
    fn test_metric_block_checksum() {
        let mut builder = MetricBlockBuilder::new();
        builder.set_fields(&metas());
        builder.add_field(1, &tsd(&[(5, 1.0)])).unwrap();
        builder.finish_series(1).unwrap();
        let mut block = builder.finish().unwrap().unwrap();
        block[0] ^= 0x01;
        assert!(MetricMeta::parse(&block).unwrap_err().is_corruption());

        assert!(MetricBlockBuilder::new().finish().unwrap().is_none());
    }

    #[test]
    fn test_flusher_and_reader() {
        let dir = TempDir::new().unwrap();
        let mut flusher = MetricFlusher::new(TableWriter::create(dir.path(), 2).unwrap());
        for metric in [3u32, 8] {
            flusher.flush_field_metas(&metas());
            for series in 1..=3u32 {
                flusher
                    .flush_field(1, &tsd(&[(series as u16, metric as f64)]))
                    .unwrap();
                flusher.flush_series(series).unwrap();
            }
            flusher.flush_metric(metric).unwrap();
        }
        let file = flusher.commit().unwrap().unwrap();
        assert_eq!((file.min_key, file.max_key), (3, 8));

        let table = Arc::new(TableReader::open(dir.path(), 2).unwrap());
        assert!(MetricReader::open(table.clone(), 4).unwrap().is_none());
        let reader = MetricReader::open(table, 8).unwrap().unwrap();
        assert_eq!(reader.get_time_range(), SlotRange::new(1, 3));
        let block = reader.series_block(2).unwrap().unwrap();
        let mut dec = TsdDecoder::new(block.field(1).unwrap()).unwrap();
        assert_eq!(dec.get_value(2).unwrap(), Some(8.0));
        assert!(reader.series_block(9).unwrap().is_none());
    }
}
