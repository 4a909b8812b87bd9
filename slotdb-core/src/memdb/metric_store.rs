//! Metric level store: family slot ranges, field metas and series

use std::collections::BTreeMap;

use bytes::Bytes;
use roaring::RoaringBitmap;

use super::filter::MemSeriesData;
use super::ts_store::{TimeSeriesStore, EMPTY_TS_STORE_SIZE};
use crate::sstable::MetricFlusher;
use crate::types::{FamilyId, FieldMeta, FieldMetas, MetricId, RowField, SeriesId, SlotRange};
use crate::{Result, SlotError};

/// Bytes charged for an empty metric store
pub(crate) const EMPTY_METRIC_STORE_SIZE: usize = std::mem::size_of::<MetricStore>() + 64;

/// All series of one metric held by a memdb
#[derive(Default)]
pub struct MetricStore {
    families: BTreeMap<FamilyId, SlotRange>,
    fields: FieldMetas,
    series: BTreeMap<SeriesId, TimeSeriesStore>,
    series_ids: RoaringBitmap,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Widen the slot range touched in `family_id`
    pub fn set_timestamp(&mut self, family_id: FamilyId, slot: u16) {
        self.families
            .entry(family_id)
            .and_modify(|r| r.set_slot(slot))
            .or_insert_with(|| SlotRange::single(slot));
    }

    /// Register a field; an existing id must keep its type
    pub fn add_field(&mut self, meta: FieldMeta) -> Result<()> {
        match self.fields.get(meta.id) {
            Some(existing) if existing.field_type != meta.field_type => {
                Err(SlotError::InvalidFormat(format!(
                    "field {} is {:?}, got {:?}",
                    meta.id, existing.field_type, meta.field_type
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.fields.insert(meta);
                Ok(())
            }
        }
    }

    pub fn fields(&self) -> &FieldMetas {
        &self.fields
    }

    pub fn series_ids(&self) -> &RoaringBitmap {
        &self.series_ids
    }

    pub fn family_slot_range(&self, family_id: FamilyId) -> Option<SlotRange> {
        self.families.get(&family_id).copied()
    }

    /// Write the fields of one row, returning the bytes allocated
    pub fn write(
        &mut self,
        series_id: SeriesId,
        family_id: FamilyId,
        slot: u16,
        fields: &[RowField],
    ) -> Result<usize> {
        for f in fields {
            self.add_field(FieldMeta::new(f.id, f.field_type))?;
        }
        self.set_timestamp(family_id, slot);

        let mut allocated = 0;
        let store = self.series.entry(series_id).or_insert_with(|| {
            allocated += EMPTY_TS_STORE_SIZE;
            TimeSeriesStore::new()
        });
        self.series_ids.insert(series_id);
        for f in fields {
            allocated += store.write(family_id, f.id, f.field_type, slot, f.value);
        }
        Ok(allocated)
    }

    /// Copy the wanted data of matching series.
    ///
    /// `None` when no wanted field exists, the family was never written, the
    /// slot ranges do not overlap or no series matches.
    pub fn filter(
        &self,
        family_id: FamilyId,
        fields: &FieldMetas,
        series_ids: &RoaringBitmap,
        slot_range: SlotRange,
    ) -> Option<MemSeriesData> {
        let (found, _) = self.fields.intersects(fields);
        if found.is_empty() {
            return None;
        }
        let range = self.families.get(&family_id)?.intersect(&slot_range)?;
        let matched = series_ids & &self.series_ids;
        if matched.is_empty() {
            return None;
        }

        let mut rows = Vec::with_capacity(matched.len() as usize);
        for id in matched.iter() {
            let Some(store) = self.series.get(&id) else {
                continue;
            };
            let blocks: Vec<Option<Bytes>> = found
                .iter()
                .map(|meta| {
                    store
                        .get(family_id, meta.id)
                        .and_then(|fs| fs.encode(range))
                        .map(Bytes::from)
                })
                .collect();
            if blocks.iter().any(Option::is_some) {
                rows.push((id, blocks));
            }
        }
        if rows.is_empty() {
            return None;
        }
        let series_ids = rows.iter().map(|(id, _)| *id).collect();
        Some(MemSeriesData {
            fields: found,
            slot_range: range,
            series_ids,
            rows,
        })
    }

    /// Write this metric's data of `family_id` as one metric block
    pub fn flush_to(
        &self,
        flusher: &mut MetricFlusher,
        metric_id: MetricId,
        family_id: FamilyId,
    ) -> Result<()> {
        let Some(range) = self.families.get(&family_id).copied() else {
            return Ok(());
        };
        if self.fields.is_empty() {
            return Ok(());
        }

        flusher.flush_field_metas(&self.fields);
        for (series_id, store) in &self.series {
            for fs in store.family_fields(family_id) {
                if let Some(data) = fs.encode(range) {
                    flusher.flush_field(fs.field_id(), &data)?;
                }
            }
            flusher.flush_series(*series_id)?;
        }
        flusher.flush_metric(metric_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    fn sum(id: u8, value: f64) -> RowField {
        RowField {
            id,
            field_type: FieldType::Sum,
            value,
        }
    }

    fn store() -> MetricStore {
        let mut ms = MetricStore::new();
        ms.write(100, 1, 10, &[sum(10, 1.0)]).unwrap();
        ms.write(120, 1, 12, &[sum(20, 2.0)]).unwrap();
        ms.write(200, 20, 20, &[sum(20, 3.0)]).unwrap();
        ms
    }

    #[test]
    fn test_field_type_conflict() {
        let mut ms = store();
        let bad = RowField {
            id: 10,
            field_type: FieldType::Max,
            value: 1.0,
        };
        assert!(ms.write(100, 1, 10, &[bad]).is_err());
        assert_eq!(ms.fields().len(), 2);
    }

    #[test]
    fn test_filter() {
        let ms = store();
        let wanted: FieldMetas = [FieldMeta::new(1, FieldType::Sum), FieldMeta::new(20, FieldType::Sum)]
            .into_iter()
            .collect();
        let all: RoaringBitmap = [1u32, 100, 120, 200].into_iter().collect();

        // field not found
        let none: FieldMetas = [FieldMeta::new(1, FieldType::Sum)].into_iter().collect();
        assert!(ms.filter(1, &none, &all, SlotRange::new(0, 359)).is_none());
        // family not found
        assert!(ms.filter(10, &wanted, &all, SlotRange::new(0, 359)).is_none());
        // series not found
        let other: RoaringBitmap = [1u32, 2].into_iter().collect();
        assert!(ms.filter(20, &wanted, &other, SlotRange::new(0, 359)).is_none());
        // slot range disjoint
        assert!(ms.filter(1, &wanted, &all, SlotRange::new(13, 359)).is_none());

        let data = ms.filter(1, &wanted, &all, SlotRange::new(0, 359)).unwrap();
        assert_eq!(data.fields.len(), 1);
        assert_eq!(data.slot_range, SlotRange::new(10, 12));
        // series 100 has no field 20 in family 1
        assert_eq!(data.series_ids.iter().collect::<Vec<_>>(), vec![120]);
    }
}
