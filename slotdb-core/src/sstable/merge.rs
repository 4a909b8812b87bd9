//! Merging metric blocks during compaction

use roaring::RoaringBitmap;

use super::metric::{MetricBlockBuilder, MetricMeta};
use crate::compaction::Merger;
use crate::compression::merge_tsd_blocks;
use crate::types::FieldMetas;
use crate::Result;

/// Merge the blocks of one metric, oldest first.
///
/// Series are merged in id order and fields in id order; blocks of the same
/// field are re-encoded over their union slot range with the field type's
/// merge function.
pub fn merge_metric_blocks(blocks: &[&[u8]]) -> Result<Option<Vec<u8>>> {
    let metas = blocks
        .iter()
        .map(|b| MetricMeta::parse(b))
        .collect::<Result<Vec<_>>>()?;

    let mut fields = FieldMetas::new();
    let mut series_ids = RoaringBitmap::new();
    for meta in &metas {
        for f in meta.fields().iter() {
            fields.insert(*f);
        }
        series_ids |= meta.series_ids();
    }

    let mut builder = MetricBlockBuilder::new();
    builder.set_fields(&fields);
    let mut inputs: Vec<&[u8]> = Vec::with_capacity(blocks.len());
    for series_id in series_ids.iter() {
        let series = metas
            .iter()
            .zip(blocks)
            .filter_map(|(meta, block)| {
                meta.series_index(series_id)
                    .map(|idx| meta.series_block(block, idx))
            })
            .collect::<Result<Vec<_>>>()?;

        for field in fields.iter() {
            inputs.clear();
            inputs.extend(series.iter().filter_map(|s| s.field(field.id)));
            if inputs.is_empty() {
                continue;
            }
            let merged = if inputs.len() == 1 {
                Some(inputs[0].to_vec())
            } else {
                merge_tsd_blocks(field.field_type, &inputs)?
            };
            if let Some(data) = merged {
                builder.add_field(field.id, &data)?;
            }
        }
        builder.finish_series(series_id)?;
    }
    builder.finish()
}

/// Merger of data families
#[derive(Debug, Default, Clone, Copy)]
pub struct DataMerger;

impl Merger for DataMerger {
    fn merge(&self, _key: u32, values: &[&[u8]]) -> Result<Option<Vec<u8>>> {
        merge_metric_blocks(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{TsdDecoder, TsdEncoder};
    use crate::types::{FieldMeta, FieldType};

    fn block(series: &[(u32, u8, &[(u16, f64)])]) -> Vec<u8> {
        let fields: FieldMetas = [FieldMeta::new(1, FieldType::Sum), FieldMeta::new(2, FieldType::Max)]
            .into_iter()
            .collect();
        let mut builder = MetricBlockBuilder::new();
        builder.set_fields(&fields);
        for (id, field, values) in series {
            let mut enc = TsdEncoder::new(values[0].0);
            for (s, v) in values.iter() {
                enc.push(*s, *v);
            }
            builder.add_field(*field, &enc.finish().unwrap()).unwrap();
            builder.finish_series(*id).unwrap();
        }
        builder.finish().unwrap().unwrap()
    }

    #[test]
    fn test_merge_disjoint_and_colliding() {
        let old = block(&[(1, 1, &[(0, 1.0), (1, 2.0)][..]), (5, 2, &[(3, 4.0)][..])]);
        let new = block(&[(1, 1, &[(1, 3.0), (7, 9.0)][..]), (9, 1, &[(2, 5.0)][..])]);
        let merged = merge_metric_blocks(&[old.as_slice(), new.as_slice()]).unwrap().unwrap();

        let meta = MetricMeta::parse(&merged).unwrap();
        assert_eq!(meta.series_ids().iter().collect::<Vec<_>>(), vec![1, 5, 9]);
        assert_eq!(meta.slot_range().start, 0);
        assert_eq!(meta.slot_range().end, 7);

        let s1 = meta.series_block(&merged, 0).unwrap();
        let mut dec = TsdDecoder::new(s1.field(1).unwrap()).unwrap();
        assert_eq!(dec.decode_all().unwrap(), vec![(0, 1.0), (1, 5.0), (7, 9.0)]);

        let s5 = meta.series_block(&merged, 1).unwrap();
        assert_eq!(s5.field_ids(), &[2]);
    }
}
