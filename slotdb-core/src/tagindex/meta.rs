//! Series metadata blocks, one per metric
//!
//! A block records the tag keys, tag values and series a metric allocated.
//! Flushes write only what was created since the previous flush; merging
//! unions blocks, the newest entry winning on conflicts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::compaction::Merger;
use crate::types::{SeriesId, TagKeyId, TagValueId};
use crate::{Result, SlotError};

/// Tag value ids of one series, sorted by tag key id
pub type SeriesTags = Vec<(TagKeyId, TagValueId)>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesMetaBlock {
    pub tag_keys: BTreeMap<String, TagKeyId>,
    pub tag_values: BTreeMap<TagKeyId, BTreeMap<String, TagValueId>>,
    pub series: BTreeMap<SeriesId, SeriesTags>,
}

impl SeriesMetaBlock {
    pub fn is_empty(&self) -> bool {
        self.tag_keys.is_empty() && self.tag_values.is_empty() && self.series.is_empty()
    }

    /// Fold `newer` into this block
    pub fn merge_from(&mut self, newer: SeriesMetaBlock) {
        self.tag_keys.extend(newer.tag_keys);
        for (key_id, values) in newer.tag_values {
            self.tag_values.entry(key_id).or_default().extend(values);
        }
        self.series.extend(newer.series);
    }

    /// `[crc u32][bincode body]`
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self).map_err(|e| SlotError::Internal(e.to_string()))?;
        let mut buf = Vec::with_capacity(body.len() + 4);
        buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(SlotError::Corruption("series meta block truncated".into()));
        }
        let expected = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let actual = crc32fast::hash(&data[4..]);
        if expected != actual {
            return Err(SlotError::ChecksumMismatch { expected, actual });
        }
        bincode::deserialize(&data[4..]).map_err(|e| SlotError::Corruption(e.to_string()))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SeriesMetaMerger;

impl Merger for SeriesMetaMerger {
    fn merge(&self, _key: u32, values: &[&[u8]]) -> Result<Option<Vec<u8>>> {
        let mut out = SeriesMetaBlock::default();
        for data in values {
            out.merge_from(SeriesMetaBlock::decode(data)?);
        }
        if out.is_empty() {
            return Ok(None);
        }
        out.encode().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_merge() {
        let mut a = SeriesMetaBlock::default();
        a.tag_keys.insert("host".into(), 1);
        a.tag_values.entry(1).or_default().insert("a".into(), 1);
        a.series.insert(1, vec![(1, 1)]);
        let mut b = SeriesMetaBlock::default();
        b.tag_values.entry(1).or_default().insert("b".into(), 2);
        b.series.insert(2, vec![(1, 2)]);

        let merged = SeriesMetaMerger
            .merge(7, &[&a.encode().unwrap()[..], &b.encode().unwrap()[..]])
            .unwrap()
            .unwrap();
        let block = SeriesMetaBlock::decode(&merged).unwrap();
        assert_eq!(block.tag_values[&1].len(), 2);
        assert_eq!(block.series.keys().copied().collect::<Vec<_>>(), vec![1, 2]);

        let mut bad = merged.clone();
        bad[0] ^= 1;
        assert!(SeriesMetaBlock::decode(&bad).unwrap_err().is_corruption());
    }
}
