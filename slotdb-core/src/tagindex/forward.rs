//! Forward index blocks: series id -> tag value id of one tag key
//!
//! ```text
//! [bitmap_len u32][series bitmap]
//! [container offsets]    fixed-offset table, index of each container's first value
//! [tag value ids]        u32 per series, in bitmap order
//! [crc u32]
//! ```

use bytes::{Buf, BufMut};
use roaring::RoaringBitmap;

use crate::bitmap::{self, Container};
use crate::compaction::Merger;
use crate::compression::{FixedOffsetDecoder, FixedOffsetEncoder};
use crate::types::{SeriesId, TagValueId};
use crate::{Result, SlotError};

/// Builds the forward block of one tag key
#[derive(Debug, Default)]
pub struct ForwardBlockBuilder {
    series_ids: RoaringBitmap,
    values: Vec<TagValueId>,
    offsets: FixedOffsetEncoder,
    last: Option<SeriesId>,
}

impl ForwardBlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the tag value of a series; series ids must ascend
    pub fn add(&mut self, series_id: SeriesId, tag_value_id: TagValueId) -> Result<()> {
        if let Some(last) = self.last {
            if series_id <= last {
                return Err(SlotError::InvalidFormat(format!(
                    "forward series {series_id} not after {last}"
                )));
            }
        }
        if self.last.map(bitmap::high) != Some(bitmap::high(series_id)) {
            self.offsets.add(self.values.len() as u32);
        }
        self.series_ids.insert(series_id);
        self.values.push(tag_value_id);
        self.last = Some(series_id);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Encode the block, `None` when no series was added
    pub fn finish(self) -> Result<Option<Vec<u8>>> {
        if self.values.is_empty() {
            return Ok(None);
        }
        let mut buf = Vec::with_capacity(self.series_ids.serialized_size() + self.values.len() * 4 + 32);
        buf.put_u32_le(0);
        let len = bitmap::serialize_into(&self.series_ids, &mut buf)?;
        buf[..4].copy_from_slice(&(len as u32).to_le_bytes());
        self.offsets.write_to(&mut buf);
        for v in &self.values {
            buf.put_u32_le(*v);
        }
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        Ok(Some(buf))
    }
}

/// Read view of a forward block
#[derive(Debug)]
pub struct ForwardBlock<'a> {
    series_ids: RoaringBitmap,
    containers: Vec<Container>,
    offsets: FixedOffsetDecoder<'a>,
    values: &'a [u8],
}

impl<'a> ForwardBlock<'a> {
    pub fn parse(block: &'a [u8]) -> Result<Self> {
        if block.len() < 8 {
            return Err(SlotError::Corruption("forward block truncated".into()));
        }
        let body = &block[..block.len() - 4];
        let expected = u32::from_le_bytes([
            block[block.len() - 4],
            block[block.len() - 3],
            block[block.len() - 2],
            block[block.len() - 1],
        ]);
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(SlotError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let bitmap_len = cursor.get_u32_le() as usize;
        if cursor.len() < bitmap_len {
            return Err(SlotError::Corruption("forward bitmap truncated".into()));
        }
        let series_ids = bitmap::deserialize(&cursor[..bitmap_len])?;
        let rest = &body[4 + bitmap_len..];
        let offsets = FixedOffsetDecoder::new(rest)?;
        let values = &rest[offsets.encoded_len()..];

        let containers = bitmap::containers(&series_ids);
        if values.len() != series_ids.len() as usize * 4 || offsets.len() != containers.len() {
            return Err(SlotError::Corruption("forward values disagree with bitmap".into()));
        }
        Ok(Self {
            series_ids,
            containers,
            offsets,
            values,
        })
    }

    pub fn series_ids(&self) -> &RoaringBitmap {
        &self.series_ids
    }

    fn value_at(&self, idx: usize) -> TagValueId {
        let p = idx * 4;
        u32::from_le_bytes([
            self.values[p],
            self.values[p + 1],
            self.values[p + 2],
            self.values[p + 3],
        ])
    }

    /// Tag value id of a series
    pub fn get(&self, series_id: SeriesId) -> Option<TagValueId> {
        let hk = bitmap::high(series_id);
        let c = self.containers.binary_search_by_key(&hk, |c| c.high_key).ok()?;
        let pos = self.containers[c].lows.binary_search(&bitmap::low(series_id)).ok()?;
        let start = self.offsets.get(c)? as usize;
        Some(self.value_at(start + pos))
    }

    /// Tag value ids of the series of one container, aligned with its lows
    pub fn container_values(&self, high_key: u16) -> Option<(&Container, Vec<TagValueId>)> {
        let c = self.containers.binary_search_by_key(&high_key, |c| c.high_key).ok()?;
        let container = &self.containers[c];
        let start = self.offsets.get(c)? as usize;
        let values = (start..start + container.len()).map(|i| self.value_at(i)).collect();
        Some((container, values))
    }

    /// `(series id, tag value id)` in series order
    pub fn iter(&self) -> impl Iterator<Item = (SeriesId, TagValueId)> + '_ {
        self.series_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id, self.value_at(i)))
    }
}

/// Union of forward blocks. A series found in several inputs keeps the tag
/// value of the newest one.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForwardMerger;

impl Merger for ForwardMerger {
    fn merge(&self, _key: u32, values: &[&[u8]]) -> Result<Option<Vec<u8>>> {
        let blocks = values
            .iter()
            .map(|b| ForwardBlock::parse(b))
            .collect::<Result<Vec<_>>>()?;
        let mut union = RoaringBitmap::new();
        for b in &blocks {
            union |= b.series_ids();
        }

        let mut builder = ForwardBlockBuilder::new();
        for container in bitmap::containers(&union) {
            // scanners positioned on this container, newest first
            let scanners: Vec<(&Container, Vec<TagValueId>)> = blocks
                .iter()
                .rev()
                .filter_map(|b| b.container_values(container.high_key))
                .collect();
            for low in &container.lows {
                let value = scanners.iter().find_map(|(c, vals)| {
                    c.lows.binary_search(low).ok().map(|pos| vals[pos])
                });
                if let Some(v) = value {
                    builder.add(container.series_id(*low), v)?;
                }
            }
        }
        builder.finish()
    }
}
