//! Inverted index blocks: tag value -> series ids of one tag key
//!
//! ```text
//! [trie_len u32][trie]   tag value -> index of its bitmap
//! [bitmap offsets]       fixed-offset table into the bitmap region
//! [bitmaps]              serialized series bitmaps, in tag value order
//! [crc u32]
//! ```

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};
use regex::Regex;
use roaring::RoaringBitmap;

use crate::bitmap;
use crate::compaction::Merger;
use crate::compression::{FixedOffsetDecoder, FixedOffsetEncoder};
use crate::trie::Trie;
use crate::types::SeriesId;
use crate::{Result, SlotError};

/// Builds the inverted block of one tag key
#[derive(Debug, Default, Clone)]
pub struct InvertedBlockBuilder {
    values: BTreeMap<String, RoaringBitmap>,
}

impl InvertedBlockBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tag_value: &str, series_id: SeriesId) {
        self.values.entry(tag_value.to_string()).or_default().insert(series_id);
    }

    pub fn add_bitmap(&mut self, tag_value: &str, series_ids: &RoaringBitmap) {
        *self.values.entry(tag_value.to_string()).or_default() |= series_ids;
    }

    /// Fold another builder into this one
    pub fn merge(&mut self, other: InvertedBlockBuilder) {
        for (value, series_ids) in other.values {
            *self.values.entry(value).or_default() |= series_ids;
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn finish(self) -> Result<Option<Vec<u8>>> {
        if self.values.is_empty() {
            return Ok(None);
        }
        let trie = Trie::from_sorted(
            self.values
                .keys()
                .enumerate()
                .map(|(i, k)| (k.as_bytes(), i as u32)),
        )?;

        let mut region = Vec::new();
        let mut offsets = FixedOffsetEncoder::new();
        for bm in self.values.values() {
            offsets.add(region.len() as u32);
            bitmap::serialize_into(bm, &mut region)?;
        }

        let mut buf = Vec::new();
        buf.put_u32_le(0);
        trie.write_to(&mut buf);
        let trie_len = (buf.len() - 4) as u32;
        buf[..4].copy_from_slice(&trie_len.to_le_bytes());
        offsets.write_to(&mut buf);
        buf.extend_from_slice(&region);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);
        Ok(Some(buf))
    }
}

/// Predicate over the tag values of one tag key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagFilter {
    Equal(String),
    In(Vec<String>),
    Prefix(String),
    /// `*` matches any run of bytes
    Like(String),
    Regex(String),
}

/// Read view of an inverted block
#[derive(Debug)]
pub struct InvertedBlock<'a> {
    trie: Trie,
    offsets: FixedOffsetDecoder<'a>,
    region: &'a [u8],
}

impl<'a> InvertedBlock<'a> {
    pub fn parse(block: &'a [u8]) -> Result<Self> {
        if block.len() < 8 {
            return Err(SlotError::Corruption("inverted block truncated".into()));
        }
        let body = &block[..block.len() - 4];
        let mut tail = &block[block.len() - 4..];
        let expected = tail.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(SlotError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let trie_len = cursor.get_u32_le() as usize;
        if cursor.len() < trie_len {
            return Err(SlotError::Corruption("inverted trie truncated".into()));
        }
        let mut trie_bytes = &cursor[..trie_len];
        let trie = Trie::read_from(&mut trie_bytes)?;
        let rest = &body[4 + trie_len..];
        let offsets = FixedOffsetDecoder::new(rest)?;
        let region = &rest[offsets.encoded_len()..];
        if offsets.len() != trie.len() {
            return Err(SlotError::Corruption("inverted bitmaps disagree with trie".into()));
        }
        Ok(Self {
            trie,
            offsets,
            region,
        })
    }

    pub fn num_values(&self) -> usize {
        self.trie.len()
    }

    fn bitmap_at(&self, idx: u32) -> Result<RoaringBitmap> {
        let (start, end) = self
            .offsets
            .get_block(idx as usize, self.region.len())
            .filter(|(s, e)| s <= e && *e <= self.region.len())
            .ok_or_else(|| SlotError::Corruption(format!("inverted bitmap {idx} out of range")))?;
        bitmap::deserialize(&self.region[start..end])
    }

    /// Every tag value in ascending order
    pub fn values(&self) -> Vec<String> {
        self.trie
            .iter()
            .map(|(k, _)| String::from_utf8_lossy(&k).into_owned())
            .collect()
    }

    /// Series ids of every tag value
    pub fn all(&self) -> Result<RoaringBitmap> {
        let mut out = RoaringBitmap::new();
        for idx in 0..self.trie.len() as u32 {
            out |= self.bitmap_at(idx)?;
        }
        Ok(out)
    }

    /// Series ids of one tag value
    pub fn get(&self, tag_value: &str) -> Result<Option<RoaringBitmap>> {
        self.trie
            .lookup(tag_value.as_bytes())
            .map(|idx| self.bitmap_at(idx))
            .transpose()
    }

    /// Series ids of every tag value `filter` matches
    pub fn find(&self, filter: &TagFilter) -> Result<RoaringBitmap> {
        let mut out = RoaringBitmap::new();
        match filter {
            TagFilter::Equal(v) => {
                if let Some(bm) = self.get(v)? {
                    out = bm;
                }
            }
            TagFilter::In(values) => {
                for v in values {
                    if let Some(bm) = self.get(v)? {
                        out |= bm;
                    }
                }
            }
            TagFilter::Prefix(prefix) => {
                for (_, idx) in self.trie.prefix_iter(prefix.as_bytes()) {
                    out |= self.bitmap_at(idx)?;
                }
            }
            TagFilter::Like(pattern) => {
                // the literal run before the first wildcard narrows the scan
                let literal = pattern.split('*').next().unwrap_or_default();
                if !pattern.contains('*') {
                    return self.find(&TagFilter::Equal(pattern.clone()));
                }
                for (key, idx) in self.trie.prefix_iter(literal.as_bytes()) {
                    if like_match(pattern.as_bytes(), &key) {
                        out |= self.bitmap_at(idx)?;
                    }
                }
            }
            TagFilter::Regex(pattern) => {
                let re = Regex::new(pattern)
                    .map_err(|e| SlotError::InvalidFormat(format!("bad tag regex {pattern:?}: {e}")))?;
                for (key, idx) in self.trie.iter() {
                    if re.is_match(&String::from_utf8_lossy(&key)) {
                        out |= self.bitmap_at(idx)?;
                    }
                }
            }
        }
        Ok(out)
    }
}

/// Glob match where `*` stands for any run of bytes
pub fn like_match(pattern: &[u8], value: &[u8]) -> bool {
    let (mut p, mut v) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while v < value.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some((p, v));
            p += 1;
        } else if p < pattern.len() && pattern[p] == value[v] {
            p += 1;
            v += 1;
        } else if let Some((sp, sv)) = star {
            p = sp + 1;
            v = sv + 1;
            star = Some((sp, sv + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|b| *b == b'*')
}

/// Union of inverted blocks: bitmaps of equal tag values are OR'ed
#[derive(Debug, Default, Clone, Copy)]
pub struct InvertedMerger;

impl Merger for InvertedMerger {
    fn merge(&self, _key: u32, values: &[&[u8]]) -> Result<Option<Vec<u8>>> {
        let mut builder = InvertedBlockBuilder::new();
        for data in values {
            let block = InvertedBlock::parse(data)?;
            for (key, idx) in block.trie.iter() {
                let value = String::from_utf8_lossy(&key).into_owned();
                builder.add_bitmap(&value, &block.bitmap_at(idx)?);
            }
        }
        builder.finish()
    }
}
