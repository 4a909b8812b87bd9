//! Succinct LOUDS trie
//!
//! Nodes are laid out in level order. Every label owns one bit in
//! `has_child` and one bit in `louds` (set on the first label of a node).
//! A node whose keys share a common run of bytes stores that run once in the
//! prefix vector (`has_prefix` marks such nodes). A key that ends inside a
//! node is recorded by a terminator label placed first in that node and
//! flagged by `is_prefix_key`.
//!
//! Navigation:
//! - node start = `select1(louds, node + 1)`
//! - child of label `p` = `rank1(has_child, p + 1)`
//! - value of leaf label `p` = `values[p - rank1(has_child, p)]`

mod bitvec;
mod builder;
mod iter;

pub use bitvec::{BitVector, RankVector, SelectVector};
pub use builder::TrieBuilder;
pub use iter::TrieIter;

use bytes::{Buf, BufMut};

use crate::{Result, SlotError};

/// Label marking a key that ends inside a node
pub(crate) const TERMINATOR: u8 = 0xFF;

/// Immutable trie mapping byte strings to u32 values
#[derive(Debug, Clone)]
pub struct Trie {
    num_keys: usize,
    labels: Vec<u8>,
    has_child: RankVector,
    louds: SelectVector,
    is_prefix_key: BitVector,
    has_prefix: RankVector,
    prefix_offsets: Vec<u32>,
    prefix_bytes: Vec<u8>,
    values: Vec<u32>,
}

impl Trie {
    /// Build from sorted, distinct `(key, value)` pairs
    pub fn from_sorted<'k, I>(pairs: I) -> Result<Trie>
    where
        I: IntoIterator<Item = (&'k [u8], u32)>,
    {
        let mut builder = TrieBuilder::new();
        for (key, value) in pairs {
            builder.add(key, value)?;
        }
        Ok(builder.build())
    }

    pub fn len(&self) -> usize {
        self.num_keys
    }

    pub fn is_empty(&self) -> bool {
        self.num_keys == 0
    }

    pub fn num_nodes(&self) -> usize {
        self.is_prefix_key.len()
    }

    /// Label positions `[start, end)` of a node
    fn node_range(&self, node: usize) -> (usize, usize) {
        let start = self.louds.select1(node + 1).unwrap_or(self.labels.len());
        let end = self.louds.select1(node + 2).unwrap_or(self.labels.len());
        (start, end)
    }

    fn node_prefix(&self, node: usize) -> &[u8] {
        if !self.has_prefix.get(node) {
            return &[];
        }
        let idx = self.has_prefix.rank1(node);
        let start = self.prefix_offsets[idx] as usize;
        let end = self.prefix_offsets[idx + 1] as usize;
        &self.prefix_bytes[start..end]
    }

    #[inline]
    fn child(&self, pos: usize) -> usize {
        self.has_child.rank1(pos + 1)
    }

    #[inline]
    fn value_at(&self, pos: usize) -> u32 {
        self.values[pos - self.has_child.rank1(pos)]
    }

    /// First label position past the terminator, if the node has one
    fn first_label(&self, node: usize, start: usize) -> usize {
        if self.is_prefix_key.get(node) {
            start + 1
        } else {
            start
        }
    }

    /// Exact label search within `[start, end)`
    fn search(&self, start: usize, end: usize, label: u8) -> Option<usize> {
        self.labels[start..end]
            .binary_search(&label)
            .ok()
            .map(|i| start + i)
    }

    /// First label position in `[start, end)` strictly greater than `label`
    fn search_greater_than(&self, start: usize, end: usize, label: u8) -> Option<usize> {
        let idx = self.labels[start..end].partition_point(|l| *l <= label);
        (start + idx < end).then_some(start + idx)
    }

    /// Value stored under `key`
    pub fn lookup(&self, key: &[u8]) -> Option<u32> {
        if self.is_empty() {
            return None;
        }
        let mut node = 0usize;
        let mut depth = 0usize;
        loop {
            let prefix = self.node_prefix(node);
            if !key[depth..].starts_with(prefix) {
                return None;
            }
            depth += prefix.len();

            let (start, end) = self.node_range(node);
            if depth == key.len() {
                return self.is_prefix_key.get(node).then(|| self.value_at(start));
            }

            let first = self.first_label(node, start);
            let pos = self.search(first, end, key[depth])?;
            if self.has_child.get(pos) {
                node = self.child(pos);
                depth += 1;
            } else {
                return (depth + 1 == key.len()).then(|| self.value_at(pos));
            }
        }
    }

    /// Iterate every key in ascending order
    pub fn iter(&self) -> TrieIter<'_> {
        TrieIter::new(self)
    }

    /// Iterator positioned at the first key `>= key`
    pub fn lower_bound(&self, key: &[u8]) -> TrieIter<'_> {
        let mut it = TrieIter::empty(self);
        it.seek(key);
        it
    }

    /// Keys starting with `prefix`
    pub fn prefix_iter<'a>(&'a self, prefix: &'a [u8]) -> impl Iterator<Item = (Vec<u8>, u32)> + 'a {
        self.lower_bound(prefix)
            .take_while(move |(k, _)| k.starts_with(prefix))
    }

    /// Serialize into `buf`
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.num_keys as u32);
        buf.put_u32_le(self.labels.len() as u32);
        buf.extend_from_slice(&self.labels);
        self.has_child.bits().write_to(buf);
        self.louds.bits().write_to(buf);
        self.is_prefix_key.write_to(buf);
        self.has_prefix.bits().write_to(buf);
        buf.put_u32_le(self.prefix_offsets.len() as u32);
        for off in &self.prefix_offsets {
            buf.put_u32_le(*off);
        }
        buf.put_u32_le(self.prefix_bytes.len() as u32);
        buf.extend_from_slice(&self.prefix_bytes);
        buf.put_u32_le(self.values.len() as u32);
        for v in &self.values {
            buf.put_u32_le(*v);
        }
    }

    /// Deserialize, consuming the trie bytes from the front of `buf`
    pub fn read_from(buf: &mut &[u8]) -> Result<Trie> {
        fn need(buf: &[u8], n: usize, what: &str) -> Result<()> {
            if buf.remaining() < n {
                return Err(SlotError::InvalidFormat(format!("trie {what} truncated")));
            }
            Ok(())
        }

        need(buf, 8, "header")?;
        let num_keys = buf.get_u32_le() as usize;
        let num_labels = buf.get_u32_le() as usize;
        need(buf, num_labels, "labels")?;
        let labels = buf[..num_labels].to_vec();
        buf.advance(num_labels);

        let has_child = BitVector::read_from(buf)?;
        let louds = BitVector::read_from(buf)?;
        let is_prefix_key = BitVector::read_from(buf)?;
        let has_prefix = BitVector::read_from(buf)?;
        if has_child.len() != num_labels || louds.len() != num_labels {
            return Err(SlotError::Corruption("trie label vectors disagree".into()));
        }

        need(buf, 4, "prefix offsets")?;
        let n = buf.get_u32_le() as usize;
        need(buf, n * 4, "prefix offsets")?;
        let prefix_offsets: Vec<u32> = (0..n).map(|_| buf.get_u32_le()).collect();

        need(buf, 4, "prefix bytes")?;
        let n = buf.get_u32_le() as usize;
        need(buf, n, "prefix bytes")?;
        let prefix_bytes = buf[..n].to_vec();
        buf.advance(n);

        need(buf, 4, "values")?;
        let n = buf.get_u32_le() as usize;
        need(buf, n * 4, "values")?;
        let values: Vec<u32> = (0..n).map(|_| buf.get_u32_le()).collect();

        if prefix_offsets.len() != has_prefix.count_ones() + 1 || values.len() != num_keys {
            return Err(SlotError::Corruption("trie vectors disagree".into()));
        }

        Ok(Trie {
            num_keys,
            labels,
            has_child: RankVector::new(has_child),
            louds: SelectVector::new(louds),
            is_prefix_key,
            has_prefix: RankVector::new(has_prefix),
            prefix_offsets,
            prefix_bytes,
            values,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }
}
