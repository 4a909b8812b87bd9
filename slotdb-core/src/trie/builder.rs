//! Level-order trie construction

use std::collections::VecDeque;

use super::bitvec::{BitVector, RankVector, SelectVector};
use super::{Trie, TERMINATOR};
use crate::{Result, SlotError};

/// Collects sorted keys and builds a [`Trie`]
#[derive(Debug, Default)]
pub struct TrieBuilder {
    keys: Vec<Vec<u8>>,
    values: Vec<u32>,
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

impl TrieBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key. Keys must arrive in strictly ascending byte order.
    pub fn add(&mut self, key: &[u8], value: u32) -> Result<()> {
        if let Some(last) = self.keys.last() {
            if key <= last.as_slice() {
                return Err(SlotError::InvalidFormat(format!(
                    "trie keys out of order: {:?} after {:?}",
                    String::from_utf8_lossy(key),
                    String::from_utf8_lossy(last)
                )));
            }
        }
        self.keys.push(key.to_vec());
        self.values.push(value);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn build(self) -> Trie {
        let keys = &self.keys;
        let mut labels = Vec::new();
        let mut has_child = BitVector::new();
        let mut louds = BitVector::new();
        let mut is_prefix_key = BitVector::new();
        let mut has_prefix = BitVector::new();
        let mut prefix_offsets = vec![0u32];
        let mut prefix_bytes = Vec::new();
        let mut values = Vec::with_capacity(keys.len());

        // (first key, end key, depth) of every node, in level order
        let mut queue = VecDeque::new();
        if !keys.is_empty() {
            queue.push_back((0usize, keys.len(), 0usize));
        }

        while let Some((mut lo, hi, depth)) = queue.pop_front() {
            let lcp = if hi - lo == 1 {
                // keep the last byte as a label so the key ends on a leaf
                keys[lo].len().saturating_sub(depth).saturating_sub(1)
            } else {
                common_prefix_len(&keys[lo][depth..], &keys[hi - 1][depth..])
            };
            let d = depth + lcp;

            has_prefix.push(lcp > 0);
            if lcp > 0 {
                prefix_bytes.extend_from_slice(&keys[lo][depth..d]);
                prefix_offsets.push(prefix_bytes.len() as u32);
            }

            let mut first = true;
            if keys[lo].len() == d {
                is_prefix_key.push(true);
                labels.push(TERMINATOR);
                has_child.push(false);
                louds.push(true);
                values.push(self.values[lo]);
                first = false;
                lo += 1;
            } else {
                is_prefix_key.push(false);
            }

            while lo < hi {
                let label = keys[lo][d];
                let mut end = lo + 1;
                while end < hi && keys[end][d] == label {
                    end += 1;
                }
                labels.push(label);
                louds.push(first);
                first = false;
                if end - lo == 1 && keys[lo].len() == d + 1 {
                    has_child.push(false);
                    values.push(self.values[lo]);
                } else {
                    has_child.push(true);
                    queue.push_back((lo, end, d + 1));
                }
                lo = end;
            }
        }

        Trie {
            num_keys: keys.len(),
            labels,
            has_child: RankVector::new(has_child),
            louds: SelectVector::new(louds),
            is_prefix_key,
            has_prefix: RankVector::new(has_prefix),
            prefix_offsets,
            prefix_bytes,
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_unsorted() {
        let mut builder = TrieBuilder::new();
        builder.add(b"b", 1).unwrap();
        assert!(builder.add(b"a", 2).is_err());
        assert!(builder.add(b"b", 2).is_err());
        assert_eq!(builder.len(), 1);
    }

    #[test]
    fn test_builder_path_compression() {
        let mut builder = TrieBuilder::new();
        builder.add(b"host-0001", 0).unwrap();
        builder.add(b"host-0002", 1).unwrap();
        let trie = builder.build();
        // root holds prefix "host-000" and two leaf labels
        assert_eq!(trie.num_nodes(), 1);
        assert_eq!(trie.labels, b"12".to_vec());
        assert_eq!(trie.prefix_bytes, b"host-000".to_vec());
    }
}
