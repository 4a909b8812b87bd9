//! Bit vectors with rank and select support

use bytes::{Buf, BufMut};

use crate::{Result, SlotError};

const WORD_BITS: usize = 64;
/// Bits per rank block
pub const RANK_BLOCK_BITS: usize = 512;
/// One select sample every this many set bits
pub const SELECT_SAMPLE: usize = 64;

/// Plain growable bit vector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitVector {
    words: Vec<u64>,
    len: usize,
}

impl BitVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bit: bool) {
        if self.len % WORD_BITS == 0 {
            self.words.push(0);
        }
        if bit {
            let last = self.words.len() - 1;
            self.words[last] |= 1 << (self.len % WORD_BITS);
        }
        self.len += 1;
    }

    #[inline]
    pub fn get(&self, pos: usize) -> bool {
        debug_assert!(pos < self.len);
        (self.words[pos / WORD_BITS] >> (pos % WORD_BITS)) & 1 == 1
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub(crate) fn write_to(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.len as u32);
        for w in &self.words {
            buf.put_u64_le(*w);
        }
    }

    pub(crate) fn read_from(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(SlotError::InvalidFormat("bit vector truncated".into()));
        }
        let len = buf.get_u32_le() as usize;
        let num_words = len.div_ceil(WORD_BITS);
        if buf.remaining() < num_words * 8 {
            return Err(SlotError::InvalidFormat("bit vector words truncated".into()));
        }
        let words = (0..num_words).map(|_| buf.get_u64_le()).collect();
        Ok(Self { words, len })
    }
}

impl FromIterator<bool> for BitVector {
    fn from_iter<I: IntoIterator<Item = bool>>(iter: I) -> Self {
        let mut bv = BitVector::new();
        for bit in iter {
            bv.push(bit);
        }
        bv
    }
}

/// Bit vector with constant-time rank
#[derive(Debug, Clone)]
pub struct RankVector {
    bits: BitVector,
    /// Set bits before each block
    blocks: Vec<u32>,
}

impl RankVector {
    pub fn new(bits: BitVector) -> Self {
        let words_per_block = RANK_BLOCK_BITS / WORD_BITS;
        let mut blocks = Vec::with_capacity(bits.words.len() / words_per_block + 1);
        let mut acc = 0u32;
        for (i, w) in bits.words.iter().enumerate() {
            if i % words_per_block == 0 {
                blocks.push(acc);
            }
            acc += w.count_ones();
        }
        blocks.push(acc);
        Self { bits, blocks }
    }

    #[inline]
    pub fn get(&self, pos: usize) -> bool {
        self.bits.get(pos)
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn bits(&self) -> &BitVector {
        &self.bits
    }

    /// Set bits in `[0, pos)`
    pub fn rank1(&self, pos: usize) -> usize {
        debug_assert!(pos <= self.bits.len);
        let words_per_block = RANK_BLOCK_BITS / WORD_BITS;
        let block = pos / RANK_BLOCK_BITS;
        let mut rank = self.blocks[block] as usize;
        let word_idx = pos / WORD_BITS;
        for w in &self.bits.words[block * words_per_block..word_idx] {
            rank += w.count_ones() as usize;
        }
        let rem = pos % WORD_BITS;
        if rem > 0 {
            rank += (self.bits.words[word_idx] & ((1u64 << rem) - 1)).count_ones() as usize;
        }
        rank
    }
}

/// Bit vector with select over set bits
#[derive(Debug, Clone)]
pub struct SelectVector {
    bits: BitVector,
    /// Position of set bit number `k * SELECT_SAMPLE` (0-based)
    samples: Vec<u32>,
    ones: usize,
}

impl SelectVector {
    pub fn new(bits: BitVector) -> Self {
        let mut samples = Vec::new();
        let mut ones = 0usize;
        for pos in 0..bits.len() {
            if bits.get(pos) {
                if ones % SELECT_SAMPLE == 0 {
                    samples.push(pos as u32);
                }
                ones += 1;
            }
        }
        Self {
            bits,
            samples,
            ones,
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn bits(&self) -> &BitVector {
        &self.bits
    }

    pub fn count_ones(&self) -> usize {
        self.ones
    }

    /// Position of the `nth` set bit, 1-based
    pub fn select1(&self, nth: usize) -> Option<usize> {
        if nth == 0 || nth > self.ones {
            return None;
        }
        let idx = nth - 1;
        let mut pos = self.samples[idx / SELECT_SAMPLE] as usize;
        let mut remaining = idx % SELECT_SAMPLE;
        // the sampled position is itself a set bit
        if remaining == 0 {
            return Some(pos);
        }
        pos += 1;
        let mut word_idx = pos / WORD_BITS;
        let mut word = *self.bits.words.get(word_idx)? & (!0u64 << (pos % WORD_BITS));
        loop {
            let ones = word.count_ones() as usize;
            if remaining <= ones {
                // clear the lowest `remaining - 1` set bits
                for _ in 1..remaining {
                    word &= word - 1;
                }
                return Some(word_idx * WORD_BITS + word.trailing_zeros() as usize);
            }
            remaining -= ones;
            word_idx += 1;
            word = *self.bits.words.get(word_idx)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<bool> {
        (0..len).map(|i| i % 3 == 0 || i % 7 == 5).collect()
    }

    #[test]
    fn test_rank() {
        let bits = pattern(3000);
        let rv = RankVector::new(bits.iter().copied().collect());
        let mut expected = 0;
        for (pos, bit) in bits.iter().enumerate() {
            assert_eq!(rv.rank1(pos), expected, "rank at {pos}");
            expected += usize::from(*bit);
        }
        assert_eq!(rv.rank1(bits.len()), expected);
    }

    #[test]
    fn test_select() {
        let bits = pattern(3000);
        let sv = SelectVector::new(bits.iter().copied().collect());
        let positions: Vec<usize> = bits
            .iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .map(|(i, _)| i)
            .collect();
        for (i, pos) in positions.iter().enumerate() {
            assert_eq!(sv.select1(i + 1), Some(*pos));
        }
        assert_eq!(sv.select1(0), None);
        assert_eq!(sv.select1(positions.len() + 1), None);
    }

    #[test]
    fn test_bitvector_serialization() {
        let bv: BitVector = pattern(130).into_iter().collect();
        let mut buf = Vec::new();
        bv.write_to(&mut buf);
        let mut slice = buf.as_slice();
        assert_eq!(BitVector::read_from(&mut slice).unwrap(), bv);
        assert!(slice.is_empty());
    }
}
