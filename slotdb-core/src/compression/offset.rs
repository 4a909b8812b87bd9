//! Fixed-width offset tables
//!
//! Layout: `[width u8][count u32 LE][count * width bytes LE]`. The width is
//! the byte width of the largest offset, so lookups are a single slice read.

use crate::{Result, SlotError};
use bytes::BufMut;

const HEADER_SIZE: usize = 5;

/// Encoder for a sequence of offsets
#[derive(Debug, Default)]
pub struct FixedOffsetEncoder {
    values: Vec<u32>,
    max: u32,
}

impl FixedOffsetEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, offset: u32) {
        self.max = self.max.max(offset);
        self.values.push(offset);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn reset(&mut self) {
        self.values.clear();
        self.max = 0;
    }

    /// Byte width needed for the largest offset
    fn width(&self) -> usize {
        match self.max {
            0..=0xFF => 1,
            0x100..=0xFFFF => 2,
            0x1_0000..=0xFF_FFFF => 3,
            _ => 4,
        }
    }

    /// Append the encoded table to `buf`
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        let width = self.width();
        buf.reserve(HEADER_SIZE + width * self.values.len());
        buf.put_u8(width as u8);
        buf.put_u32_le(self.values.len() as u32);
        for v in &self.values {
            buf.extend_from_slice(&v.to_le_bytes()[..width]);
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.write_to(&mut buf);
        buf
    }
}

/// Zero-copy view over an encoded offset table
#[derive(Debug, Clone, Copy)]
pub struct FixedOffsetDecoder<'a> {
    width: usize,
    count: usize,
    data: &'a [u8],
}

impl<'a> FixedOffsetDecoder<'a> {
    /// Parse a table from the front of `buf`
    pub fn new(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(SlotError::InvalidFormat("offset table header truncated".into()));
        }
        let width = buf[0] as usize;
        if !(1..=4).contains(&width) {
            return Err(SlotError::InvalidFormat(format!("offset width {width}")));
        }
        let count = u32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        let end = HEADER_SIZE + width * count;
        if buf.len() < end {
            return Err(SlotError::InvalidFormat(format!(
                "offset table needs {end} bytes, got {}",
                buf.len()
            )));
        }
        Ok(Self {
            width,
            count,
            data: &buf[HEADER_SIZE..end],
        })
    }

    /// Encoded size of the table, header included
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.data.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, idx: usize) -> Option<u32> {
        if idx >= self.count {
            return None;
        }
        let mut bytes = [0u8; 4];
        let start = idx * self.width;
        bytes[..self.width].copy_from_slice(&self.data[start..start + self.width]);
        Some(u32::from_le_bytes(bytes))
    }

    /// Byte range `[get(idx), get(idx + 1))`, the last entry ending at `limit`
    pub fn get_block(&self, idx: usize, limit: usize) -> Option<(usize, usize)> {
        let start = self.get(idx)? as usize;
        let end = match self.get(idx + 1) {
            Some(next) => next as usize,
            None => limit,
        };
        (start <= end && end <= limit).then_some((start, end))
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..self.count).filter_map(move |i| self.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_widths() {
        for max in [0u32, 200, 60_000, 1 << 20, u32::MAX] {
            let mut encoder = FixedOffsetEncoder::new();
            encoder.add(0);
            encoder.add(max / 2);
            encoder.add(max);
            let data = encoder.to_bytes();

            let decoder = FixedOffsetDecoder::new(&data).unwrap();
            assert_eq!(decoder.len(), 3);
            assert_eq!(decoder.encoded_len(), data.len());
            assert_eq!(decoder.iter().collect::<Vec<_>>(), vec![0, max / 2, max]);
            assert_eq!(decoder.get(3), None);
        }
    }

    #[test]
    fn test_offset_blocks() {
        let mut encoder = FixedOffsetEncoder::new();
        encoder.add(0);
        encoder.add(10);
        encoder.add(25);
        let data = encoder.to_bytes();
        let decoder = FixedOffsetDecoder::new(&data).unwrap();
        assert_eq!(decoder.get_block(0, 40), Some((0, 10)));
        assert_eq!(decoder.get_block(2, 40), Some((25, 40)));
        assert_eq!(decoder.get_block(2, 20), None);
        assert!(FixedOffsetDecoder::new(&data[..data.len() - 1]).is_err());
    }
}
