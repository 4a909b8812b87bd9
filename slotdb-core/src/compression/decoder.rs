//! TSD decoder with forward random access by slot

use super::bitstream::BitReader;
use super::TSD_HEADER_SIZE;
use crate::types::SlotRange;
use crate::{Result, SlotError};

fn truncated() -> SlotError {
    SlotError::Compression("TSD stream truncated".into())
}

/// Decoder over one TSD-encoded field block.
///
/// `get_value` is cheapest when slots are asked in ascending order; asking
/// for a slot behind the cursor rewinds to the start of the stream.
#[derive(Debug, Clone)]
pub struct TsdDecoder<'a> {
    reader: BitReader<'a>,
    range: SlotRange,
    /// Next slot to decode
    cursor: u32,
    seen: usize,

    prev_value_bits: u64,
    prev_leading_zeros: u32,
    prev_trailing_zeros: u32,
}

impl<'a> TsdDecoder<'a> {
    /// Create a decoder, validating the header
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < TSD_HEADER_SIZE {
            return Err(SlotError::Compression(format!(
                "TSD block too short: {} bytes",
                data.len()
            )));
        }
        let start = u16::from_le_bytes([data[0], data[1]]);
        let end = u16::from_le_bytes([data[2], data[3]]);
        if start > end {
            return Err(SlotError::Compression(format!(
                "TSD block has inverted slot range [{start}, {end}]"
            )));
        }
        Ok(Self {
            reader: BitReader::new(&data[TSD_HEADER_SIZE..]),
            range: SlotRange::new(start, end),
            cursor: start as u32,
            seen: 0,
            prev_value_bits: 0,
            prev_leading_zeros: 0,
            prev_trailing_zeros: 0,
        })
    }

    /// Slot range covered by the block
    pub fn slot_range(&self) -> SlotRange {
        self.range
    }

    /// Value at `slot`, or `None` when the slot is absent or out of range
    pub fn get_value(&mut self, slot: u16) -> Result<Option<f64>> {
        if !self.range.contains(slot) {
            return Ok(None);
        }
        if (slot as u32) < self.cursor {
            self.rewind();
        }
        while self.cursor < slot as u32 {
            self.next_slot()?;
        }
        Ok(self.next_slot()?.and_then(|(_, v)| v))
    }

    /// Decode the next slot, yielding (slot, value-if-present)
    pub fn next_slot(&mut self) -> Result<Option<(u16, Option<f64>)>> {
        if self.cursor > self.range.end as u32 {
            return Ok(None);
        }
        let slot = self.cursor as u16;
        self.cursor += 1;

        let present = self.reader.read_bit().ok_or_else(truncated)?;
        if !present {
            return Ok(Some((slot, None)));
        }
        let value = if self.seen == 0 {
            self.prev_value_bits = self.reader.read_bits(64).ok_or_else(truncated)?;
            f64::from_bits(self.prev_value_bits)
        } else {
            self.decode_value()?
        };
        self.seen += 1;
        Ok(Some((slot, Some(value))))
    }

    /// Decode every present value in slot order
    pub fn decode_all(&mut self) -> Result<Vec<(u16, f64)>> {
        self.rewind();
        let mut points = Vec::with_capacity(self.range.len());
        while let Some((slot, value)) = self.next_slot()? {
            if let Some(v) = value {
                points.push((slot, v));
            }
        }
        Ok(points)
    }

    fn rewind(&mut self) {
        self.reader.reset();
        self.cursor = self.range.start as u32;
        self.seen = 0;
        self.prev_value_bits = 0;
        self.prev_leading_zeros = 0;
        self.prev_trailing_zeros = 0;
    }

    fn decode_value(&mut self) -> Result<f64> {
        if !self.reader.read_bit().ok_or_else(truncated)? {
            return Ok(f64::from_bits(self.prev_value_bits));
        }

        let new_window = self.reader.read_bit().ok_or_else(truncated)?;
        if new_window {
            let leading = self.reader.read_bits(6).ok_or_else(truncated)? as u32;
            let meaningful = self.reader.read_bits(6).ok_or_else(truncated)? as u32 + 1;
            if leading + meaningful > 64 {
                return Err(SlotError::Compression(format!(
                    "TSD window out of bounds: leading {leading}, meaningful {meaningful}"
                )));
            }
            self.prev_leading_zeros = leading;
            self.prev_trailing_zeros = 64 - leading - meaningful;
        }

        let meaningful_bits = 64 - self.prev_leading_zeros - self.prev_trailing_zeros;
        let meaningful_value = self
            .reader
            .read_bits(meaningful_bits as usize)
            .ok_or_else(truncated)?;
        let xor = meaningful_value << self.prev_trailing_zeros;
        self.prev_value_bits ^= xor;

        Ok(f64::from_bits(self.prev_value_bits))
    }
}
