//! TSD encoder: slot presence bits plus XOR-compressed float values

use super::bitstream::BitWriter;
use super::TSD_HEADER_SIZE;
use bytes::BufMut;

/// Encodes the values of one field over a contiguous slot range.
///
/// Slots must be pushed in strictly increasing order. Every slot between the
/// first and the last pushed slot costs one presence bit; present slots also
/// carry the value, XOR'd against the previous present value.
pub struct TsdEncoder {
    writer: BitWriter,
    start_slot: u16,
    next_slot: Option<u16>,
    count: usize,

    prev_value_bits: u64,
    prev_leading_zeros: u32,
    prev_trailing_zeros: u32,
}

impl TsdEncoder {
    /// Create a new encoder. `start_slot` is a lower bound for pushed slots.
    pub fn new(start_slot: u16) -> Self {
        Self {
            writer: BitWriter::with_capacity(64),
            start_slot,
            next_slot: None,
            count: 0,
            prev_value_bits: 0,
            prev_leading_zeros: u32::MAX,
            prev_trailing_zeros: 0,
        }
    }

    /// Append a value at `slot`
    pub fn push(&mut self, slot: u16, value: f64) {
        match self.next_slot {
            None => {
                debug_assert!(slot >= self.start_slot);
                // the range begins at the first present slot
                self.start_slot = slot;
            }
            Some(next) => {
                debug_assert!(slot >= next, "slots must be strictly increasing");
                for _ in next..slot {
                    self.writer.write_bit(false);
                }
            }
        }
        self.writer.write_bit(true);

        if self.count == 0 {
            let bits = value.to_bits();
            self.writer.write_bits(bits, 64);
            self.prev_value_bits = bits;
        } else {
            self.encode_value(value);
        }
        self.count += 1;
        self.next_slot = Some(slot.wrapping_add(1));
    }

    /// Number of values pushed
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Finish encoding. Returns `None` when no value was pushed.
    pub fn finish(self) -> Option<Vec<u8>> {
        let next = self.next_slot?;
        let end_slot = next.wrapping_sub(1);
        let bits = self.writer.finish();
        let mut buf = Vec::with_capacity(TSD_HEADER_SIZE + bits.len());
        buf.put_u16_le(self.start_slot);
        buf.put_u16_le(end_slot);
        buf.extend_from_slice(&bits);
        Some(buf)
    }

    fn encode_value(&mut self, value: f64) {
        let value_bits = value.to_bits();
        let xor = value_bits ^ self.prev_value_bits;

        if xor == 0 {
            self.writer.write_bit(false);
        } else {
            self.writer.write_bit(true);

            let leading_zeros = xor.leading_zeros();
            let trailing_zeros = xor.trailing_zeros();

            if self.prev_leading_zeros != u32::MAX
                && leading_zeros >= self.prev_leading_zeros
                && trailing_zeros >= self.prev_trailing_zeros
            {
                // reuse the previous window
                self.writer.write_bit(false);
                let meaningful_bits = 64 - self.prev_leading_zeros - self.prev_trailing_zeros;
                self.writer
                    .write_bits(xor >> self.prev_trailing_zeros, meaningful_bits as usize);
            } else {
                self.writer.write_bit(true);
                let meaningful_bits = 64 - leading_zeros - trailing_zeros;
                // 6 bits of leading zeros, 6 bits of (meaningful - 1)
                self.writer.write_bits(leading_zeros as u64, 6);
                self.writer.write_bits((meaningful_bits - 1) as u64, 6);
                self.writer
                    .write_bits(xor >> trailing_zeros, meaningful_bits as usize);

                self.prev_leading_zeros = leading_zeros;
                self.prev_trailing_zeros = trailing_zeros;
            }
        }

        self.prev_value_bits = value_bits;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoder_single_point() {
        let mut encoder = TsdEncoder::new(0);
        encoder.push(5, 23.5);
        assert_eq!(encoder.len(), 1);
        let data = encoder.finish().unwrap();

        assert_eq!(u16::from_le_bytes([data[0], data[1]]), 5);
        assert_eq!(u16::from_le_bytes([data[2], data[3]]), 5);
    }

    #[test]
    fn test_encoder_empty() {
        assert!(TsdEncoder::new(0).finish().is_none());
    }

    #[test]
    fn test_encoder_constant_values() {
        let mut encoder = TsdEncoder::new(0);
        for slot in 0..360 {
            encoder.push(slot, 23.5);
        }
        let data = encoder.finish().unwrap();
        // two bits per slot after the first value
        assert!(data.len() < TSD_HEADER_SIZE + 8 + 360 / 4 + 2, "got {} bytes", data.len());
    }
}
