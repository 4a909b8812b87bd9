//! Bit-level I/O shared by the TSD codec

/// Bit writer, most significant bit first
#[derive(Debug)]
pub struct BitWriter {
    buffer: Vec<u8>,
    current_byte: u8,
    bit_position: u8,
}

impl BitWriter {
    /// Create a new BitWriter
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create with capacity hint
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            current_byte: 0,
            bit_position: 0,
        }
    }

    /// Write a single bit
    #[inline]
    pub fn write_bit(&mut self, bit: bool) {
        if bit {
            self.current_byte |= 1 << (7 - self.bit_position);
        }
        self.bit_position += 1;

        if self.bit_position == 8 {
            self.buffer.push(self.current_byte);
            self.current_byte = 0;
            self.bit_position = 0;
        }
    }

    /// Write the low `num_bits` bits of `value`
    #[inline]
    pub fn write_bits(&mut self, value: u64, mut num_bits: usize) {
        debug_assert!(num_bits <= 64);

        // fill the pending byte first, then emit whole bytes
        while num_bits > 0 {
            let free = (8 - self.bit_position) as usize;
            let take = free.min(num_bits);
            let shift = num_bits - take;
            let chunk = ((value >> shift) & ((1u64 << take) - 1)) as u8;
            self.current_byte |= chunk << (free - take);
            self.bit_position += take as u8;
            num_bits -= take;

            if self.bit_position == 8 {
                self.buffer.push(self.current_byte);
                self.current_byte = 0;
                self.bit_position = 0;
            }
        }
    }

    /// Finish writing and return the buffer, padding the last byte with zeros
    pub fn finish(mut self) -> Vec<u8> {
        if self.bit_position > 0 {
            self.buffer.push(self.current_byte);
        }
        self.buffer
    }

    /// Get current size in bytes
    pub fn len(&self) -> usize {
        self.buffer.len() + usize::from(self.bit_position > 0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.bit_position == 0
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bit reader over a borrowed buffer
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_position: usize,
    bit_position: u8,
}

impl<'a> BitReader<'a> {
    /// Create a new BitReader
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            byte_position: 0,
            bit_position: 0,
        }
    }

    /// Read a single bit
    #[inline]
    pub fn read_bit(&mut self) -> Option<bool> {
        let byte = *self.data.get(self.byte_position)?;
        let bit = (byte >> (7 - self.bit_position)) & 1 == 1;
        self.bit_position += 1;

        if self.bit_position == 8 {
            self.byte_position += 1;
            self.bit_position = 0;
        }

        Some(bit)
    }

    /// Read `num_bits` bits as a u64
    #[inline]
    pub fn read_bits(&mut self, mut num_bits: usize) -> Option<u64> {
        debug_assert!(num_bits <= 64);

        let mut value = 0u64;
        while num_bits > 0 {
            let byte = *self.data.get(self.byte_position)?;
            let avail = (8 - self.bit_position) as usize;
            let take = avail.min(num_bits);
            let chunk = (byte >> (avail - take)) & (((1u16 << take) - 1) as u8);
            value = (value << take) | chunk as u64;
            self.bit_position += take as u8;
            num_bits -= take;

            if self.bit_position == 8 {
                self.byte_position += 1;
                self.bit_position = 0;
            }
        }
        Some(value)
    }

    /// Rewind to the first bit
    pub fn reset(&mut self) {
        self.byte_position = 0;
        self.bit_position = 0;
    }

    /// Check if there are more bits to read
    pub fn has_more(&self) -> bool {
        self.byte_position < self.data.len()
    }

    /// Get the current position in bits
    pub fn position(&self) -> usize {
        self.byte_position * 8 + self.bit_position as usize
    }
}
