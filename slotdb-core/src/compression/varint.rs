//! LEB128 variable-length integers

use crate::{Result, SlotError};

/// Append `value` as an unsigned varint
pub fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Append `value` zigzag-encoded
pub fn put_varint(buf: &mut Vec<u8>, value: i64) {
    put_uvarint(buf, ((value << 1) ^ (value >> 63)) as u64);
}

/// Read an unsigned varint, returning the value and bytes consumed
pub fn get_uvarint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for (i, byte) in buf.iter().enumerate().take(10) {
        value |= ((byte & 0x7F) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(SlotError::InvalidFormat("varint overflow or truncated".into()))
}

/// Read a zigzag varint
pub fn get_varint(buf: &[u8]) -> Result<(i64, usize)> {
    let (raw, n) = get_uvarint(buf)?;
    Ok((((raw >> 1) as i64) ^ -((raw & 1) as i64), n))
}

/// Sequential varint reader over a byte slice
#[derive(Debug)]
pub struct VarintReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> VarintReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_uvarint(&mut self) -> Result<u64> {
        let (v, n) = get_uvarint(&self.buf[self.pos..])?;
        self.pos += n;
        Ok(v)
    }

    pub fn read_varint(&mut self) -> Result<i64> {
        let (v, n) = get_varint(&self.buf[self.pos..])?;
        self.pos += n;
        Ok(v)
    }

    /// Read `len` raw bytes
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(SlotError::InvalidFormat(format!(
                "need {len} bytes at {}, have {}",
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varints() {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, 0);
        put_uvarint(&mut buf, 300);
        put_uvarint(&mut buf, u64::MAX);
        put_varint(&mut buf, -1);
        put_varint(&mut buf, i64::MIN);
        buf.extend_from_slice(b"abc");

        let mut reader = VarintReader::new(&buf);
        assert_eq!(reader.read_uvarint().unwrap(), 0);
        assert_eq!(reader.read_uvarint().unwrap(), 300);
        assert_eq!(reader.read_uvarint().unwrap(), u64::MAX);
        assert_eq!(reader.read_varint().unwrap(), -1);
        assert_eq!(reader.read_varint().unwrap(), i64::MIN);
        assert_eq!(reader.read_bytes(3).unwrap(), b"abc");
        assert!(reader.is_empty());
        assert!(reader.read_uvarint().is_err());
    }
}
