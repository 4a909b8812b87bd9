//! Row batch buffer
//!
//! Rows accumulate in encoded form until the buffer reaches its block size;
//! `compress` then hands out one LZ4 block and starts a new batch.

use super::codec;
use crate::compression::compress_block;
use crate::types::Row;
use crate::Result;

#[derive(Debug)]
pub struct Chunk {
    buf: Vec<u8>,
    rows: usize,
    block_size: usize,
}

impl Chunk {
    pub fn new(block_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(block_size),
            rows: 0,
            block_size: block_size.max(1),
        }
    }

    pub fn write(&mut self, row: &Row) -> Result<()> {
        codec::encode_row(row, &mut self.buf)?;
        self.rows += 1;
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.block_size
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Compressed batch of the buffered rows, or `None` when empty.
    /// The buffer is reset either way.
    pub fn compress(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            return None;
        }
        let compressed = compress_block(&self.buf);
        self.buf.clear();
        self.rows = 0;
        Some(compressed)
    }
}

/// Decompress and decode one batch
pub fn decode_batch(compressed: &[u8]) -> Result<Vec<Row>> {
    let raw = crate::compression::decompress_block(compressed)?;
    codec::decode_rows(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    #[test]
    fn test_chunk_fills_and_resets() {
        let row = Row::new(1, 1, 1_000).with_field(1, FieldType::Sum, 1.0);
        let mut chunk = Chunk::new(codec::encoded_len(&row) * 2);
        assert!(chunk.compress().is_none());

        chunk.write(&row).unwrap();
        assert!(!chunk.is_full());
        chunk.write(&row).unwrap();
        assert!(chunk.is_full());
        assert_eq!(chunk.rows(), 2);

        let batch = chunk.compress().unwrap();
        assert!(chunk.is_empty());
        assert_eq!(decode_batch(&batch).unwrap(), vec![row.clone(), row]);
        assert!(decode_batch(&[1, 2, 3]).is_err());
    }
}
