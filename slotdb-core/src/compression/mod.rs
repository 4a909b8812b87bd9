//! Codec primitives
//!
//! - `TsdEncoder` / `TsdDecoder`: per-slot presence bits followed by
//!   XOR-of-previous float values with leading/trailing-zero windows.
//!   A block starts with `[slot_start u16 LE][slot_end u16 LE]`.
//! - Fixed-width offset tables and LEB128 varints used by the file formats.
//! - LZ4 block compression for replicated row batches.

mod bitstream;
mod decoder;
mod encoder;
mod offset;
pub mod varint;

pub use bitstream::{BitReader, BitWriter};
pub use decoder::TsdDecoder;
pub use encoder::TsdEncoder;
pub use offset::{FixedOffsetDecoder, FixedOffsetEncoder};

use crate::types::{FieldType, SlotRange};
use crate::{Result, SlotError};

/// Size of the slot range header of a TSD block
pub const TSD_HEADER_SIZE: usize = 4;

/// Compress a batch with LZ4, prefixed with its uncompressed size
pub fn compress_block(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

/// Inverse of [`compress_block`]
pub fn decompress_block(data: &[u8]) -> Result<Vec<u8>> {
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| SlotError::Compression(format!("LZ4 decompression failed: {}", e)))
}

/// Slot range of an encoded TSD block without decoding it
pub fn tsd_slot_range(data: &[u8]) -> Result<SlotRange> {
    Ok(TsdDecoder::new(data)?.slot_range())
}

/// Merge TSD blocks of one field into a single block.
///
/// Blocks are given oldest first; values colliding on a slot are combined
/// with the field type's merge function in that order.
pub fn merge_tsd_blocks(field_type: FieldType, blocks: &[&[u8]]) -> Result<Option<Vec<u8>>> {
    let mut decoders = blocks
        .iter()
        .map(|b| TsdDecoder::new(b))
        .collect::<Result<Vec<_>>>()?;
    let Some(range) = decoders
        .iter()
        .map(|d| d.slot_range())
        .reduce(|a, b| a.union(&b))
    else {
        return Ok(None);
    };

    let mut encoder = TsdEncoder::new(range.start);
    for slot in range.iter() {
        let mut merged: Option<f64> = None;
        for decoder in decoders.iter_mut() {
            if let Some(v) = decoder.get_value(slot)? {
                merged = Some(match merged {
                    Some(old) => field_type.merge(old, v),
                    None => v,
                });
            }
        }
        if let Some(v) = merged {
            encoder.push(slot, v);
        }
    }
    Ok(encoder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(points: &[(u16, f64)]) -> Vec<u8> {
        let mut encoder = TsdEncoder::new(0);
        for (s, v) in points {
            encoder.push(*s, *v);
        }
        encoder.finish().unwrap()
    }

    #[test]
    fn test_block_compression() {
        let data: Vec<u8> = (0..4096u32).flat_map(|i| (i % 17).to_le_bytes()).collect();
        let compressed = compress_block(&data);
        assert!(compressed.len() < data.len());
        assert_eq!(decompress_block(&compressed).unwrap(), data);
        assert!(decompress_block(&[1, 2]).is_err());
    }

    #[test]
    fn test_merge_disjoint_blocks() {
        let a = encode(&[(0, 1.0), (2, 2.0)]);
        let b = encode(&[(10, 5.0), (11, 6.0)]);
        let merged = merge_tsd_blocks(FieldType::Sum, &[&a, &b]).unwrap().unwrap();
        let mut decoder = TsdDecoder::new(&merged).unwrap();
        assert_eq!(decoder.slot_range(), SlotRange::new(0, 11));
        assert_eq!(
            decoder.decode_all().unwrap(),
            vec![(0, 1.0), (2, 2.0), (10, 5.0), (11, 6.0)]
        );
    }

    #[test]
    fn test_merge_colliding_slots() {
        let old = encode(&[(3, 1.0), (4, 9.0)]);
        let new = encode(&[(3, 2.5)]);
        let sum = merge_tsd_blocks(FieldType::Sum, &[&old, &new]).unwrap().unwrap();
        assert_eq!(TsdDecoder::new(&sum).unwrap().get_value(3).unwrap(), Some(3.5));

        let first = merge_tsd_blocks(FieldType::First, &[&old, &new]).unwrap().unwrap();
        assert_eq!(TsdDecoder::new(&first).unwrap().get_value(3).unwrap(), Some(1.0));

        let last = merge_tsd_blocks(FieldType::Last, &[&old, &new]).unwrap().unwrap();
        assert_eq!(TsdDecoder::new(&last).unwrap().get_value(3).unwrap(), Some(2.5));
        assert_eq!(tsd_slot_range(&last).unwrap(), SlotRange::new(3, 4));

        assert!(merge_tsd_blocks(FieldType::Sum, &[]).unwrap().is_none());
    }
}
