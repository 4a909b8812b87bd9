//! WAL record framing

use crate::{Result, SlotError};
use bytes::{Buf, BufMut};

/// `[payload len u32][seq u64]`
pub const RECORD_HEADER_SIZE: usize = 12;
const CHECKSUM_SIZE: usize = 4;

/// Bytes a record of `payload_len` occupies on disk
pub fn encoded_len(payload_len: usize) -> usize {
    RECORD_HEADER_SIZE + payload_len + CHECKSUM_SIZE
}

/// Append one framed record to `buf`
///
/// Format:
/// - 4 bytes: payload length
/// - 8 bytes: sequence
/// - N bytes: payload
/// - 4 bytes: CRC32 over sequence and payload
pub fn encode(seq: u64, payload: &[u8], buf: &mut Vec<u8>) {
    buf.reserve(encoded_len(payload.len()));
    let start = buf.len();
    buf.put_u32_le(payload.len() as u32);
    buf.put_u64_le(seq);
    buf.put_slice(payload);
    let checksum = crc32fast::hash(&buf[start + 4..]);
    buf.put_u32_le(checksum);
}

/// A decoded record borrowing its payload
#[derive(Debug, PartialEq, Eq)]
pub struct Record<'a> {
    pub seq: u64,
    pub payload: &'a [u8],
}

/// Decode the record at the front of `data`.
///
/// Returns `Ok(None)` when `data` ends inside the record (a torn write) and
/// `ChecksumMismatch` when the record is complete but damaged.
pub fn decode(data: &[u8]) -> Result<Option<(Record<'_>, usize)>> {
    if data.len() < RECORD_HEADER_SIZE {
        return Ok(None);
    }
    let mut cursor = data;
    let len = cursor.get_u32_le() as usize;
    let seq = cursor.get_u64_le();
    let total = encoded_len(len);
    if data.len() < total {
        return Ok(None);
    }

    let body = &data[4..RECORD_HEADER_SIZE + len];
    let expected = (&data[RECORD_HEADER_SIZE + len..total]).get_u32_le();
    let actual = crc32fast::hash(body);
    if expected != actual {
        return Err(SlotError::ChecksumMismatch { expected, actual });
    }

    Ok(Some((
        Record {
            seq,
            payload: &data[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + len],
        },
        total,
    )))
}
