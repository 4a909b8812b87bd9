//! Row wire format of replicated batches
//!
//! ```text
//! [metric_id u32][series_id u32][timestamp i64][field_count u8]
//! [field_id u8][field_type u8][value f64] * field_count
//! ```
//!
//! All integers are little endian. A batch is rows back to back.

use bytes::{Buf, BufMut};

use crate::types::{FieldType, Row, RowField};
use crate::{Result, SlotError};

const ROW_HEADER_SIZE: usize = 4 + 4 + 8 + 1;
const FIELD_SIZE: usize = 1 + 1 + 8;

/// Encoded size of `row`
pub fn encoded_len(row: &Row) -> usize {
    ROW_HEADER_SIZE + row.fields.len() * FIELD_SIZE
}

/// Append `row` to `buf`
pub fn encode_row(row: &Row, buf: &mut Vec<u8>) -> Result<()> {
    let count = u8::try_from(row.fields.len()).map_err(|_| {
        SlotError::InvalidFormat(format!(
            "row of metric {} has {} fields, at most 255 allowed",
            row.metric_id,
            row.fields.len()
        ))
    })?;
    buf.reserve(encoded_len(row));
    buf.put_u32_le(row.metric_id);
    buf.put_u32_le(row.series_id);
    buf.put_i64_le(row.timestamp);
    buf.put_u8(count);
    for f in &row.fields {
        buf.put_u8(f.id);
        buf.put_u8(f.field_type as u8);
        buf.put_f64_le(f.value);
    }
    Ok(())
}

/// Decode every row of a batch
pub fn decode_rows(mut data: &[u8]) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    while data.has_remaining() {
        if data.remaining() < ROW_HEADER_SIZE {
            return Err(SlotError::Corruption(format!(
                "row header truncated: {} bytes left",
                data.remaining()
            )));
        }
        let metric_id = data.get_u32_le();
        let series_id = data.get_u32_le();
        let timestamp = data.get_i64_le();
        let count = data.get_u8() as usize;
        if data.remaining() < count * FIELD_SIZE {
            return Err(SlotError::Corruption(format!(
                "row of metric {metric_id} truncated: {count} fields announced"
            )));
        }
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let id = data.get_u8();
            let field_type = FieldType::try_from(data.get_u8())?;
            let value = data.get_f64_le();
            fields.push(RowField { id, field_type, value });
        }
        rows.push(Row {
            metric_id,
            series_id,
            timestamp,
            fields,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_layout() {
        let rows = vec![
            Row::new(1, 7, 1_000).with_field(1, FieldType::Sum, 1.5),
            Row::new(2, 9, -5)
                .with_field(1, FieldType::Min, -2.0)
                .with_field(3, FieldType::Last, 4.0),
            Row::new(3, 1, 0),
        ];
        let mut buf = Vec::new();
        for r in &rows {
            encode_row(r, &mut buf).unwrap();
        }
        assert_eq!(buf.len(), rows.iter().map(encoded_len).sum::<usize>());
        assert_eq!(&buf[..4], &1u32.to_le_bytes());
        assert_eq!(buf[16], 1);
        assert_eq!(decode_rows(&buf).unwrap(), rows);
    }

    #[test]
    fn test_truncated_batch_is_corrupt() {
        let mut buf = Vec::new();
        encode_row(&Row::new(1, 1, 1).with_field(1, FieldType::Sum, 1.0), &mut buf).unwrap();
        assert!(decode_rows(&buf[..buf.len() - 3]).unwrap_err().is_corruption());
        assert!(decode_rows(&buf[..10]).unwrap_err().is_corruption());

        let mut bad_type = buf.clone();
        bad_type[ROW_HEADER_SIZE + 1] = 99;
        assert!(decode_rows(&bad_type).is_err());
    }
}
