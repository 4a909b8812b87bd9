//! Series-id bitmaps
//!
//! Series ids are grouped by their high 16 bits into containers; readers and
//! the query executor walk a bitmap container by container.

use crate::{Result, SlotError};
use roaring::RoaringBitmap;

pub use roaring::RoaringBitmap as Bitmap;

/// Low 16-bit values sharing one high key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub high_key: u16,
    pub lows: Vec<u16>,
}

impl Container {
    pub fn new(high_key: u16) -> Self {
        Self {
            high_key,
            lows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.lows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lows.is_empty()
    }

    /// Full series id of a low value
    #[inline]
    pub fn series_id(&self, low: u16) -> u32 {
        join(self.high_key, low)
    }

    pub fn series_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.lows.iter().map(move |low| join(self.high_key, *low))
    }

    pub fn contains(&self, low: u16) -> bool {
        self.lows.binary_search(&low).is_ok()
    }
}

#[inline]
pub fn high(id: u32) -> u16 {
    (id >> 16) as u16
}

#[inline]
pub fn low(id: u32) -> u16 {
    id as u16
}

#[inline]
pub fn join(high: u16, low: u16) -> u32 {
    ((high as u32) << 16) | low as u32
}

/// Split a bitmap into containers in a single ordered pass
pub fn containers(bitmap: &RoaringBitmap) -> Vec<Container> {
    let mut out: Vec<Container> = Vec::new();
    for id in bitmap.iter() {
        let hk = high(id);
        match out.last_mut() {
            Some(c) if c.high_key == hk => c.lows.push(low(id)),
            _ => {
                let mut c = Container::new(hk);
                c.lows.push(low(id));
                out.push(c);
            }
        }
    }
    out
}

/// Distinct high keys of a bitmap
pub fn high_keys(bitmap: &RoaringBitmap) -> Vec<u16> {
    let mut keys: Vec<u16> = Vec::new();
    for id in bitmap.iter() {
        let hk = high(id);
        if keys.last() != Some(&hk) {
            keys.push(hk);
        }
    }
    keys
}

/// The container of `bitmap` under `high_key`, if any
pub fn container(bitmap: &RoaringBitmap, high_key: u16) -> Option<Container> {
    let lo = join(high_key, 0);
    let hi = join(high_key, u16::MAX);
    let mut range = RoaringBitmap::new();
    range.insert_range(lo..=hi);
    range &= bitmap;
    if range.is_empty() {
        return None;
    }
    Some(Container {
        high_key,
        lows: range.iter().map(low).collect(),
    })
}

/// Serialize in the portable roaring format. Equal bitmaps give equal bytes.
pub fn serialize(bitmap: &RoaringBitmap) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(bitmap.serialized_size());
    bitmap.serialize_into(&mut buf)?;
    Ok(buf)
}

/// Append the serialized form to `buf`, returning the written length
pub fn serialize_into(bitmap: &RoaringBitmap, buf: &mut Vec<u8>) -> Result<usize> {
    let before = buf.len();
    bitmap.serialize_into(&mut *buf)?;
    Ok(buf.len() - before)
}

pub fn deserialize(data: &[u8]) -> Result<RoaringBitmap> {
    RoaringBitmap::deserialize_from(data)
        .map_err(|e| SlotError::Corruption(format!("bad bitmap: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_containers() {
        let bitmap: RoaringBitmap = [1u32, 5, 70_000, 70_001, 200_000].into_iter().collect();
        let cs = containers(&bitmap);
        assert_eq!(cs.len(), 3);
        assert_eq!(cs[0], Container { high_key: 0, lows: vec![1, 5] });
        assert_eq!(cs[1].series_ids().collect::<Vec<_>>(), vec![70_000, 70_001]);
        assert_eq!(high_keys(&bitmap), vec![0, 1, 3]);

        assert_eq!(container(&bitmap, 1), Some(cs[1].clone()));
        assert_eq!(container(&bitmap, 2), None);
        assert!(cs[2].contains(low(200_000)));
    }

    #[test]
    fn test_serialize_deterministic() {
        let a: RoaringBitmap = (0..1000u32).step_by(3).collect();
        let mut b = RoaringBitmap::new();
        for v in (0..1000u32).step_by(3).rev() {
            b.insert(v);
        }
        let bytes = serialize(&a).unwrap();
        assert_eq!(bytes, serialize(&b).unwrap());
        assert_eq!(deserialize(&bytes).unwrap(), a);
        assert!(deserialize(&bytes[..3]).is_err());

        let mut buf = vec![9u8];
        let n = serialize_into(&a, &mut buf).unwrap();
        assert_eq!(n, bytes.len());
    }
}
