//! Key/value table files
//!
//! Every kv family (data, forward index, inverted index, series metadata)
//! stores its flushed state in the same table shape: `u32` keys in ascending
//! order, each with one opaque value.
//!
//! ```text
//! [magic 8][version u16]
//! [value 0][value 1]...                 body
//! [keys bitmap][fixed-offset table]     index
//! [index_pos u64][bitmap_len u32][data_crc u32][index_crc u32][version u16][magic 8]
//! ```

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use memmap2::Mmap;
use roaring::RoaringBitmap;
use tracing::debug;

use crate::bitmap;
use crate::compression::{FixedOffsetDecoder, FixedOffsetEncoder};
use crate::version::{table_path, FileMeta};
use crate::wal::sync_dir;
use crate::{Result, SlotError};

pub const TABLE_MAGIC: &[u8; 8] = b"SLOTSST\x01";
pub const TABLE_VERSION: u16 = 1;

const HEADER_SIZE: usize = 8 + 2;
const FOOTER_SIZE: usize = 8 + 4 + 4 + 4 + 2 + 8;

/// Streaming writer of one table file
pub struct TableWriter {
    number: u64,
    dir: PathBuf,
    tmp_path: PathBuf,
    file: BufWriter<File>,
    keys: RoaringBitmap,
    offsets: FixedOffsetEncoder,
    /// Body bytes written so far
    position: u64,
    data_crc: crc32fast::Hasher,
    last_key: Option<u32>,
}

impl TableWriter {
    /// Start `<dir>/<number>.sst`, written under a temp name until closed
    pub fn create(dir: &Path, number: u64) -> Result<Self> {
        let tmp_path = table_path(dir, number).with_extension("sst.tmp");
        let mut file = BufWriter::new(File::create(&tmp_path)?);

        let mut header = BytesMut::with_capacity(HEADER_SIZE);
        header.put_slice(TABLE_MAGIC);
        header.put_u16_le(TABLE_VERSION);
        file.write_all(&header)?;
        let mut data_crc = crc32fast::Hasher::new();
        data_crc.update(&header);

        Ok(Self {
            number,
            dir: dir.to_path_buf(),
            tmp_path,
            file,
            keys: RoaringBitmap::new(),
            offsets: FixedOffsetEncoder::new(),
            position: 0,
            data_crc,
            last_key: None,
        })
    }

    pub fn file_number(&self) -> u64 {
        self.number
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Append a value; keys must be strictly ascending
    pub fn add(&mut self, key: u32, value: &[u8]) -> Result<()> {
        if let Some(last) = self.last_key {
            if key <= last {
                return Err(SlotError::InvalidFormat(format!(
                    "table key {key} not after {last}"
                )));
            }
        }
        let offset = u32::try_from(self.position)
            .map_err(|_| SlotError::InvalidFormat("table body exceeds 4 GiB".into()))?;
        self.offsets.add(offset);
        self.keys.insert(key);
        self.file.write_all(value)?;
        self.data_crc.update(value);
        self.position += value.len() as u64;
        self.last_key = Some(key);
        Ok(())
    }

    /// Write the index and footer, then publish the file.
    /// An empty table is discarded and yields `None`.
    pub fn close(mut self) -> Result<Option<FileMeta>> {
        let (Some(min_key), Some(max_key)) = (self.keys.min(), self.keys.max()) else {
            self.abort()?;
            return Ok(None);
        };

        let mut index = Vec::new();
        let bitmap_len = bitmap::serialize_into(&self.keys, &mut index)?;
        self.offsets.write_to(&mut index);
        self.file.write_all(&index)?;

        let index_pos = (HEADER_SIZE as u64) + self.position;
        let mut footer = BytesMut::with_capacity(FOOTER_SIZE);
        footer.put_u64_le(index_pos);
        footer.put_u32_le(bitmap_len as u32);
        footer.put_u32_le(self.data_crc.clone().finalize());
        footer.put_u32_le(crc32fast::hash(&index));
        footer.put_u16_le(TABLE_VERSION);
        footer.put_slice(TABLE_MAGIC);
        self.file.write_all(&footer)?;

        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        let size = index_pos + index.len() as u64 + FOOTER_SIZE as u64;

        let path = table_path(&self.dir, self.number);
        fs::rename(&self.tmp_path, &path)?;
        sync_dir(&self.dir)?;
        debug!(file = ?path, keys = self.keys.len(), size, "table written");

        Ok(Some(FileMeta::new(self.number, min_key, max_key, size)))
    }

    /// Drop the partially written file
    pub fn abort(self) -> Result<()> {
        drop(self.file);
        match fs::remove_file(&self.tmp_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Memory-mapped reader of one table file
#[derive(Debug)]
pub struct TableReader {
    number: u64,
    path: PathBuf,
    mmap: Mmap,
    keys: Vec<u32>,
    key_bitmap: RoaringBitmap,
    /// Absolute end of the body
    body_end: usize,
    /// Absolute start of the offset table
    offsets_pos: usize,
}

impl TableReader {
    /// Open and validate `<dir>/<number>.sst`
    pub fn open(dir: &Path, number: u64) -> Result<Self> {
        let path = table_path(dir, number);
        let file = File::open(&path)?;
        // Table files are immutable once renamed into place
        let mmap = unsafe { Mmap::map(&file)? };
        let corrupt = |msg: String| SlotError::Corruption(format!("{msg} in {path:?}"));

        if mmap.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(corrupt(format!("table too small: {} bytes", mmap.len())));
        }
        if &mmap[..8] != TABLE_MAGIC {
            return Err(corrupt("bad table magic".into()));
        }
        let version = u16::from_le_bytes([mmap[8], mmap[9]]);
        if version != TABLE_VERSION {
            return Err(SlotError::UnsupportedVersion {
                what: "table",
                version,
            });
        }

        let footer_pos = mmap.len() - FOOTER_SIZE;
        let mut footer = &mmap[footer_pos..];
        let index_pos = footer.get_u64_le() as usize;
        let bitmap_len = footer.get_u32_le() as usize;
        let data_crc = footer.get_u32_le();
        let index_crc = footer.get_u32_le();
        let _footer_version = footer.get_u16_le();
        if footer != TABLE_MAGIC {
            return Err(corrupt("bad table footer magic".into()));
        }
        if index_pos < HEADER_SIZE || index_pos > footer_pos || bitmap_len > footer_pos - index_pos {
            return Err(corrupt(format!("index position {index_pos} out of bounds")));
        }

        let actual = crc32fast::hash(&mmap[..index_pos]);
        if actual != data_crc {
            return Err(SlotError::ChecksumMismatch {
                expected: data_crc,
                actual,
            });
        }
        let index = &mmap[index_pos..footer_pos];
        let actual = crc32fast::hash(index);
        if actual != index_crc {
            return Err(SlotError::ChecksumMismatch {
                expected: index_crc,
                actual,
            });
        }

        let key_bitmap = bitmap::deserialize(&index[..bitmap_len])?;
        let offsets_pos = index_pos + bitmap_len;
        let offsets = FixedOffsetDecoder::new(&mmap[offsets_pos..footer_pos])?;
        if offsets.len() != key_bitmap.len() as usize {
            return Err(corrupt(format!(
                "{} offsets for {} keys",
                offsets.len(),
                key_bitmap.len()
            )));
        }

        Ok(Self {
            number,
            path,
            keys: key_bitmap.iter().collect(),
            key_bitmap,
            body_end: index_pos,
            offsets_pos,
            mmap,
        })
    }

    pub fn file_number(&self) -> u64 {
        self.number
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.mmap.len()
    }

    pub fn keys(&self) -> &RoaringBitmap {
        &self.key_bitmap
    }

    pub fn contains(&self, key: u32) -> bool {
        self.key_bitmap.contains(key)
    }

    fn value_at(&self, idx: usize) -> Option<&[u8]> {
        let offsets = FixedOffsetDecoder::new(&self.mmap[self.offsets_pos..]).ok()?;
        let body = &self.mmap[HEADER_SIZE..self.body_end];
        let (start, end) = offsets.get_block(idx, body.len())?;
        Some(&body[start..end])
    }

    /// Value stored under `key`
    pub fn get(&self, key: u32) -> Option<&[u8]> {
        let idx = self.keys.binary_search(&key).ok()?;
        self.value_at(idx)
    }

    /// All entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        self.keys
            .iter()
            .enumerate()
            .filter_map(move |(idx, key)| self.value_at(idx).map(|v| (*key, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_table() {
        let dir = TempDir::new().unwrap();
        let mut writer = TableWriter::create(dir.path(), 5).unwrap();
        writer.add(1, b"one").unwrap();
        writer.add(70_000, b"").unwrap();
        writer.add(70_001, b"three").unwrap();
        assert!(writer.add(3, b"late").is_err());
        let meta = writer.close().unwrap().unwrap();
        assert_eq!((meta.number, meta.min_key, meta.max_key), (5, 1, 70_001));
        assert!(!dir.path().join("000005.sst.tmp").exists());

        let reader = TableReader::open(dir.path(), 5).unwrap();
        assert_eq!(reader.size() as u64, meta.size);
        assert_eq!(reader.get(1), Some(&b"one"[..]));
        assert_eq!(reader.get(70_000), Some(&b""[..]));
        assert_eq!(reader.get(70_001), Some(&b"three"[..]));
        assert_eq!(reader.get(2), None);
        let keys: Vec<u32> = reader.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![1, 70_000, 70_001]);
    }

    #[test]
    fn test_empty_table_discarded() {
        let dir = TempDir::new().unwrap();
        let writer = TableWriter::create(dir.path(), 1).unwrap();
        assert!(writer.close().unwrap().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_corrupt_table_refused() {
        let dir = TempDir::new().unwrap();
        let mut writer = TableWriter::create(dir.path(), 1).unwrap();
        writer.add(1, b"payload").unwrap();
        writer.close().unwrap();

        let path = table_path(dir.path(), 1);
        let mut data = fs::read(&path).unwrap();
        data[HEADER_SIZE] ^= 0xFF;
        fs::write(&path, &data).unwrap();
        let err = TableReader::open(dir.path(), 1).unwrap_err();
        assert!(err.is_corruption());

        data[HEADER_SIZE] ^= 0xFF;
        data[8] = 9;
        fs::write(&path, &data).unwrap();
        assert!(matches!(
            TableReader::open(dir.path(), 1),
            Err(SlotError::UnsupportedVersion { version: 9, .. })
        ));
    }

    #[test]
    fn test_footer_positions_out_of_bounds() {
        let dir = TempDir::new().unwrap();
        let mut writer = TableWriter::create(dir.path(), 1).unwrap();
        writer.add(1, b"payload").unwrap();
        writer.close().unwrap();

        let path = table_path(dir.path(), 1);
        let good = fs::read(&path).unwrap();
        let footer_pos = good.len() - FOOTER_SIZE;

        let mut data = good.clone();
        data[footer_pos..footer_pos + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        fs::write(&path, &data).unwrap();
        assert!(TableReader::open(dir.path(), 1).unwrap_err().is_corruption());

        let mut data = good.clone();
        data[footer_pos + 8..footer_pos + 12].copy_from_slice(&u32::MAX.to_le_bytes());
        fs::write(&path, &data).unwrap();
        assert!(TableReader::open(dir.path(), 1).unwrap_err().is_corruption());

        let mut data = good;
        let past_footer = (footer_pos as u64 + 1).to_le_bytes();
        data[footer_pos..footer_pos + 8].copy_from_slice(&past_footer);
        fs::write(&path, &data).unwrap();
        assert!(TableReader::open(dir.path(), 1).unwrap_err().is_corruption());
    }
}
