//! Consumer cursor page

use super::segment::sync_dir;
use crate::{Result, SlotError};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const META_FILE: &str = "meta";
const META_MAGIC: &[u8; 8] = b"SLOTWALM";
const META_VERSION: u16 = 1;

/// Durable cursors of one consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Next sequence to hand out
    pub head: u64,
    /// Every sequence below this is acknowledged
    pub ack: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaPage {
    pub consumers: BTreeMap<String, Cursor>,
}

impl MetaPage {
    fn path(dir: &Path) -> PathBuf {
        dir.join(META_FILE)
    }

    /// Load the page, or an empty one when the queue is new
    pub fn load(dir: &Path) -> Result<MetaPage> {
        let path = Self::path(dir);
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(MetaPage::default()),
            Err(e) => return Err(e.into()),
        };

        if data.len() < META_MAGIC.len() + 2 + 4 + 4 || &data[..8] != META_MAGIC {
            return Err(SlotError::Corruption(format!("bad WAL meta page {:?}", path)));
        }
        let mut cursor = &data[8..];
        let version = cursor.get_u16_le();
        if version != META_VERSION {
            return Err(SlotError::UnsupportedVersion {
                what: "wal meta",
                version,
            });
        }
        let len = cursor.get_u32_le() as usize;
        if cursor.remaining() != len + 4 {
            return Err(SlotError::Corruption(format!("WAL meta length mismatch in {:?}", path)));
        }
        let body = &cursor[..len];
        let expected = (&cursor[len..]).get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(SlotError::ChecksumMismatch { expected, actual });
        }
        bincode::deserialize(body).map_err(|e| SlotError::Corruption(e.to_string()))
    }

    /// Persist atomically: write temp, fsync, rename
    pub fn store(&self, dir: &Path) -> Result<()> {
        let body = bincode::serialize(self).map_err(|e| SlotError::Internal(e.to_string()))?;
        let mut buf = Vec::with_capacity(body.len() + 18);
        buf.put_slice(META_MAGIC);
        buf.put_u16_le(META_VERSION);
        buf.put_u32_le(body.len() as u32);
        buf.put_slice(&body);
        buf.put_u32_le(crc32fast::hash(&body));

        let path = Self::path(dir);
        let tmp = dir.join(format!("{META_FILE}.tmp"));
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&buf)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        sync_dir(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_meta_roundtrip_and_corruption() {
        let dir = TempDir::new().unwrap();
        assert_eq!(MetaPage::load(dir.path()).unwrap(), MetaPage::default());

        let mut page = MetaPage::default();
        page.consumers.insert("1".into(), Cursor { head: 10, ack: 7 });
        page.consumers.insert("local".into(), Cursor { head: 3, ack: 3 });
        page.store(dir.path()).unwrap();
        assert_eq!(MetaPage::load(dir.path()).unwrap(), page);

        let path = dir.path().join(META_FILE);
        let mut data = fs::read(&path).unwrap();
        let n = data.len();
        data[n - 6] ^= 0x55;
        fs::write(&path, &data).unwrap();
        assert!(MetaPage::load(dir.path()).unwrap_err().is_corruption());
    }
}
