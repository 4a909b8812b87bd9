//! Version edits and their manifest framing

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use super::FileMeta;
use crate::types::NodeId;
use crate::{Result, SlotError};

/// One change to a kv family's file set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditLog {
    AddFile(FileMeta),
    DeleteFile { level: u8, number: u64 },
    NextFileNumber(u64),
    /// Highest WAL sequence of `leader` whose rows are in the family's files
    Sequence { leader: NodeId, seq: u64 },
}

/// A batch of edit logs applied atomically
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionEdit {
    pub family_id: u32,
    pub logs: Vec<EditLog>,
}

const RECORD_HEADER_SIZE: usize = 4 + 4;

impl VersionEdit {
    pub fn new(family_id: u32) -> Self {
        Self {
            family_id,
            logs: Vec::new(),
        }
    }

    pub fn add_file(&mut self, file: FileMeta) -> &mut Self {
        self.logs.push(EditLog::AddFile(file));
        self
    }

    pub fn delete_file(&mut self, level: u8, number: u64) -> &mut Self {
        self.logs.push(EditLog::DeleteFile { level, number });
        self
    }

    pub fn next_file_number(&mut self, number: u64) -> &mut Self {
        self.logs.push(EditLog::NextFileNumber(number));
        self
    }

    pub fn sequence(&mut self, leader: NodeId, seq: u64) -> &mut Self {
        self.logs.push(EditLog::Sequence { leader, seq });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }

    /// Append `[len u32][crc u32][bincode body]` to `buf`
    pub fn encode_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        let body = bincode::serialize(self).map_err(|e| SlotError::Internal(e.to_string()))?;
        buf.put_u32_le(body.len() as u32);
        buf.put_u32_le(crc32fast::hash(&body));
        buf.put_slice(&body);
        Ok(())
    }

    /// Decode one record from the front of `data`.
    /// `None` on a torn record, corruption on a checksum mismatch.
    pub fn decode(data: &[u8]) -> Result<Option<(VersionEdit, usize)>> {
        if data.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }
        let mut header = &data[..RECORD_HEADER_SIZE];
        let len = header.get_u32_le() as usize;
        let expected = header.get_u32_le();
        let Some(body) = data.get(RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + len) else {
            return Ok(None);
        };
        let actual = crc32fast::hash(body);
        if actual != expected {
            return Err(SlotError::ChecksumMismatch { expected, actual });
        }
        let edit = bincode::deserialize(body).map_err(|e| SlotError::Corruption(e.to_string()))?;
        Ok(Some((edit, RECORD_HEADER_SIZE + len)))
    }
}
