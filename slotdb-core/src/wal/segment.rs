//! WAL data segments

use super::record::{self, RECORD_HEADER_SIZE};
use crate::{Result, SlotError};
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::warn;

const SEGMENT_PREFIX: &str = "segment-";
const SEGMENT_SUFFIX: &str = ".log";

pub(crate) fn segment_file_name(base_seq: u64) -> String {
    format!("{SEGMENT_PREFIX}{base_seq}{SEGMENT_SUFFIX}")
}

pub(crate) fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}

/// One segment file holding records `[base_seq, base_seq + len)`
pub(crate) struct Segment {
    base_seq: u64,
    path: PathBuf,
    /// File offset of each record
    offsets: RwLock<Vec<u64>>,
    size: Mutex<u64>,
    reader: Mutex<File>,
    sealed_at: Mutex<Option<Instant>>,
}

impl Segment {
    /// Create an empty segment. Returns the segment and its append handle.
    pub(crate) fn create(dir: &Path, base_seq: u64) -> Result<(Segment, File)> {
        let path = dir.join(segment_file_name(base_seq));
        let tmp = path.with_extension("log.tmp");
        {
            let f = File::create(&tmp)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        sync_dir(dir)?;

        let writer = OpenOptions::new().append(true).open(&path)?;
        let reader = File::open(&path)?;
        Ok((
            Segment {
                base_seq,
                path,
                offsets: RwLock::new(Vec::new()),
                size: Mutex::new(0),
                reader: Mutex::new(reader),
                sealed_at: Mutex::new(None),
            },
            writer,
        ))
    }

    /// Open an existing segment, indexing its records.
    ///
    /// A torn or damaged tail is truncated when `is_last`; anywhere else it is
    /// corruption.
    pub(crate) fn open(path: &Path, base_seq: u64, is_last: bool) -> Result<(Segment, Option<File>)> {
        let data = fs::read(path)?;
        let mut offsets = Vec::new();
        let mut pos = 0usize;
        let mut valid_len = data.len();

        while pos < data.len() {
            let expected_seq = base_seq + offsets.len() as u64;
            let bad = match record::decode(&data[pos..]) {
                Ok(Some((rec, n))) if rec.seq == expected_seq => {
                    offsets.push(pos as u64);
                    pos += n;
                    continue;
                }
                Ok(Some((rec, _))) => format!("sequence {} where {} expected", rec.seq, expected_seq),
                Ok(None) => "torn record".to_string(),
                Err(e) => e.to_string(),
            };
            if !is_last {
                return Err(SlotError::Corruption(format!(
                    "{} at offset {} in {:?}",
                    bad, pos, path
                )));
            }
            warn!(
                segment = ?path,
                offset = pos,
                "{}, truncating segment tail",
                bad
            );
            valid_len = pos;
            break;
        }

        let writer = if is_last {
            let f = OpenOptions::new().write(true).open(path)?;
            if valid_len < data.len() {
                f.set_len(valid_len as u64)?;
                f.sync_all()?;
            }
            drop(f);
            Some(OpenOptions::new().append(true).open(path)?)
        } else {
            None
        };

        let reader = File::open(path)?;
        let segment = Segment {
            base_seq,
            path: path.to_path_buf(),
            offsets: RwLock::new(offsets),
            size: Mutex::new(valid_len as u64),
            reader: Mutex::new(reader),
            sealed_at: Mutex::new((!is_last).then(Instant::now)),
        };
        Ok((segment, writer))
    }

    pub(crate) fn base_seq(&self) -> u64 {
        self.base_seq
    }

    /// One past the last sequence held
    pub(crate) fn end_seq(&self) -> u64 {
        self.base_seq + self.offsets.read().len() as u64
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn size(&self) -> u64 {
        *self.size.lock()
    }

    pub(crate) fn contains(&self, seq: u64) -> bool {
        seq >= self.base_seq && seq < self.end_seq()
    }

    /// Register a record appended at the current end of file
    pub(crate) fn record_appended(&self, len: usize) {
        let mut size = self.size.lock();
        self.offsets.write().push(*size);
        *size += len as u64;
    }

    pub(crate) fn seal(&self) {
        self.sealed_at.lock().get_or_insert_with(Instant::now);
    }

    pub(crate) fn sealed_at(&self) -> Option<Instant> {
        *self.sealed_at.lock()
    }

    /// Read the payload of `seq`
    pub(crate) fn read(&self, seq: u64) -> Result<Vec<u8>> {
        let offset = {
            let offsets = self.offsets.read();
            let idx = seq
                .checked_sub(self.base_seq)
                .map(|i| i as usize)
                .filter(|i| *i < offsets.len())
                .ok_or_else(|| SlotError::NotFound(format!("seq {} in {:?}", seq, self.path)))?;
            offsets[idx]
        };

        let mut file = self.reader.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        file.read_exact(&mut header)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut buf = Vec::with_capacity(record::encoded_len(len));
        buf.extend_from_slice(&header);
        buf.resize(record::encoded_len(len), 0);
        file.read_exact(&mut buf[RECORD_HEADER_SIZE..])?;
        drop(file);

        match record::decode(&buf)? {
            Some((rec, _)) if rec.seq == seq => Ok(rec.payload.to_vec()),
            Some((rec, _)) => Err(SlotError::Corruption(format!(
                "read seq {} at slot of {} in {:?}",
                rec.seq, seq, self.path
            ))),
            None => Err(SlotError::Corruption(format!("short record {} in {:?}", seq, self.path))),
        }
    }

    /// Drop records `>= seq`. The append handle must be flushed first.
    pub(crate) fn truncate_from(&self, seq: u64) -> Result<()> {
        let mut offsets = self.offsets.write();
        let keep = seq.saturating_sub(self.base_seq) as usize;
        if keep >= offsets.len() {
            return Ok(());
        }
        let new_size = offsets[keep];
        let f = OpenOptions::new().write(true).open(&self.path)?;
        f.set_len(new_size)?;
        f.sync_all()?;
        offsets.truncate(keep);
        *self.size.lock() = new_size;
        Ok(())
    }

    pub(crate) fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Fsync a directory so renames inside it are durable
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn append(segment: &Segment, writer: &mut File, seq: u64, payload: &[u8]) {
        let mut buf = Vec::new();
        record::encode(seq, payload, &mut buf);
        writer.write_all(&buf).unwrap();
        segment.record_appended(buf.len());
    }

    #[test]
    fn test_segment_names() {
        assert_eq!(segment_file_name(42), "segment-42.log");
        assert_eq!(parse_segment_name("segment-42.log"), Some(42));
        assert_eq!(parse_segment_name("segment-42.log.tmp"), None);
        assert_eq!(parse_segment_name("meta"), None);
    }

    #[test]
    fn test_segment_read_and_reopen() {
        let dir = TempDir::new().unwrap();
        let (segment, mut writer) = Segment::create(dir.path(), 10).unwrap();
        for i in 0..5u64 {
            append(&segment, &mut writer, 10 + i, format!("msg-{i}").as_bytes());
        }
        assert_eq!(segment.end_seq(), 15);
        assert_eq!(segment.read(12).unwrap(), b"msg-2");
        assert!(segment.read(15).is_err());

        // torn tail
        writer.write_all(&[1, 2, 3]).unwrap();
        drop(writer);
        let path = segment.path().to_path_buf();
        drop(segment);

        assert!(Segment::open(&path, 10, false).is_err());
        let (reopened, writer) = Segment::open(&path, 10, true).unwrap();
        assert!(writer.is_some());
        assert_eq!(reopened.end_seq(), 15);
        assert_eq!(reopened.read(14).unwrap(), b"msg-4");

        reopened.truncate_from(13).unwrap();
        assert_eq!(reopened.end_seq(), 13);
        assert!(!reopened.contains(13));
    }
}
