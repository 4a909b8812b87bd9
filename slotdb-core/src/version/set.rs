//! Version set: manifest, CURRENT pointer and snapshots
//!
//! ```text
//! <family dir>/
//!   CURRENT            name of the live manifest
//!   MANIFEST-<n>       [magic 8][version u16] then framed edits
//!   <number>.sst
//! ```
//!
//! Opening replays the live manifest, then rewrites the resulting state into
//! a fresh manifest and swaps `CURRENT` before any new edit is accepted.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BufMut;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{parse_table_name, EditLog, TableCache, Version, VersionEdit};
use crate::sstable::TableReader;
use crate::wal::sync_dir;
use crate::{Result, SlotError};

pub const CURRENT_FILE: &str = "CURRENT";
const MANIFEST_PREFIX: &str = "MANIFEST-";
const MANIFEST_MAGIC: &[u8; 8] = b"SLOTMNFT";
const MANIFEST_VERSION: u16 = 1;
const MANIFEST_HEADER_SIZE: usize = 8 + 2;

/// Manifests larger than this are rewritten as a snapshot
pub const DEFAULT_MAX_MANIFEST_SIZE: u64 = 4 * 1024 * 1024;

fn manifest_name(number: u64) -> String {
    format!("{MANIFEST_PREFIX}{number:06}")
}

/// Append handle of the live manifest
trait ManifestFile: Write + Send {
    fn sync(&mut self) -> std::io::Result<()>;

    /// Cut the file back to `len` bytes
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl ManifestFile for File {
    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_all()
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

struct Manifest {
    number: u64,
    file: Box<dyn ManifestFile>,
    /// Length up to the last complete edit
    size: u64,
    /// A torn tail could not be cut off; the next edit goes to a new manifest
    broken: bool,
}

impl Manifest {
    /// Append one framed edit. A failed append is cut off again so the
    /// next edit follows the last complete one.
    fn append(&mut self, buf: &[u8]) -> Result<()> {
        let written = self.file.write_all(buf).and_then(|()| self.file.sync());
        match written {
            Ok(()) => {
                self.size += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(cut) = self.file.truncate(self.size).and_then(|()| self.file.sync()) {
                    warn!(manifest = self.number, error = %cut, "failed to cut torn manifest tail");
                    self.broken = true;
                }
                Err(e.into())
            }
        }
    }
}

/// Edit history and current version of one kv family
pub struct VersionSet {
    dir: PathBuf,
    family_id: u32,
    current: RwLock<Arc<Version>>,
    /// Single writer of the edit log
    manifest: Mutex<Manifest>,
    next_file_number: AtomicU64,
    max_manifest_size: u64,
    cache: Arc<TableCache>,
}

impl VersionSet {
    /// Open or create the version set rooted at `dir`
    pub fn open(dir: &Path, family_id: u32, cache: Arc<TableCache>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut version = Version::empty(dir);
        let mut next_file_number = 1u64;
        let mut old_manifest = None;

        if let Some(name) = read_current(dir)? {
            let number = name
                .strip_prefix(MANIFEST_PREFIX)
                .and_then(|n| n.parse::<u64>().ok())
                .ok_or_else(|| SlotError::Corruption(format!("bad CURRENT entry {name:?} in {dir:?}")))?;
            for edit in replay(&dir.join(&name))? {
                for log in &edit.logs {
                    match log {
                        EditLog::NextFileNumber(n) => next_file_number = next_file_number.max(*n),
                        EditLog::AddFile(f) => next_file_number = next_file_number.max(f.number + 1),
                        _ => {}
                    }
                }
                version = version.apply(&edit);
            }
            old_manifest = Some(number);
            info!(dir = ?dir, files = version.num_files(), "version set recovered");
        }

        let manifest_number = old_manifest.map_or(1, |n| n + 1);
        let snapshot = version.snapshot_edit(family_id, next_file_number);
        let manifest = write_manifest(dir, manifest_number, &snapshot)?;
        set_current(dir, manifest_number)?;
        if let Some(old) = old_manifest {
            remove_quietly(&dir.join(manifest_name(old)));
        }

        let set = Self {
            dir: dir.to_path_buf(),
            family_id,
            current: RwLock::new(Arc::new(version)),
            manifest: Mutex::new(manifest),
            next_file_number: AtomicU64::new(next_file_number),
            max_manifest_size: DEFAULT_MAX_MANIFEST_SIZE,
            cache,
        };
        set.remove_orphans()?;
        Ok(set)
    }

    pub fn with_max_manifest_size(mut self, size: u64) -> Self {
        self.max_manifest_size = size;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn family_id(&self) -> u32 {
        self.family_id
    }

    pub fn cache(&self) -> &Arc<TableCache> {
        &self.cache
    }

    /// Allocate a table file number
    pub fn new_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current(&self) -> Arc<Version> {
        self.current.read().clone()
    }

    /// Hold the current version until the snapshot is dropped
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            dir: self.dir.clone(),
            version: self.current(),
            cache: self.cache.clone(),
        }
    }

    /// Persist `edit`, then publish the version it produces
    pub fn commit(&self, mut edit: VersionEdit) -> Result<()> {
        edit.family_id = self.family_id;
        edit.next_file_number(self.next_file_number.load(Ordering::SeqCst));

        let mut manifest = self.manifest.lock();
        let mut buf = Vec::new();
        edit.encode_to(&mut buf)?;
        if manifest.broken {
            let current = self.current();
            self.roll_manifest(&mut manifest, &current)?;
        }
        if let Err(e) = manifest.append(&buf) {
            warn!(dir = ?self.dir, manifest = manifest.number, error = %e, "failed to append version edit");
            return Err(e);
        }

        let next = {
            let current = self.current.read();
            Arc::new(current.apply(&edit))
        };
        *self.current.write() = next.clone();
        debug!(dir = ?self.dir, version = next.id(), logs = edit.logs.len(), "version edit committed");

        if manifest.size > self.max_manifest_size {
            self.roll_manifest(&mut manifest, &next)?;
        }
        Ok(())
    }

    /// Snapshot `version` into the next manifest and point CURRENT at it
    fn roll_manifest(&self, manifest: &mut Manifest, version: &Version) -> Result<()> {
        let number = manifest.number + 1;
        let snapshot = version.snapshot_edit(self.family_id, self.next_file_number.load(Ordering::SeqCst));
        let fresh = write_manifest(&self.dir, number, &snapshot)?;
        set_current(&self.dir, number)?;
        let old = std::mem::replace(manifest, fresh);
        drop(old.file);
        remove_quietly(&self.dir.join(manifest_name(old.number)));
        info!(dir = ?self.dir, manifest = number, "manifest rewritten");
        Ok(())
    }

    /// Remove table files no version references, left by a crash
    fn remove_orphans(&self) -> Result<()> {
        let version = self.current();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let orphan = if let Some(tmp) = name.strip_suffix(".tmp") {
                parse_table_name(tmp).is_some()
            } else {
                parse_table_name(name).is_some_and(|n| !version.contains_file(n))
            };
            if orphan {
                warn!(file = ?entry.path(), "removing unreferenced table");
                remove_quietly(&entry.path());
            }
        }
        Ok(())
    }
}

/// A reference-counted view of one version
#[derive(Clone)]
pub struct Snapshot {
    dir: PathBuf,
    version: Arc<Version>,
    cache: Arc<TableCache>,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("dir", &self.dir)
            .field("version", &self.version.id())
            .finish()
    }
}

impl Snapshot {
    pub fn version(&self) -> &Arc<Version> {
        &self.version
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reader of a file of this snapshot
    pub fn reader(&self, number: u64) -> Result<Arc<TableReader>> {
        self.cache.get_reader(&self.dir, number)
    }
}

fn read_current(dir: &Path) -> Result<Option<String>> {
    match fs::read_to_string(dir.join(CURRENT_FILE)) {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Atomically point CURRENT at manifest `number`
fn set_current(dir: &Path, number: u64) -> Result<()> {
    let tmp = dir.join(format!("{CURRENT_FILE}.tmp"));
    {
        let mut f = File::create(&tmp)?;
        writeln!(f, "{}", manifest_name(number))?;
        f.sync_all()?;
    }
    fs::rename(&tmp, dir.join(CURRENT_FILE))?;
    sync_dir(dir)
}

/// Create manifest `number` holding `snapshot`, synced
fn write_manifest(dir: &Path, number: u64, snapshot: &VersionEdit) -> Result<Manifest> {
    let path = dir.join(manifest_name(number));
    let mut buf = Vec::new();
    buf.put_slice(MANIFEST_MAGIC);
    buf.put_u16_le(MANIFEST_VERSION);
    snapshot.encode_to(&mut buf)?;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)?;
    file.write_all(&buf)?;
    file.sync_all()?;
    drop(file);
    let file = OpenOptions::new().append(true).open(&path)?;
    Ok(Manifest {
        number,
        file: Box::new(file),
        size: buf.len() as u64,
        broken: false,
    })
}

/// Read every complete edit of a manifest. A torn final record is ignored.
fn replay(path: &Path) -> Result<Vec<VersionEdit>> {
    let data = fs::read(path)?;
    if data.len() < MANIFEST_HEADER_SIZE || &data[..8] != MANIFEST_MAGIC {
        return Err(SlotError::Corruption(format!("bad manifest header in {path:?}")));
    }
    let version = u16::from_le_bytes([data[8], data[9]]);
    if version != MANIFEST_VERSION {
        return Err(SlotError::UnsupportedVersion {
            what: "manifest",
            version,
        });
    }

    let mut edits = Vec::new();
    let mut pos = MANIFEST_HEADER_SIZE;
    while pos < data.len() {
        match VersionEdit::decode(&data[pos..])? {
            Some((edit, n)) => {
                edits.push(edit);
                pos += n;
            }
            None => {
                warn!(manifest = ?path, offset = pos, "torn manifest tail ignored");
                break;
            }
        }
    }
    Ok(edits)
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(file = ?path, error = %e, "failed to remove file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::{table_path, FileMeta};
    use tempfile::TempDir;

    fn open(dir: &Path) -> VersionSet {
        VersionSet::open(dir, 1, Arc::new(TableCache::new(16))).unwrap()
    }

    #[test]
    fn test_commit_and_recover() {
        let dir = TempDir::new().unwrap();
        {
            let set = open(dir.path());
            let n1 = set.new_file_number();
            let n2 = set.new_file_number();
            assert_eq!((n1, n2), (1, 2));
            let mut edit = VersionEdit::new(0);
            edit.add_file(FileMeta::new(n1, 1, 5, 10))
                .add_file(FileMeta::new(n2, 3, 9, 10))
                .sequence(1, 77);
            set.commit(edit).unwrap();
            let mut edit = VersionEdit::new(0);
            edit.delete_file(0, n1);
            set.commit(edit).unwrap();
            assert_eq!(set.current().num_files(), 1);
        }

        let set = open(dir.path());
        let v = set.current();
        assert_eq!(v.num_files(), 1);
        assert!(v.contains_file(2));
        assert_eq!(v.sequence(1), Some(77));
        assert_eq!(set.new_file_number(), 3);
        // recovery snapshots into a fresh manifest
        assert_eq!(read_current(dir.path()).unwrap().unwrap(), "MANIFEST-000002");
        assert!(!dir.path().join("MANIFEST-000001").exists());
    }

    #[test]
    fn test_snapshot_keeps_deleted_file() {
        let dir = TempDir::new().unwrap();
        let set = open(dir.path());
        let n = set.new_file_number();
        fs::write(table_path(dir.path(), n), b"x").unwrap();
        let mut edit = VersionEdit::new(0);
        edit.add_file(FileMeta::new(n, 1, 1, 1));
        set.commit(edit).unwrap();

        let snapshot = set.snapshot();
        let mut edit = VersionEdit::new(0);
        edit.delete_file(0, n);
        set.commit(edit).unwrap();
        assert!(table_path(dir.path(), n).exists());
        assert!(snapshot.version().contains_file(n));
        drop(snapshot);
        assert!(!table_path(dir.path(), n).exists());
    }

    #[test]
    fn test_manifest_rewrite_and_orphans() {
        let dir = TempDir::new().unwrap();
        fs::write(table_path(dir.path(), 42), b"orphan").unwrap();
        let set = open(dir.path()).with_max_manifest_size(64);
        assert!(!table_path(dir.path(), 42).exists());

        for _ in 0..4 {
            let mut edit = VersionEdit::new(0);
            edit.add_file(FileMeta::new(set.new_file_number(), 0, 1, 1));
            set.commit(edit).unwrap();
        }
        let current = read_current(dir.path()).unwrap().unwrap();
        assert_ne!(current, "MANIFEST-000001");
        drop(set);
        assert_eq!(open(dir.path()).current().num_files(), 4);
    }

    /// Writes up to `budget` bytes, then fails
    struct ShortWrite {
        inner: File,
        budget: usize,
        cut: bool,
    }

    impl Write for ShortWrite {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.budget == 0 {
                return Err(std::io::Error::other("no space left"));
            }
            let n = self.inner.write(&buf[..buf.len().min(self.budget)])?;
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.inner.flush()
        }
    }

    impl ManifestFile for ShortWrite {
        fn sync(&mut self) -> std::io::Result<()> {
            self.inner.sync_all()
        }

        fn truncate(&mut self, len: u64) -> std::io::Result<()> {
            if !self.cut {
                return Err(std::io::Error::other("read-only"));
            }
            self.inner.set_len(len)
        }
    }

    fn add_file_edit(number: u64) -> VersionEdit {
        let mut edit = VersionEdit::new(0);
        edit.add_file(FileMeta::new(number, 0, 1, 1));
        edit
    }

    fn short_write(set: &VersionSet, budget: usize, cut: bool) {
        let mut manifest = set.manifest.lock();
        let path = set.dir.join(manifest_name(manifest.number));
        let inner = OpenOptions::new().append(true).open(path).unwrap();
        manifest.file = Box::new(ShortWrite { inner, budget, cut });
    }

    #[test]
    fn test_torn_edit_is_cut_off() {
        let dir = TempDir::new().unwrap();
        {
            let set = open(dir.path());
            set.commit(add_file_edit(set.new_file_number())).unwrap();

            short_write(&set, 5, true);
            let lost = set.new_file_number();
            assert!(set.commit(add_file_edit(lost)).is_err());
            assert!(!set.current().contains_file(lost));

            // the handle writes freely again
            short_write(&set, usize::MAX, true);
            set.commit(add_file_edit(set.new_file_number())).unwrap();
        }
        let set = open(dir.path());
        let v = set.current();
        assert_eq!(v.num_files(), 2);
        assert!(v.contains_file(1));
        assert!(!v.contains_file(2));
        assert!(v.contains_file(3));
    }

    #[test]
    fn test_uncut_tail_rolls_manifest() {
        let dir = TempDir::new().unwrap();
        {
            let set = open(dir.path());
            short_write(&set, 5, false);
            assert!(set.commit(add_file_edit(set.new_file_number())).is_err());
            assert!(set.manifest.lock().broken);

            set.commit(add_file_edit(set.new_file_number())).unwrap();
            assert!(!set.manifest.lock().broken);
            assert_eq!(read_current(dir.path()).unwrap().unwrap(), "MANIFEST-000002");
        }
        let v = open(dir.path()).current();
        assert_eq!(v.num_files(), 1);
        assert!(v.contains_file(2));
    }
}
