//! Kv family: a directory of tables under one version set
//!
//! Data families, forward and inverted tag indexes and series metadata are
//! all kv families; they differ only in the value layout and the merger used
//! to combine values of the same key.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use roaring::RoaringBitmap;
use tracing::{error, info, warn};

use crate::compaction::{CompactionConfig, Compactor, Merger};
use crate::sstable::{TableReader, TableWriter};
use crate::version::{
    table_path, FileMeta, Snapshot, TableCache, Version, VersionEdit, VersionSet, CORRUPT_SUFFIX,
};
use crate::Result;

pub struct KvFamily {
    name: String,
    set: VersionSet,
    compactor: Compactor,
    /// Serializes flush commits and compactions
    edit_lock: Mutex<()>,
}

impl KvFamily {
    pub fn open(
        dir: &Path,
        family_id: u32,
        cache: Arc<TableCache>,
        merger: Arc<dyn Merger>,
        compaction: CompactionConfig,
    ) -> Result<Self> {
        let set = VersionSet::open(dir, family_id, cache)?;
        Ok(Self {
            name: dir.display().to_string(),
            set,
            compactor: Compactor::new(compaction, merger),
            edit_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        self.set.dir()
    }

    pub fn version(&self) -> Arc<Version> {
        self.set.current()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.set.snapshot()
    }

    /// Writer of a new table; the file number comes from the version set
    pub fn new_table_writer(&self) -> Result<TableWriter> {
        TableWriter::create(self.set.dir(), self.set.new_file_number())
    }

    /// Publish a flushed table together with the logs of `edit`
    pub fn commit_flush(&self, file: Option<FileMeta>, mut edit: VersionEdit) -> Result<()> {
        if let Some(meta) = file {
            edit.add_file(meta);
        }
        if edit.is_empty() {
            return Ok(());
        }
        let _guard = self.edit_lock.lock();
        self.set.commit(edit)
    }

    /// Readers of every table of `snapshot`, oldest data first.
    /// Tables failing validation are quarantined and skipped.
    pub fn readers(&self, snapshot: &Snapshot) -> Result<Vec<Arc<TableReader>>> {
        let mut out = Vec::new();
        for file in snapshot.version().all_files() {
            if let Some(r) = self.open_reader(snapshot, file.meta())? {
                out.push(r);
            }
        }
        Ok(out)
    }

    /// Readers of the tables of `snapshot` that may hold `key`, oldest first
    pub fn readers_for_key(&self, snapshot: &Snapshot, key: u32) -> Result<Vec<Arc<TableReader>>> {
        let mut out = Vec::new();
        for file in snapshot.version().files_for_key(key) {
            if let Some(r) = self.open_reader(snapshot, file.meta())? {
                if r.contains(key) {
                    out.push(r);
                }
            }
        }
        Ok(out)
    }

    fn open_reader(&self, snapshot: &Snapshot, meta: &FileMeta) -> Result<Option<Arc<TableReader>>> {
        match snapshot.reader(meta.number) {
            Ok(r) => Ok(Some(r)),
            Err(e) if e.is_corruption() => {
                error!(family = %self.name, file = meta.number, error = %e, "corrupt table");
                self.quarantine(meta)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Value of `key` with every table's value merged, oldest first
    pub fn get(&self, key: u32) -> Result<Option<Vec<u8>>> {
        let snapshot = self.snapshot();
        let readers = self.readers_for_key(&snapshot, key)?;
        let values: Vec<&[u8]> = readers.iter().filter_map(|r| r.get(key)).collect();
        match values.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only.to_vec())),
            many => self.compactor.merger().merge(key, many),
        }
    }

    /// Every key stored in the family
    pub fn keys(&self) -> Result<RoaringBitmap> {
        let snapshot = self.snapshot();
        let mut keys = RoaringBitmap::new();
        for r in self.readers(&snapshot)? {
            keys |= r.keys();
        }
        Ok(keys)
    }

    /// Move a corrupt table aside and drop it from the version. A table
    /// that cannot be moved stays in the version so its file is kept.
    pub fn quarantine(&self, meta: &FileMeta) -> Result<()> {
        let _guard = self.edit_lock.lock();
        if !self.set.current().contains_file(meta.number) {
            return Ok(());
        }
        let path = table_path(self.set.dir(), meta.number);
        let mut target = path.clone().into_os_string();
        target.push(".");
        target.push(CORRUPT_SUFFIX);
        if let Err(e) = fs::rename(&path, &target) {
            warn!(file = ?path, error = %e, "failed to rename corrupt table, keep it in place");
            return Ok(());
        }
        self.set.cache().evict(self.set.dir(), meta.number);
        let mut edit = VersionEdit::new(self.set.family_id());
        edit.delete_file(meta.level, meta.number);
        self.set.commit(edit)?;
        warn!(family = %self.name, file = meta.number, "table quarantined");
        Ok(())
    }

    pub fn need_compact(&self) -> bool {
        self.compactor.pick(&self.set.current()).is_some()
    }

    /// Run pending compactions
    pub fn compact(&self) -> Result<usize> {
        let _guard = self.edit_lock.lock();
        let runs = self.compactor.compact(&self.set)?;
        if runs > 0 {
            info!(family = %self.name, runs, "family compacted");
        }
        Ok(runs)
    }
}
