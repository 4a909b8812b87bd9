//! Immutable file set views

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{table_path, EditLog, FileMeta, VersionEdit, NUM_LEVELS};
use crate::types::NodeId;

/// A table file referenced by versions.
///
/// Once a delete edit marks it obsolete, the file is unlinked when the last
/// version holding it goes away.
#[derive(Debug)]
pub struct TableFile {
    meta: FileMeta,
    path: PathBuf,
    obsolete: AtomicBool,
}

impl TableFile {
    pub(crate) fn new(dir: &Path, meta: FileMeta) -> Self {
        Self {
            path: table_path(dir, meta.number),
            meta,
            obsolete: AtomicBool::new(false),
        }
    }

    pub fn meta(&self) -> &FileMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for TableFile {
    fn drop(&mut self) {
        if !self.obsolete.load(Ordering::Acquire) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(file = ?self.path, "obsolete table removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(file = ?self.path, error = %e, "failed to remove obsolete table"),
        }
    }
}

/// File set of a kv family at one point of its edit history
#[derive(Debug, Clone)]
pub struct Version {
    id: u64,
    dir: PathBuf,
    levels: Vec<Vec<Arc<TableFile>>>,
    sequences: BTreeMap<NodeId, u64>,
}

impl Version {
    pub(crate) fn empty(dir: &Path) -> Self {
        Self {
            id: 0,
            dir: dir.to_path_buf(),
            levels: vec![Vec::new(); NUM_LEVELS],
            sequences: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Files of one level in file number order
    pub fn files(&self, level: u8) -> &[Arc<TableFile>] {
        self.levels
            .get(level as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every file, oldest data first: higher levels first, then by number
    pub fn all_files(&self) -> Vec<Arc<TableFile>> {
        self.levels.iter().rev().flatten().cloned().collect()
    }

    /// Files that may hold `key`, oldest data first
    pub fn files_for_key(&self, key: u32) -> Vec<Arc<TableFile>> {
        self.levels
            .iter()
            .rev()
            .flatten()
            .filter(|f| f.meta.contains_key(key))
            .cloned()
            .collect()
    }

    pub fn num_files(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }

    pub fn contains_file(&self, number: u64) -> bool {
        self.levels.iter().flatten().any(|f| f.meta.number == number)
    }

    /// Persisted WAL sequence per leader
    pub fn sequences(&self) -> &BTreeMap<NodeId, u64> {
        &self.sequences
    }

    pub fn sequence(&self, leader: NodeId) -> Option<u64> {
        self.sequences.get(&leader).copied()
    }

    /// Apply `edit`, producing the next version.
    /// Deleted files are marked obsolete; they stay alive in older versions.
    pub(crate) fn apply(&self, edit: &VersionEdit) -> Version {
        let mut next = self.clone();
        next.id = self.id + 1;
        for log in &edit.logs {
            match log {
                EditLog::AddFile(meta) => {
                    let level = (meta.level as usize).min(NUM_LEVELS - 1);
                    let files = &mut next.levels[level];
                    if files.iter().any(|f| f.meta.number == meta.number) {
                        continue;
                    }
                    let pos = files.partition_point(|f| f.meta.number < meta.number);
                    files.insert(pos, Arc::new(TableFile::new(&self.dir, meta.clone())));
                }
                EditLog::DeleteFile { level, number } => {
                    let Some(files) = next.levels.get_mut(*level as usize) else {
                        continue;
                    };
                    if let Some(pos) = files.iter().position(|f| f.meta.number == *number) {
                        files.remove(pos).mark_obsolete();
                    }
                }
                EditLog::Sequence { leader, seq } => {
                    let entry = next.sequences.entry(*leader).or_insert(*seq);
                    *entry = (*entry).max(*seq);
                }
                EditLog::NextFileNumber(_) => {}
            }
        }
        next
    }

    /// An edit recreating this version from scratch
    pub(crate) fn snapshot_edit(&self, family_id: u32, next_file_number: u64) -> VersionEdit {
        let mut edit = VersionEdit::new(family_id);
        for f in self.levels.iter().flatten() {
            edit.add_file(f.meta.clone());
        }
        for (leader, seq) in &self.sequences {
            edit.sequence(*leader, *seq);
        }
        edit.next_file_number(next_file_number);
        edit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_apply_and_deferred_delete() {
        let dir = TempDir::new().unwrap();
        fs::write(table_path(dir.path(), 1), b"x").unwrap();

        let v0 = Version::empty(dir.path());
        let mut add = VersionEdit::new(0);
        add.add_file(FileMeta::new(1, 0, 10, 1))
            .add_file(FileMeta::new(2, 5, 20, 1).with_level(1))
            .sequence(7, 40);
        let v1 = v0.apply(&add);
        assert_eq!(v1.num_files(), 2);
        assert_eq!(v1.sequence(7), Some(40));
        let order: Vec<u64> = v1.files_for_key(6).iter().map(|f| f.meta().number).collect();
        assert_eq!(order, vec![2, 1]);

        let mut del = VersionEdit::new(0);
        del.delete_file(0, 1).sequence(7, 30);
        let v2 = v1.apply(&del);
        assert!(!v2.contains_file(1));
        assert_eq!(v2.sequence(7), Some(40));
        // v1 still references the file
        assert!(table_path(dir.path(), 1).exists());
        drop(v1);
        assert!(!table_path(dir.path(), 1).exists());
    }
}
