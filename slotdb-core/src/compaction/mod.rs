//! Background compaction of kv families
//!
//! Flushes add tables to level 0. Once level 0 holds
//! [`CompactionConfig::l0_file_trigger`] files, all of them are merged
//! together with the level 1 files they overlap into a single level 1 table.
//! Values stored under the same key in several inputs are combined by the
//! family's [`Merger`], oldest value first.

use std::sync::Arc;

use roaring::RoaringBitmap;
use tracing::{debug, info};

use crate::sstable::{TableReader, TableWriter};
use crate::version::{FileMeta, Version, VersionEdit, VersionSet, COMPACT_LEVEL, FLUSH_LEVEL};
use crate::Result;

/// Combines the values a key holds in several tables.
///
/// `values` are ordered oldest first. Returning `None` drops the key.
pub trait Merger: Send + Sync {
    fn merge(&self, key: u32, values: &[&[u8]]) -> Result<Option<Vec<u8>>>;
}

/// Compaction configuration
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Level 0 file count that triggers a compaction
    pub l0_file_trigger: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            l0_file_trigger: crate::config::L0_COMPACTION_TRIGGER,
        }
    }
}

/// Input files of one compaction, oldest data first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionTask {
    pub level0: Vec<FileMeta>,
    pub level1: Vec<FileMeta>,
}

impl CompactionTask {
    /// Inputs in merge order: level 1 before level 0, each by file number
    pub fn inputs(&self) -> impl Iterator<Item = &FileMeta> {
        self.level1.iter().chain(self.level0.iter())
    }

    pub fn num_inputs(&self) -> usize {
        self.level0.len() + self.level1.len()
    }
}

/// Picks and runs compactions for one kv family
pub struct Compactor {
    config: CompactionConfig,
    merger: Arc<dyn Merger>,
}

impl Compactor {
    pub fn new(config: CompactionConfig, merger: Arc<dyn Merger>) -> Self {
        Self { config, merger }
    }

    pub fn merger(&self) -> &Arc<dyn Merger> {
        &self.merger
    }

    /// Check if `version` needs a compaction and return the task
    pub fn pick(&self, version: &Version) -> Option<CompactionTask> {
        let level0 = version.files(FLUSH_LEVEL);
        if level0.is_empty() || level0.len() < self.config.l0_file_trigger {
            return None;
        }
        let level0: Vec<FileMeta> = level0.iter().map(|f| f.meta().clone()).collect();
        let min_key = level0.iter().map(|f| f.min_key).min().unwrap_or(0);
        let max_key = level0.iter().map(|f| f.max_key).max().unwrap_or(0);
        let level1 = version
            .files(COMPACT_LEVEL)
            .iter()
            .filter(|f| f.meta().overlaps(min_key, max_key))
            .map(|f| f.meta().clone())
            .collect();
        Some(CompactionTask { level0, level1 })
    }

    /// Merge the inputs of `task` into one level 1 table and commit the swap.
    ///
    /// Returns the output table, `None` when every key was dropped.
    pub fn execute(&self, set: &VersionSet, task: &CompactionTask) -> Result<Option<FileMeta>> {
        info!(
            dir = ?set.dir(),
            level0 = task.level0.len(),
            level1 = task.level1.len(),
            "compacting"
        );
        let snapshot = set.snapshot();
        let readers = task
            .inputs()
            .map(|f| snapshot.reader(f.number))
            .collect::<Result<Vec<Arc<TableReader>>>>()?;

        let mut keys = RoaringBitmap::new();
        for r in &readers {
            keys |= r.keys();
        }

        let mut writer = TableWriter::create(set.dir(), set.new_file_number())?;
        let mut values: Vec<&[u8]> = Vec::with_capacity(readers.len());
        for key in keys.iter() {
            values.clear();
            values.extend(readers.iter().filter_map(|r| r.get(key)));
            let merged = match values.as_slice() {
                [] => continue,
                [only] => Some(only.to_vec()),
                many => self.merger.merge(key, many)?,
            };
            match merged {
                Some(value) => writer.add(key, &value)?,
                None => debug!(key, "key dropped by merger"),
            }
        }
        let output = writer.close()?.map(|f| f.with_level(COMPACT_LEVEL));

        let mut edit = VersionEdit::new(set.family_id());
        for f in &task.level0 {
            edit.delete_file(FLUSH_LEVEL, f.number);
        }
        for f in &task.level1 {
            edit.delete_file(COMPACT_LEVEL, f.number);
        }
        if let Some(meta) = &output {
            edit.add_file(meta.clone());
        }
        set.commit(edit)?;

        drop(readers);
        for f in task.inputs() {
            set.cache().evict(set.dir(), f.number);
        }
        info!(
            dir = ?set.dir(),
            inputs = task.num_inputs(),
            output = output.as_ref().map(|f| f.number),
            "compaction finished"
        );
        Ok(output)
    }

    /// Run compactions until the family no longer needs one
    pub fn compact(&self, set: &VersionSet) -> Result<usize> {
        let mut runs = 0;
        while let Some(task) = self.pick(&set.current()) {
            self.execute(set, &task)?;
            runs += 1;
        }
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::TableCache;
    use tempfile::TempDir;

    /// Concatenates values, drops keys whose merge would be empty
    struct Concat;

    impl Merger for Concat {
        fn merge(&self, _key: u32, values: &[&[u8]]) -> Result<Option<Vec<u8>>> {
            let out = values.concat();
            Ok((!out.is_empty()).then_some(out))
        }
    }

    fn flush(set: &VersionSet, entries: &[(u32, &[u8])]) {
        let mut w = TableWriter::create(set.dir(), set.new_file_number()).unwrap();
        for (k, v) in entries {
            w.add(*k, v).unwrap();
        }
        let meta = w.close().unwrap().unwrap();
        let mut edit = VersionEdit::new(0);
        edit.add_file(meta);
        set.commit(edit).unwrap();
    }

    #[test]
    fn test_pick_and_merge_oldest_first() {
        let dir = TempDir::new().unwrap();
        let set = VersionSet::open(dir.path(), 1, Arc::new(TableCache::new(8))).unwrap();
        let compactor = Compactor::new(CompactionConfig { l0_file_trigger: 2 }, Arc::new(Concat));

        flush(&set, &[(1, b"a"), (5, b"x")]);
        assert!(compactor.pick(&set.current()).is_none());
        flush(&set, &[(1, b"b"), (7, b"")]);
        assert_eq!(compactor.compact(&set).unwrap(), 1);

        flush(&set, &[(1, b"c")]);
        flush(&set, &[(2, b"d")]);
        let task = compactor.pick(&set.current()).unwrap();
        assert_eq!(task.level1.len(), 1);
        compactor.execute(&set, &task).unwrap().unwrap();

        let v = set.current();
        assert!(v.files(FLUSH_LEVEL).is_empty());
        assert_eq!(v.files(COMPACT_LEVEL).len(), 1);
        let out = set.snapshot().reader(v.files(COMPACT_LEVEL)[0].meta().number).unwrap();
        assert_eq!(out.get(1), Some(&b"abc"[..]));
        assert_eq!(out.get(2), Some(&b"d"[..]));
        assert_eq!(out.get(5), Some(&b"x"[..]));
        assert_eq!(out.get(7), Some(&b""[..]));
        drop(v);
        drop(out);

        // inputs are unlinked once no version holds them
        let tables = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().is_some_and(|x| x == "sst"))
            .count();
        assert_eq!(tables, 1);
    }
}
