//! Cache of open table readers

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sstable::TableReader;
use crate::Result;

type CacheKey = (PathBuf, u64);

struct Entry {
    reader: Arc<TableReader>,
    last_used: u64,
}

/// LRU of table readers keyed by (family dir, file number).
///
/// An entry is only evicted while nothing outside the cache holds its reader.
pub struct TableCache {
    capacity: usize,
    entries: Mutex<HashMap<CacheKey, Entry>>,
    tick: AtomicU64,
}

impl TableCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
            tick: AtomicU64::new(0),
        }
    }

    /// Cached reader of `<dir>/<number>.sst`, opening it on a miss
    pub fn get_reader(&self, dir: &Path, number: u64) -> Result<Arc<TableReader>> {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let key = (dir.to_path_buf(), number);
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(&key) {
                entry.last_used = tick;
                return Ok(entry.reader.clone());
            }
        }

        let reader = Arc::new(TableReader::open(dir, number)?);
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_insert_with(|| Entry {
            reader,
            last_used: tick,
        });
        let reader = entry.reader.clone();
        if entries.len() > self.capacity {
            let excess = entries.len() - self.capacity;
            Self::evict_idle(&mut entries, excess);
        }
        Ok(reader)
    }

    fn evict_idle(entries: &mut HashMap<CacheKey, Entry>, mut count: usize) {
        while count > 0 {
            let victim = entries
                .iter()
                .filter(|(_, e)| Arc::strong_count(&e.reader) == 1)
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            let Some(key) = victim else {
                return;
            };
            entries.remove(&key);
            count -= 1;
        }
    }

    /// Drop a reader, e.g. when its file is deleted or quarantined
    pub fn evict(&self, dir: &Path, number: u64) {
        self.entries.lock().remove(&(dir.to_path_buf(), number));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::TableWriter;
    use tempfile::TempDir;

    fn write_table(dir: &Path, number: u64) {
        let mut w = TableWriter::create(dir, number).unwrap();
        w.add(1, b"v").unwrap();
        w.close().unwrap();
    }

    #[test]
    fn test_lru_skips_referenced_readers() {
        let dir = TempDir::new().unwrap();
        for n in 1..=3 {
            write_table(dir.path(), n);
        }
        let cache = TableCache::new(2);
        let held = cache.get_reader(dir.path(), 1).unwrap();
        cache.get_reader(dir.path(), 2).unwrap();
        cache.get_reader(dir.path(), 3).unwrap();
        assert_eq!(cache.len(), 2);
        // 1 is still held, so 2 was evicted
        let again = cache.get_reader(dir.path(), 1).unwrap();
        assert!(Arc::ptr_eq(&held, &again));

        cache.evict(dir.path(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_reader(dir.path(), 9).is_err());
    }
}
