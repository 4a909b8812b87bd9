//! Interval segment: the families of one shard for one interval

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use super::family::{DataFamily, DataFamilyOptions};
use crate::types::timeutil;
use crate::types::{Interval, ShardId, TimeRange, Timestamp};
use crate::version::TableCache;
use crate::Result;

const FAMILY_DIR_PREFIX: &str = "family-";

/// Family settings shared by every family of a segment
#[derive(Debug, Clone, Copy)]
pub struct SegmentOptions {
    pub family_width: i64,
    pub interval: Interval,
    pub max_memdb_size: u64,
    pub mutable_memdb_ttl: std::time::Duration,
}

/// Time-sorted families of one interval
pub struct IntervalSegment {
    dir: PathBuf,
    shard_id: ShardId,
    options: SegmentOptions,
    cache: Arc<TableCache>,
    families: RwLock<BTreeMap<Timestamp, Arc<DataFamily>>>,
}

impl IntervalSegment {
    /// Open `<dir>` and every family directory below it
    pub fn open(dir: &Path, shard_id: ShardId, options: SegmentOptions, cache: Arc<TableCache>) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let segment = Self {
            dir: dir.to_path_buf(),
            shard_id,
            options,
            cache,
            families: RwLock::new(BTreeMap::new()),
        };
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(family_time) = name
                .to_str()
                .and_then(|n| n.strip_prefix(FAMILY_DIR_PREFIX))
                .and_then(|t| t.parse::<Timestamp>().ok())
            else {
                continue;
            };
            if !entry.file_type()?.is_dir() {
                warn!(path = ?entry.path(), "skip family entry that is not a directory");
                continue;
            }
            segment.get_or_create_family(family_time)?;
        }
        info!(
            shard = shard_id,
            interval = %options.interval,
            families = segment.families.read().len(),
            "interval segment opened"
        );
        Ok(segment)
    }

    pub fn interval(&self) -> Interval {
        self.options.interval
    }

    pub fn family_width(&self) -> i64 {
        self.options.family_width
    }

    /// Bucket start of the family holding `ts`
    pub fn family_time(&self, ts: Timestamp) -> Timestamp {
        timeutil::family_time(ts, self.options.family_width)
    }

    pub fn get_family(&self, family_time: Timestamp) -> Option<Arc<DataFamily>> {
        self.families.read().get(&family_time).cloned()
    }

    pub fn get_or_create_family(&self, family_time: Timestamp) -> Result<Arc<DataFamily>> {
        if let Some(f) = self.get_family(family_time) {
            return Ok(f);
        }
        let mut families = self.families.write();
        if let Some(f) = families.get(&family_time) {
            return Ok(f.clone());
        }
        let dir = self.dir.join(format!("{FAMILY_DIR_PREFIX}{family_time}"));
        let family = Arc::new(DataFamily::open(
            &dir,
            self.shard_id,
            DataFamilyOptions {
                family_time,
                family_width: self.options.family_width,
                interval: self.options.interval,
                max_memdb_size: self.options.max_memdb_size,
                mutable_memdb_ttl: self.options.mutable_memdb_ttl,
            },
            self.cache.clone(),
        )?);
        families.insert(family_time, family.clone());
        Ok(family)
    }

    /// Families overlapping `range`, in time order
    pub fn families_in(&self, range: &TimeRange) -> Vec<Arc<DataFamily>> {
        if range.start > range.end {
            return Vec::new();
        }
        let start = self.family_time(range.start);
        self.families
            .read()
            .range(start..=range.end)
            .map(|(_, f)| f.clone())
            .collect()
    }

    /// Every family, in time order
    pub fn families(&self) -> Vec<Arc<DataFamily>> {
        self.families.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::timeutil::{ONE_HOUR, ONE_SECOND};
    use std::time::Duration;
    use tempfile::TempDir;

    fn options() -> SegmentOptions {
        SegmentOptions {
            family_width: ONE_HOUR,
            interval: Interval::from_millis(10 * ONE_SECOND).unwrap(),
            max_memdb_size: 1 << 30,
            mutable_memdb_ttl: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_families_reopen_and_range() {
        let dir = TempDir::new().unwrap();
        {
            let segment = IntervalSegment::open(dir.path(), 1, options(), Arc::new(TableCache::new(8))).unwrap();
            for t in [0, ONE_HOUR, 3 * ONE_HOUR] {
                segment.get_or_create_family(t).unwrap();
            }
        }
        let segment = IntervalSegment::open(dir.path(), 1, options(), Arc::new(TableCache::new(8))).unwrap();
        assert_eq!(segment.families().len(), 3);
        let hits: Vec<Timestamp> = segment
            .families_in(&TimeRange::new(ONE_HOUR + 5, 3 * ONE_HOUR))
            .iter()
            .map(|f| f.family_time())
            .collect();
        assert_eq!(hits, vec![ONE_HOUR, 3 * ONE_HOUR]);
        assert_eq!(segment.family_time(ONE_HOUR + 42), ONE_HOUR);
    }
}
