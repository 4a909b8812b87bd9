//! Table file metadata tracked by versions

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Level of freshly flushed tables
pub const FLUSH_LEVEL: u8 = 0;
/// Level compaction writes into
pub const COMPACT_LEVEL: u8 = 1;
/// Number of levels in a kv family
pub const NUM_LEVELS: usize = 2;

/// Suffix appended to quarantined tables
pub const CORRUPT_SUFFIX: &str = "corrupt";

/// Metadata of one immutable table file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub number: u64,
    pub level: u8,
    pub min_key: u32,
    pub max_key: u32,
    pub size: u64,
}

impl FileMeta {
    pub fn new(number: u64, min_key: u32, max_key: u32, size: u64) -> Self {
        Self {
            number,
            level: FLUSH_LEVEL,
            min_key,
            max_key,
            size,
        }
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    /// Whether `key` may be stored in this file
    pub fn contains_key(&self, key: u32) -> bool {
        self.min_key <= key && key <= self.max_key
    }

    pub fn overlaps(&self, min_key: u32, max_key: u32) -> bool {
        self.min_key <= max_key && min_key <= self.max_key
    }
}

pub fn table_file_name(number: u64) -> String {
    format!("{number:06}.sst")
}

pub fn table_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(table_file_name(number))
}

pub fn parse_table_name(name: &str) -> Option<u64> {
    name.strip_suffix(".sst")?.parse().ok()
}
