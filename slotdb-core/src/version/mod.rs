//! Versioned file sets of kv families
//!
//! Every change to the set of table files of a family is described by a
//! [`VersionEdit`], appended to the family's manifest and applied to the
//! current [`Version`]. Readers pin a version through a [`Snapshot`]; files a
//! later edit deletes stay on disk until no pinned version references them.

mod edit;
mod file_meta;
mod set;
mod table_cache;
#[allow(clippy::module_inception)]
mod version;

pub use edit::{EditLog, VersionEdit};
pub use file_meta::{
    parse_table_name, table_file_name, table_path, FileMeta, COMPACT_LEVEL, CORRUPT_SUFFIX, FLUSH_LEVEL,
    NUM_LEVELS,
};
pub use set::{Snapshot, VersionSet, CURRENT_FILE, DEFAULT_MAX_MANIFEST_SIZE};
pub use table_cache::TableCache;
pub use version::{TableFile, Version};
