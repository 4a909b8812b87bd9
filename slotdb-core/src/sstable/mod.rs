//! Immutable table files
//!
//! A table is a sorted `u32 -> bytes` map written once by a flush or a
//! compaction and memory-mapped for reading. Data families store one metric
//! block per metric id; the index families reuse the same table shape with
//! their own value layouts.

mod filter;
mod merge;
mod metric;
mod table;

pub use filter::{filter_table, FileDataLoader, FileFilterResultSet, TableFilter};
pub use merge::{merge_metric_blocks, DataMerger};
pub use metric::{MetricBlockBuilder, MetricFlusher, MetricMeta, MetricReader, SeriesBlock};
pub use table::{TableReader, TableWriter, TABLE_MAGIC, TABLE_VERSION};
