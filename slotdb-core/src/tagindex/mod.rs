//! Tag index blocks
//!
//! Each tag key id owns two blocks, stored in separate kv families:
//!
//! - a forward block mapping series ids to the tag value id they carry
//! - an inverted block mapping tag value strings to series id bitmaps
//!
//! Series metadata blocks keep the id allocations of every metric so they
//! survive restarts.

mod forward;
mod inverted;
mod meta;

pub use forward::{ForwardBlock, ForwardBlockBuilder, ForwardMerger};
pub use inverted::{like_match, InvertedBlock, InvertedBlockBuilder, InvertedMerger, TagFilter};
pub use meta::{SeriesMetaBlock, SeriesMetaMerger, SeriesTags};
