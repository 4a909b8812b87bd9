//! Index database of a shard
//!
//! Allocates series ids for `(metric, tags)` and keeps the tag index:
//!
//! ```text
//! <dir>/forward    tag key id -> forward block
//! <dir>/inverted   tag key id -> inverted block
//! <dir>/meta       metric id  -> series metadata block
//! ```
//!
//! New allocations stay in memory until [`IndexDatabase::flush`] writes them
//! to the three kv families. On open, the allocations are rebuilt from the
//! metadata family.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use tracing::{debug, info};

use super::kv::KvFamily;
use crate::compaction::CompactionConfig;
use crate::tagindex::{
    ForwardBlock, ForwardBlockBuilder, ForwardMerger, InvertedBlock, InvertedBlockBuilder, InvertedMerger,
    SeriesMetaBlock, SeriesMetaMerger, SeriesTags, TagFilter,
};
use crate::types::{MetricId, SeriesId, TagKeyId, TagValueId};
use crate::version::{TableCache, VersionEdit};
use crate::{Result, SlotError};

#[derive(Default)]
struct MetricIndex {
    tag_keys: BTreeMap<String, TagKeyId>,
    series_ids: RoaringBitmap,
}

#[derive(Default)]
struct Pending {
    meta: BTreeMap<MetricId, SeriesMetaBlock>,
    forward: BTreeMap<TagKeyId, BTreeMap<SeriesId, TagValueId>>,
    inverted: BTreeMap<TagKeyId, InvertedBlockBuilder>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.meta.is_empty() && self.forward.is_empty() && self.inverted.is_empty()
    }

    /// Put back entries of a failed flush; entries created since win
    fn restore(&mut self, older: Pending) {
        for (metric, block) in older.meta {
            let mut merged = block;
            if let Some(newer) = self.meta.remove(&metric) {
                merged.merge_from(newer);
            }
            self.meta.insert(metric, merged);
        }
        for (key, entries) in older.forward {
            let slot = self.forward.entry(key).or_default();
            for (s, v) in entries {
                slot.entry(s).or_insert(v);
            }
        }
        for (key, builder) in older.inverted {
            self.inverted.entry(key).or_default().merge(builder);
        }
    }
}

#[derive(Default)]
struct IndexState {
    metrics: HashMap<MetricId, MetricIndex>,
    tag_values: HashMap<TagKeyId, BTreeMap<String, TagValueId>>,
    series: HashMap<(MetricId, SeriesTags), SeriesId>,
    next_series_id: SeriesId,
    next_tag_key_id: TagKeyId,
    pending: Pending,
}

/// Index limits
#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    pub max_series_ids: u32,
    pub max_tag_keys: usize,
}

pub struct IndexDatabase {
    forward: KvFamily,
    inverted: KvFamily,
    meta: KvFamily,
    options: IndexOptions,
    state: RwLock<IndexState>,
    flush_lock: Mutex<()>,
}

impl IndexDatabase {
    pub fn open(dir: &Path, options: IndexOptions, cache: Arc<TableCache>) -> Result<Self> {
        let family = |name: &str, id: u32, merger: Arc<dyn crate::compaction::Merger>| {
            KvFamily::open(&dir.join(name), id, cache.clone(), merger, CompactionConfig::default())
        };
        let db = Self {
            forward: family("forward", 0, Arc::new(ForwardMerger))?,
            inverted: family("inverted", 1, Arc::new(InvertedMerger))?,
            meta: family("meta", 2, Arc::new(SeriesMetaMerger))?,
            options,
            state: RwLock::new(IndexState {
                next_series_id: 1,
                next_tag_key_id: 1,
                ..Default::default()
            }),
            flush_lock: Mutex::new(()),
        };
        db.restore()?;
        Ok(db)
    }

    /// Rebuild the allocation maps from the metadata family
    fn restore(&self) -> Result<()> {
        let mut state = self.state.write();
        for metric_id in self.meta.keys()?.iter() {
            let Some(data) = self.meta.get(metric_id)? else {
                continue;
            };
            let block = SeriesMetaBlock::decode(&data)?;
            let metric = state.metrics.entry(metric_id).or_default();
            for (name, id) in &block.tag_keys {
                metric.tag_keys.insert(name.clone(), *id);
            }
            for series_id in block.series.keys() {
                metric.series_ids.insert(*series_id);
            }
            state.next_tag_key_id = state
                .next_tag_key_id
                .max(block.tag_keys.values().max().map_or(0, |m| m + 1));
            for (key_id, values) in block.tag_values {
                state.tag_values.entry(key_id).or_default().extend(values);
            }
            for (series_id, tags) in block.series {
                state.next_series_id = state.next_series_id.max(series_id + 1);
                state.series.insert((metric_id, tags), series_id);
            }
        }
        info!(
            series = state.series.len(),
            next_series_id = state.next_series_id,
            "index database restored"
        );
        Ok(())
    }

    pub fn num_series(&self) -> usize {
        self.state.read().series.len()
    }

    fn resolve_tags(state: &IndexState, metric_id: MetricId, tags: &[(&str, &str)]) -> Option<SeriesTags> {
        let metric = state.metrics.get(&metric_id)?;
        let mut out = Vec::with_capacity(tags.len());
        for (k, v) in tags {
            let key_id = *metric.tag_keys.get(*k)?;
            let value_id = *state.tag_values.get(&key_id)?.get(*v)?;
            out.push((key_id, value_id));
        }
        out.sort_unstable();
        Some(out)
    }

    /// Series id of existing `(metric, tags)`
    pub fn get_series_id(&self, metric_id: MetricId, tags: &[(&str, &str)]) -> Option<SeriesId> {
        let state = self.state.read();
        let resolved = Self::resolve_tags(&state, metric_id, tags)?;
        state.series.get(&(metric_id, resolved)).copied()
    }

    /// Series id of `(metric, tags)`, allocated on first use
    pub fn get_or_create_series_id(&self, metric_id: MetricId, tags: &[(&str, &str)]) -> Result<SeriesId> {
        if let Some(id) = self.get_series_id(metric_id, tags) {
            return Ok(id);
        }
        let mut guard = self.state.write();
        let state = &mut *guard;
        if let Some(resolved) = Self::resolve_tags(state, metric_id, tags) {
            if let Some(id) = state.series.get(&(metric_id, resolved)) {
                return Ok(*id);
            }
        }
        if state.series.len() >= self.options.max_series_ids as usize {
            return Err(SlotError::SeriesLimitExceeded {
                limit: self.options.max_series_ids,
            });
        }

        let known = state.metrics.get(&metric_id).map(|m| &m.tag_keys);
        let new_keys = tags
            .iter()
            .filter(|(k, _)| !known.is_some_and(|keys| keys.contains_key(*k)))
            .map(|(k, _)| *k)
            .collect::<std::collections::BTreeSet<_>>();
        if known.map_or(0, |keys| keys.len()) + new_keys.len() > self.options.max_tag_keys {
            return Err(SlotError::TagKeysLimitExceeded {
                metric_id,
                limit: self.options.max_tag_keys,
            });
        }

        let metric = state.metrics.entry(metric_id).or_default();

        let pending_meta = state.pending.meta.entry(metric_id).or_default();
        for k in new_keys {
            let id = state.next_tag_key_id;
            state.next_tag_key_id += 1;
            metric.tag_keys.insert(k.to_string(), id);
            pending_meta.tag_keys.insert(k.to_string(), id);
        }

        let series_id = state.next_series_id;
        state.next_series_id += 1;
        let mut resolved = Vec::with_capacity(tags.len());
        for (k, v) in tags {
            let key_id = metric.tag_keys[*k];
            let values = state.tag_values.entry(key_id).or_default();
            let value_id = match values.get(*v) {
                Some(id) => *id,
                None => {
                    let id = values.len() as TagValueId + 1;
                    values.insert(v.to_string(), id);
                    pending_meta.tag_values.entry(key_id).or_default().insert(v.to_string(), id);
                    id
                }
            };
            resolved.push((key_id, value_id));
            state.pending.forward.entry(key_id).or_default().insert(series_id, value_id);
            state.pending.inverted.entry(key_id).or_default().add(v, series_id);
        }
        resolved.sort_unstable();
        pending_meta.series.insert(series_id, resolved.clone());
        metric.series_ids.insert(series_id);
        state.series.insert((metric_id, resolved), series_id);
        debug!(metric = metric_id, series = series_id, "series created");
        Ok(series_id)
    }

    /// Every series of a metric
    pub fn series_ids(&self, metric_id: MetricId) -> RoaringBitmap {
        self.state
            .read()
            .metrics
            .get(&metric_id)
            .map(|m| m.series_ids.clone())
            .unwrap_or_default()
    }

    fn tag_key_id(&self, metric_id: MetricId, tag_key: &str) -> Option<TagKeyId> {
        self.state.read().metrics.get(&metric_id)?.tag_keys.get(tag_key).copied()
    }

    /// Series of `metric_id` whose `tag_key` value matches `filter`
    pub fn find_series_ids(&self, metric_id: MetricId, tag_key: &str, filter: &TagFilter) -> Result<RoaringBitmap> {
        let Some(key_id) = self.tag_key_id(metric_id, tag_key) else {
            return Ok(RoaringBitmap::new());
        };
        let mut out = RoaringBitmap::new();
        if let Some(data) = self.inverted.get(key_id)? {
            out |= InvertedBlock::parse(&data)?.find(filter)?;
        }
        let pending = self.state.read().pending.inverted.get(&key_id).cloned();
        if let Some(data) = pending.map(InvertedBlockBuilder::finish).transpose()?.flatten() {
            out |= InvertedBlock::parse(&data)?.find(filter)?;
        }
        Ok(out)
    }

    /// Known values of a tag key, ascending
    pub fn tag_values(&self, metric_id: MetricId, tag_key: &str) -> Vec<String> {
        let state = self.state.read();
        state
            .metrics
            .get(&metric_id)
            .and_then(|m| m.tag_keys.get(tag_key))
            .and_then(|key_id| state.tag_values.get(key_id))
            .map(|values| values.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Tag value of `tag_key` for each of `series_ids`, for grouping
    pub fn group_by(
        &self,
        metric_id: MetricId,
        tag_key: &str,
        series_ids: &RoaringBitmap,
    ) -> Result<BTreeMap<SeriesId, String>> {
        let Some(key_id) = self.tag_key_id(metric_id, tag_key) else {
            return Ok(BTreeMap::new());
        };
        let mut ids: BTreeMap<SeriesId, TagValueId> = BTreeMap::new();
        if let Some(data) = self.forward.get(key_id)? {
            let block = ForwardBlock::parse(&data)?;
            ids.extend(block.iter().filter(|(s, _)| series_ids.contains(*s)));
        }
        let state = self.state.read();
        if let Some(pending) = state.pending.forward.get(&key_id) {
            ids.extend(pending.iter().filter(|(s, _)| series_ids.contains(**s)).map(|(s, v)| (*s, *v)));
        }
        let names: HashMap<TagValueId, &String> = state
            .tag_values
            .get(&key_id)
            .map(|values| values.iter().map(|(name, id)| (*id, name)).collect())
            .unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter_map(|(s, v)| names.get(&v).map(|name| (s, (*name).clone())))
            .collect())
    }

    /// Persist pending allocations
    pub fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock();
        let pending = std::mem::take(&mut self.state.write().pending);
        if pending.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.write_pending(&pending) {
            self.state.write().pending.restore(pending);
            return Err(e);
        }
        for family in [&self.forward, &self.inverted, &self.meta] {
            if family.need_compact() {
                family.compact()?;
            }
        }
        Ok(())
    }

    fn write_pending(&self, pending: &Pending) -> Result<()> {
        let mut forward = self.forward.new_table_writer()?;
        for (key_id, entries) in &pending.forward {
            let mut builder = ForwardBlockBuilder::new();
            for (s, v) in entries {
                builder.add(*s, *v)?;
            }
            if let Some(block) = builder.finish()? {
                forward.add(*key_id, &block)?;
            }
        }
        let mut inverted = self.inverted.new_table_writer()?;
        for (key_id, builder) in &pending.inverted {
            if let Some(block) = builder.clone().finish()? {
                inverted.add(*key_id, &block)?;
            }
        }
        let mut meta = self.meta.new_table_writer()?;
        for (metric_id, block) in &pending.meta {
            meta.add(*metric_id, &block.encode()?)?;
        }

        // forward and inverted first: metadata decides what a restart sees
        self.forward.commit_flush(forward.close()?, VersionEdit::new(0))?;
        self.inverted.commit_flush(inverted.close()?, VersionEdit::new(0))?;
        self.meta.commit_flush(meta.close()?, VersionEdit::new(0))?;
        info!(
            metrics = pending.meta.len(),
            tag_keys = pending.forward.len(),
            "index flushed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &Path, max_series_ids: u32) -> IndexDatabase {
        IndexDatabase::open(
            dir,
            IndexOptions {
                max_series_ids,
                max_tag_keys: 2,
            },
            Arc::new(TableCache::new(16)),
        )
        .unwrap()
    }

    #[test]
    fn test_series_ids_survive_restart() {
        let dir = TempDir::new().unwrap();
        let (a, b);
        {
            let db = open(dir.path(), 100);
            a = db.get_or_create_series_id(1, &[("host", "a"), ("dc", "x")]).unwrap();
            b = db.get_or_create_series_id(1, &[("host", "b"), ("dc", "x")]).unwrap();
            assert_ne!(a, b);
            assert_eq!(db.get_or_create_series_id(1, &[("dc", "x"), ("host", "a")]).unwrap(), a);
            db.flush().unwrap();
        }
        let db = open(dir.path(), 100);
        assert_eq!(db.get_series_id(1, &[("host", "b"), ("dc", "x")]), Some(b));
        let c = db.get_or_create_series_id(1, &[("host", "c"), ("dc", "x")]).unwrap();
        assert_eq!(c, b.max(a) + 1);

        // flushed and pending entries are both searchable
        let hosts = db.find_series_ids(1, "host", &TagFilter::Regex(".*".into())).unwrap();
        assert_eq!(hosts.iter().collect::<Vec<_>>(), vec![a, b, c]);
        let dc = db.find_series_ids(1, "dc", &TagFilter::Equal("x".into())).unwrap();
        assert_eq!(dc.len(), 3);
        assert_eq!(db.tag_values(1, "host"), vec!["a", "b", "c"]);

        let groups = db.group_by(1, "host", &db.series_ids(1)).unwrap();
        assert_eq!(groups[&c], "c");
        assert_eq!(groups[&a], "a");
    }

    #[test]
    fn test_limits() {
        let dir = TempDir::new().unwrap();
        let db = open(dir.path(), 2);
        db.get_or_create_series_id(1, &[("a", "1")]).unwrap();
        assert!(matches!(
            db.get_or_create_series_id(1, &[("a", "1"), ("b", "1"), ("c", "1")]),
            Err(SlotError::TagKeysLimitExceeded { metric_id: 1, limit: 2 })
        ));
        db.get_or_create_series_id(1, &[("a", "2")]).unwrap();
        let err = db.get_or_create_series_id(1, &[("a", "3")]).unwrap_err();
        assert!(err.is_resource_limit());
        // existing series stay reachable at the limit
        assert!(db.get_or_create_series_id(1, &[("a", "1")]).is_ok());
    }
}
