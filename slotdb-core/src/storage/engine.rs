//! Storage engine - top-level coordinator of the shards on this node

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::StorageConfig;
use super::flush::{pick_families, FlushReason};
use super::shard::{Shard, ShardOptions};
use crate::replica::{Partition, ShardState, StreamFactory};
use crate::types::{timeutil, NodeId, ShardId, Timestamp};
use crate::version::TableCache;
use crate::{Result, SlotError};

const SHARD_DIR_PREFIX: &str = "shard-";

/// SlotDB storage engine
pub struct Engine {
    config: StorageConfig,
    node_id: NodeId,
    cache: Arc<TableCache>,
    factory: Arc<dyn StreamFactory>,
    shards: RwLock<BTreeMap<(String, ShardId), Arc<Shard>>>,
    memory_pressure: AtomicBool,
    /// One flush checker pass at a time
    flush_lock: Mutex<()>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Engine {
    /// Open the engine and every shard found under the data and WAL roots
    pub fn open(mut config: StorageConfig, node_id: NodeId, factory: Arc<dyn StreamFactory>) -> Result<Arc<Self>> {
        config.validate()?;
        fs::create_dir_all(&config.tsdb.dir)?;
        fs::create_dir_all(&config.wal.dir)?;

        let engine = Arc::new(Self {
            cache: Arc::new(TableCache::new(config.tsdb.table_cache_size)),
            config,
            node_id,
            factory,
            shards: RwLock::new(BTreeMap::new()),
            memory_pressure: AtomicBool::new(false),
            flush_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        engine.load_shards()?;
        info!(
            node = node_id,
            dir = ?engine.config.tsdb.dir,
            wal = ?engine.config.wal.dir,
            shards = engine.shards.read().len(),
            "storage engine opened"
        );
        Ok(engine)
    }

    fn load_shards(&self) -> Result<()> {
        let mut found = BTreeSet::new();
        for root in [&self.config.tsdb.dir, &self.config.wal.dir] {
            for (database, shard_id) in scan_shards(root)? {
                found.insert((database, shard_id));
            }
        }
        for (database, shard_id) in found {
            match self.get_or_create_shard(&database, shard_id) {
                Ok(_) => info!(database = %database, shard = shard_id, "loaded shard"),
                Err(e) => {
                    error!(database = %database, shard = shard_id, error = %e, "failed to load shard");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn shard_dirs(&self, database: &str, shard_id: ShardId) -> (PathBuf, PathBuf) {
        let name = format!("{SHARD_DIR_PREFIX}{shard_id}");
        (
            self.config.tsdb.dir.join(database).join(&name),
            self.config.wal.dir.join(database).join(&name),
        )
    }

    fn open_shard(&self, database: &str, shard_id: ShardId) -> Result<Shard> {
        validate_database_name(database)?;
        let (dir, wal_dir) = self.shard_dirs(database, shard_id);
        Shard::open(
            &dir,
            &wal_dir,
            ShardOptions::from_config(&self.config, database, shard_id, self.node_id)?,
            self.cache.clone(),
            self.factory.clone(),
            &self.cancel,
        )
    }

    /// Create a new shard
    pub fn create_shard(&self, database: &str, shard_id: ShardId) -> Result<Arc<Shard>> {
        self.ensure_open()?;
        let mut shards = self.shards.write();
        let key = (database.to_string(), shard_id);
        if shards.contains_key(&key) {
            return Err(SlotError::Config(format!("shard {shard_id} of {database} already exists")));
        }
        let shard = Arc::new(self.open_shard(database, shard_id)?);
        shards.insert(key, shard.clone());
        info!(database, shard = shard_id, "created shard");
        Ok(shard)
    }

    /// Get or create a shard
    pub fn get_or_create_shard(&self, database: &str, shard_id: ShardId) -> Result<Arc<Shard>> {
        if let Some(shard) = self.shard(database, shard_id) {
            return Ok(shard);
        }
        self.ensure_open()?;
        let mut shards = self.shards.write();
        let key = (database.to_string(), shard_id);
        if let Some(shard) = shards.get(&key) {
            return Ok(shard.clone());
        }
        let shard = Arc::new(self.open_shard(database, shard_id)?);
        shards.insert(key, shard.clone());
        Ok(shard)
    }

    pub fn shard(&self, database: &str, shard_id: ShardId) -> Option<Arc<Shard>> {
        self.shards.read().get(&(database.to_string(), shard_id)).cloned()
    }

    pub fn shards(&self) -> Vec<Arc<Shard>> {
        self.shards.read().values().cloned().collect()
    }

    /// Leader partition receiving ingest batches for `family_time`; builds
    /// the replicators of every replica of the shard
    pub fn partition_for_write(
        &self,
        database: &str,
        shard_state: &ShardState,
        family_time: Timestamp,
    ) -> Result<Arc<Partition>> {
        if shard_state.leader != self.node_id {
            return Err(SlotError::ProtocolViolation(format!(
                "node {} is not the leader of {database}/shard-{}, leader is {}",
                self.node_id, shard_state.id, shard_state.leader
            )));
        }
        let shard = self.get_or_create_shard(database, shard_state.id)?;
        let partition = shard.get_or_create_partition(family_time, shard_state.leader)?;
        let mut replicas = shard_state.replicas.clone();
        if !replicas.contains(&self.node_id) {
            replicas.insert(0, self.node_id);
        }
        partition.build_replica_for_leader(shard_state.leader, &replicas)?;
        Ok(partition)
    }

    /// Point the remote replicators of a shard at its new leader
    pub fn leader_changed(&self, database: &str, shard_state: &ShardState) {
        if let Some(shard) = self.shard(database, shard_state.id) {
            shard.leader_changed(shard_state.leader);
        }
    }

    pub fn set_memory_pressure(&self, pressure: bool) {
        self.memory_pressure.store(pressure, Ordering::Release);
    }

    pub fn memory_pressure(&self) -> bool {
        self.memory_pressure.load(Ordering::Acquire)
    }

    /// One flush checker pass: flush the indexes and every family that is
    /// ready, degraded, over its shard limits or hit by memory pressure.
    /// Returns the number of memdbs flushed. A pass already running makes
    /// this a no-op.
    pub fn check_flush(&self) -> usize {
        let Some(_guard) = self.flush_lock.try_lock() else {
            debug!("flush checker pass still running");
            return 0;
        };
        let pressure = self.memory_pressure();
        let mut work = Vec::new();
        for shard in self.shards() {
            if let Err(e) = shard.index().flush() {
                error!(database = shard.database(), shard = shard.id(), error = %e, "failed to flush index");
            }
            work.extend(pick_families(&shard.families(), &self.config.tsdb, pressure));
        }
        if work.is_empty() {
            return 0;
        }

        let next = AtomicUsize::new(0);
        let flushed = AtomicUsize::new(0);
        let workers = self.config.tsdb.flush_concurrency.clamp(1, work.len());
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::AcqRel);
                    let Some((family, reason)) = work.get(i) else {
                        break;
                    };
                    if *reason != FlushReason::Ready {
                        info!(shard = family.shard_id(), family = family.family_time(), reason = ?reason, "forced flush");
                    }
                    // failures are logged and counted by the family itself
                    if let Ok(n) = family.flush() {
                        flushed.fetch_add(n, Ordering::AcqRel);
                    }
                });
            }
        });
        flushed.into_inner()
    }

    /// Flush every shard
    pub fn flush_all(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock();
        let mut flushed = 0;
        for shard in self.shards() {
            flushed += shard.flush()?;
        }
        Ok(flushed)
    }

    /// Unlink acknowledged WAL segments sealed for at least one
    /// removal interval
    pub fn remove_expired_wal_segments(&self) -> usize {
        let ttl = self.config.wal.remove_task_interval;
        self.shards().iter().map(|s| s.remove_expired_wal_segments(ttl)).sum()
    }

    /// Destroy drained partitions of families past the accept window
    pub fn remove_expired_partitions(&self) -> usize {
        let now = timeutil::now();
        self.shards().iter().map(|s| s.remove_expired_partitions(now)).sum()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SlotError::Closed("storage engine".into()));
        }
        Ok(())
    }

    /// Flush everything and stop replication
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self.flush_all();
        let shards = std::mem::take(&mut *self.shards.write());
        for shard in shards.values() {
            if let Err(e) = shard.close() {
                warn!(database = shard.database(), shard = shard.id(), error = %e, "failed to close shard");
            }
        }
        self.cancel.cancel();
        info!(node = self.node_id, "storage engine closed");
        flushed.map(|_| ())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn validate_database_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(SlotError::Config(format!("invalid database name {name:?}")));
    }
    Ok(())
}

/// `(database, shard)` pairs laid out under `root`
fn scan_shards(root: &Path) -> Result<Vec<(String, ShardId)>> {
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for db in fs::read_dir(root)? {
        let db = db?;
        if !db.file_type()?.is_dir() {
            continue;
        }
        let Some(database) = db.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if validate_database_name(&database).is_err() {
            continue;
        }
        for shard in fs::read_dir(db.path())? {
            let shard = shard?;
            let Some(id) = shard
                .file_name()
                .to_str()
                .and_then(|n| n.strip_prefix(SHARD_DIR_PREFIX))
                .and_then(|n| n.parse::<ShardId>().ok())
            else {
                continue;
            };
            if shard.file_type()?.is_dir() {
                out.push((database.clone(), id));
            }
        }
    }
    Ok(out)
}
