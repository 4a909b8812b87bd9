//! Background tasks of a node

use std::sync::Arc;
use std::time::Duration;

use slotdb_core::replica::ChannelManager;
use slotdb_core::storage::{Engine, MemoryWatcher};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;

/// Run `f` on the blocking pool every `period` until `cancel` fires.
/// A tick waits for the previous run, so runs never overlap.
fn every<F>(name: &'static str, period: Duration, cancel: CancellationToken, f: F) -> JoinHandle<()>
where
    F: Fn() + Send + Sync + 'static,
{
    let f = Arc::new(f);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let f = f.clone();
                    if let Err(e) = tokio::task::spawn_blocking(move || f()).await {
                        warn!(task = name, error = %e, "background task panicked");
                    }
                }
            }
        }
        debug!(task = name, "background task stopped");
    })
}

pub fn spawn_all(
    config: &ServerConfig,
    engine: Arc<Engine>,
    channels: Arc<ChannelManager>,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    let e = engine.clone();
    handles.push(every("flush-checker", config.flush_check_interval, cancel.clone(), move || {
        let flushed = e.check_flush();
        if flushed > 0 {
            debug!(flushed, "flush checker pass");
        }
    }));

    let e = engine.clone();
    let watcher = parking_lot::Mutex::new(MemoryWatcher::new(&config.storage.tsdb));
    handles.push(every("memory-watcher", config.memory_check_interval, cancel.clone(), move || {
        e.set_memory_pressure(watcher.lock().check());
    }));

    let e = engine.clone();
    handles.push(every(
        "wal-remove",
        config.storage.wal.remove_task_interval,
        cancel.clone(),
        move || {
            let removed = e.remove_expired_wal_segments();
            if removed > 0 {
                info!(removed, "removed acknowledged WAL segments");
            }
        },
    ));

    let e = engine.clone();
    handles.push(every("partition-expire", config.expire_check_interval, cancel.clone(), move || {
        let removed = e.remove_expired_partitions();
        if removed > 0 {
            info!(removed, "removed expired partitions");
        }
    }));

    let ahead = config.storage.tsdb.accept_ahead_millis();
    let period = config.expire_check_interval;
    let token = cancel.clone();
    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = channels.remove_expired(ahead).await;
                    if removed > 0 {
                        info!(removed, "stopped expired family channels");
                    }
                }
            }
        }
    }));

    let e = engine;
    handles.push(every("status", config.status_interval, cancel.clone(), move || {
        for shard in e.shards() {
            for state in shard.replica_states() {
                match serde_json::to_string(&state) {
                    Ok(json) => info!(database = shard.database(), replica = %json, "replica state"),
                    Err(e) => warn!(error = %e, "failed to encode replica state"),
                }
            }
        }
    }));

    handles
}
