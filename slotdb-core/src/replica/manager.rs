//! Channel manager: routes ingested rows to family channels

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::log_limiter::LogLimiter;

use super::channel::{FamilyChannel, WriteStreamFactory};
use super::ShardState;
use crate::storage::{AcceptWindow, WriteConfig};
use crate::types::{timeutil, Row, ShardId, Timestamp};
use crate::{Result, SlotError};

struct ShardChannel {
    state: Option<ShardState>,
    families: HashMap<Timestamp, Arc<FamilyChannel>>,
}

struct DatabaseChannel {
    num_shards: u32,
    shards: HashMap<ShardId, ShardChannel>,
}

pub struct ChannelManager {
    config: WriteConfig,
    family_width: i64,
    window: AcceptWindow,
    factory: Arc<dyn WriteStreamFactory>,
    cancel: CancellationToken,
    databases: RwLock<HashMap<String, DatabaseChannel>>,
    limiter: LogLimiter,
}

impl ChannelManager {
    pub fn new(
        config: WriteConfig,
        family_width: i64,
        window: AcceptWindow,
        factory: Arc<dyn WriteStreamFactory>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            config,
            family_width,
            window,
            factory,
            cancel: parent.child_token(),
            databases: RwLock::new(HashMap::new()),
            limiter: LogLimiter::default(),
        }
    }

    /// Register `shard_id` of a database with `num_shards` shards
    pub fn create_channel(&self, database: &str, num_shards: u32, shard_id: ShardId) -> Result<()> {
        if num_shards == 0 || shard_id >= num_shards {
            return Err(SlotError::Config(format!(
                "shard {shard_id} out of range for {num_shards} shards of {database}"
            )));
        }
        let mut databases = self.databases.write();
        let db = databases.entry(database.to_string()).or_insert_with(|| DatabaseChannel {
            num_shards,
            shards: HashMap::new(),
        });
        if db.num_shards != num_shards {
            // shard reduction is not supported, growth only widens the range
            if num_shards < db.num_shards {
                return Err(SlotError::Config(format!(
                    "cannot shrink {database} from {} to {num_shards} shards",
                    db.num_shards
                )));
            }
            info!(database, from = db.num_shards, to = num_shards, "database shard count grew");
            db.num_shards = num_shards;
        }
        db.shards.entry(shard_id).or_insert_with(|| ShardChannel {
            state: None,
            families: HashMap::new(),
        });
        Ok(())
    }

    /// Record the leader and replicas of a shard. Family channels of that
    /// shard switch streams when the leader moved.
    pub fn sync_shard_state(&self, database: &str, state: ShardState) -> Result<()> {
        let mut databases = self.databases.write();
        let db = databases
            .get_mut(database)
            .ok_or_else(|| SlotError::NotFound(format!("database channel {database}")))?;
        let shard = db
            .shards
            .get_mut(&state.id)
            .ok_or_else(|| SlotError::NotFound(format!("shard channel {database}/{}", state.id)))?;
        let moved = shard.state.as_ref().is_some_and(|old| old.leader != state.leader);
        if moved {
            for channel in shard.families.values() {
                channel.leader_changed(state.clone());
            }
        }
        shard.state = Some(state);
        Ok(())
    }

    fn family_channel(&self, database: &str, shard_id: ShardId, family_time: Timestamp) -> Result<Arc<FamilyChannel>> {
        if let Some(channel) = self
            .databases
            .read()
            .get(database)
            .and_then(|db| db.shards.get(&shard_id))
            .and_then(|shard| shard.families.get(&family_time))
        {
            return Ok(channel.clone());
        }

        let mut databases = self.databases.write();
        let db = databases
            .get_mut(database)
            .ok_or_else(|| SlotError::NotFound(format!("database channel {database}")))?;
        let shard = db
            .shards
            .get_mut(&shard_id)
            .ok_or_else(|| SlotError::NotFound(format!("shard channel {database}/{shard_id}")))?;
        let state = shard
            .state
            .clone()
            .ok_or_else(|| SlotError::NotFound(format!("leader of {database}/{shard_id}")))?;
        let channel = shard.families.entry(family_time).or_insert_with(|| {
            Arc::new(FamilyChannel::start(
                database,
                state,
                family_time,
                &self.config,
                self.factory.clone(),
                &self.cancel,
            ))
        });
        Ok(channel.clone())
    }

    /// Route rows of one shard to their family channels. Rows outside the
    /// accept window are dropped; returns the rows routed.
    pub async fn write(&self, ctx: &CancellationToken, database: &str, shard_id: ShardId, rows: &[Row]) -> Result<usize> {
        let now = timeutil::now();
        let mut by_family: BTreeMap<Timestamp, Vec<Row>> = BTreeMap::new();
        let mut routed = 0;
        for row in rows {
            if let Err(e) = self.window.check(row.timestamp, now) {
                crate::limited!(self.limiter, "accept", warn, database, shard = shard_id, error = %e, "drop row");
                continue;
            }
            routed += 1;
            by_family
                .entry(timeutil::family_time(row.timestamp, self.family_width))
                .or_default()
                .push(row.clone());
        }
        for (family_time, rows) in by_family {
            let channel = self.family_channel(database, shard_id, family_time)?;
            channel.write(ctx, &rows).await?;
        }
        Ok(routed)
    }

    /// Stop family channels idle past `ahead` plus the grace period
    pub async fn remove_expired(&self, ahead: i64) -> usize {
        let mut expired = Vec::new();
        {
            let mut databases = self.databases.write();
            for (database, db) in databases.iter_mut() {
                for shard in db.shards.values_mut() {
                    shard.families.retain(|family_time, channel| {
                        if channel.is_expired(ahead) {
                            info!(database = %database, family = *family_time, "family channel expired");
                            expired.push(channel.clone());
                            false
                        } else {
                            true
                        }
                    });
                }
            }
        }
        let n = expired.len();
        for channel in expired {
            channel.stop().await;
        }
        n
    }

    /// Number of open family channels
    pub fn num_channels(&self) -> usize {
        self.databases
            .read()
            .values()
            .flat_map(|db| db.shards.values())
            .map(|shard| shard.families.len())
            .sum()
    }

    /// Stop all family channels, sending what they buffer
    pub async fn close(&self) {
        let channels: Vec<_> = self
            .databases
            .write()
            .drain()
            .flat_map(|(_, db)| db.shards.into_values())
            .flat_map(|shard| shard.families.into_values())
            .collect();
        for channel in channels {
            channel.stop().await;
        }
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::channel::WriteStream;
    use crate::replica::chunk::decode_batch;
    use crate::types::{FieldType, NodeId};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Sink {
        batches: Mutex<Vec<(NodeId, Timestamp, Vec<u8>)>>,
    }

    struct SinkStream {
        sink: Arc<Sink>,
        target: NodeId,
        family_time: Timestamp,
    }

    impl WriteStream for SinkStream {
        fn send(&mut self, batch: &[u8]) -> Result<()> {
            self.sink.batches.lock().push((self.target, self.family_time, batch.to_vec()));
            Ok(())
        }
    }

    impl WriteStreamFactory for Arc<Sink> {
        fn open(&self, target: NodeId, _: &str, _: &ShardState, family_time: Timestamp) -> Result<Box<dyn WriteStream>> {
            Ok(Box::new(SinkStream {
                sink: self.clone(),
                target,
                family_time,
            }))
        }
    }

    const HOUR: i64 = timeutil::ONE_HOUR;

    fn manager(sink: &Arc<Sink>) -> ChannelManager {
        let config = WriteConfig {
            batch_timeout: Duration::from_millis(10),
            batch_block_size: 1024,
            max_retry_buf: 4,
        };
        let window = AcceptWindow {
            ahead: 100 * HOUR,
            behind: 100 * HOUR,
        };
        ChannelManager::new(config, HOUR, window, Arc::new(sink.clone()), &CancellationToken::new())
    }

    /// Start of the family holding the current hour
    fn base() -> Timestamp {
        timeutil::family_time(timeutil::now(), HOUR)
    }

    fn state(leader: NodeId) -> ShardState {
        ShardState {
            id: 0,
            leader,
            replicas: vec![leader],
        }
    }

    fn row(offset: Timestamp) -> Row {
        Row::new(1, 1, base() + offset).with_field(1, FieldType::Sum, 1.0)
    }

    #[test]
    fn test_create_channel_checks_shard() {
        let sink = Arc::new(Sink::default());
        let m = manager(&sink);
        assert!(m.create_channel("db", 0, 0).is_err());
        assert!(m.create_channel("db", 2, 2).is_err());
        m.create_channel("db", 2, 1).unwrap();
        m.create_channel("db", 4, 3).unwrap();
        assert!(m.create_channel("db", 2, 0).is_err());
        assert!(m.sync_shard_state("other", state(1)).is_err());
    }

    #[tokio::test]
    async fn test_rows_split_by_family() {
        let sink = Arc::new(Sink::default());
        let m = manager(&sink);
        m.create_channel("db", 1, 0).unwrap();
        let ctx = CancellationToken::new();
        assert!(matches!(
            m.write(&ctx, "db", 0, &[row(10)]).await,
            Err(SlotError::NotFound(_))
        ));

        m.sync_shard_state("db", state(1)).unwrap();
        let routed = m
            .write(&ctx, "db", 0, &[row(10), row(HOUR + 10), row(20), row(-1000 * HOUR)])
            .await
            .unwrap();
        assert_eq!(routed, 3);
        assert_eq!(m.num_channels(), 2);
        m.close().await;

        let batches = sink.batches.lock();
        let mut per_family: BTreeMap<Timestamp, usize> = BTreeMap::new();
        for (target, family_time, batch) in batches.iter() {
            assert_eq!(*target, 1);
            *per_family.entry(*family_time).or_default() += decode_batch(batch).unwrap().len();
        }
        let base = base();
        assert_eq!(per_family.get(&base), Some(&2));
        assert_eq!(per_family.get(&(base + HOUR)), Some(&1));
    }

    #[tokio::test]
    async fn test_leader_change_reaches_channels() {
        let sink = Arc::new(Sink::default());
        let m = manager(&sink);
        m.create_channel("db", 1, 0).unwrap();
        m.sync_shard_state("db", state(1)).unwrap();
        let ctx = CancellationToken::new();
        m.write(&ctx, "db", 0, &[row(10)]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;

        m.sync_shard_state("db", state(2)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        m.write(&ctx, "db", 0, &[row(20)]).await.unwrap();
        m.close().await;

        let targets: Vec<NodeId> = sink.batches.lock().iter().map(|(t, _, _)| *t).collect();
        assert_eq!(targets.first(), Some(&1));
        assert_eq!(targets.last(), Some(&2));
    }

    #[tokio::test]
    async fn test_remove_expired_channels() {
        let sink = Arc::new(Sink::default());
        let m = manager(&sink);
        m.create_channel("db", 1, 0).unwrap();
        m.sync_shard_state("db", state(1)).unwrap();
        m.write(&CancellationToken::new(), "db", 0, &[row(10)]).await.unwrap();
        assert_eq!(m.remove_expired(HOUR).await, 0);
        assert_eq!(m.remove_expired(0).await, 1);
        assert_eq!(m.num_channels(), 0);
        let rows: usize = sink
            .batches
            .lock()
            .iter()
            .map(|(_, _, b)| decode_batch(b).unwrap().len())
            .sum();
        assert_eq!(rows, 1);
        m.close().await;
    }
}
