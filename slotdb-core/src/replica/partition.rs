//! Write log partition of one `(shard, family, leader)`

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::peer::ReplicatorPeer;
use super::replicator::{LocalReplicator, RemoteReplicator, Replicator};
use super::stream::StreamFactory;
use super::{FamilyLogReplicaState, ReplicaPeerState, ReplicaState, SendStatsSnapshot};
use crate::storage::DataFamily;
use crate::types::{timeutil, NodeId, ShardId, Timestamp};
use crate::wal::{FanOutQueue, QueueOptions};
use crate::{Result, SlotError};

#[derive(Debug, Clone)]
pub struct PartitionOptions {
    pub database: String,
    pub shard_id: ShardId,
    pub current_node: NodeId,
    pub leader: NodeId,
    pub queue: QueueOptions,
    pub max_retry_buf: usize,
    /// Acceptance window into the past, in milliseconds
    pub accept_ahead: i64,
}

pub struct Partition {
    options: PartitionOptions,
    family: Arc<DataFamily>,
    log: FanOutQueue,
    factory: Arc<dyn StreamFactory>,
    peers: Mutex<BTreeMap<NodeId, ReplicatorPeer>>,
    cancel: CancellationToken,
}

impl Partition {
    pub fn open(
        dir: &Path,
        options: PartitionOptions,
        family: Arc<DataFamily>,
        factory: Arc<dyn StreamFactory>,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let log = FanOutQueue::open(dir, options.queue.clone())?;
        info!(
            database = %options.database,
            shard = options.shard_id,
            family = family.family_time(),
            leader = options.leader,
            head_seq = log.head_seq(),
            "partition opened"
        );
        Ok(Self {
            options,
            family,
            log,
            factory,
            peers: Mutex::new(BTreeMap::new()),
            cancel: parent.child_token(),
        })
    }

    pub fn dir(&self) -> &Path {
        self.log.dir()
    }

    pub fn leader(&self) -> NodeId {
        self.options.leader
    }

    pub fn family(&self) -> &Arc<DataFamily> {
        &self.family
    }

    pub fn family_time(&self) -> Timestamp {
        self.family.family_time()
    }

    /// Next sequence the log assigns
    pub fn head_seq(&self) -> u64 {
        self.log.head_seq()
    }

    /// Append a batch received from an ingest channel
    pub fn write_log(&self, batch: &[u8]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.log.put_cancelable(batch, &self.cancel)?;
        Ok(())
    }

    /// Append a batch replicated by the leader.
    ///
    /// The batch is appended only when `expected_seq` is the log head.
    /// Returns the head afterwards, so a caller sees `expected_seq + 1` on
    /// success and the unchanged head as a hint otherwise.
    pub fn replica_log(&self, expected_seq: u64, batch: &[u8]) -> Result<u64> {
        let head = self.log.head_seq();
        if expected_seq != head {
            return Ok(head);
        }
        let seq = self.log.put_cancelable(batch, &self.cancel)?;
        Ok(seq + 1)
    }

    /// Move the log head to `seq`, dropping records at or above it
    pub fn reset_replica_index(&self, seq: u64) -> Result<()> {
        self.log.set_append_seq(seq)
    }

    /// Build the replicators of a leader partition: the local node applies,
    /// every other replica gets a remote stream
    pub fn build_replica_for_leader(&self, leader: NodeId, replicas: &[NodeId]) -> Result<()> {
        if leader != self.options.current_node {
            return Err(SlotError::ProtocolViolation(format!(
                "leader {leader} is not the current node {}",
                self.options.current_node
            )));
        }
        for replica in replicas {
            if let Err(e) = self.build_replica(leader, *replica) {
                error!(leader, follower = replica, error = %e, "failed to build replica to follower");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Build the local replicator of a follower partition
    pub fn build_replica_for_follower(&self, leader: NodeId, replica: NodeId) -> Result<()> {
        if replica != self.options.current_node {
            return Err(SlotError::ProtocolViolation(format!(
                "replica {replica} is not the current node {}",
                self.options.current_node
            )));
        }
        self.build_replica(leader, replica)
    }

    fn build_replica(&self, leader: NodeId, replica: NodeId) -> Result<()> {
        let mut peers = self.peers.lock();
        if peers.contains_key(&replica) {
            return Ok(());
        }
        let consumer = self.log.fan_out(&replica.to_string())?;
        let state = ReplicaState {
            database: self.options.database.clone(),
            shard_id: self.options.shard_id,
            family_time: self.family.family_time(),
            leader,
            follower: replica,
        };
        let replicator: Arc<dyn Replicator> = if replica == self.options.current_node {
            Arc::new(LocalReplicator::new(state, consumer, self.family.clone()))
        } else {
            Arc::new(RemoteReplicator::new(state, consumer, self.factory.clone()))
        };
        let peer = ReplicatorPeer::start(replicator, self.options.max_retry_buf, &self.cancel)?;
        peers.insert(replica, peer);
        Ok(())
    }

    /// Rebuild the replicators of every persisted consumer
    pub fn recovery(&self) -> Result<()> {
        for name in self.log.consumer_names() {
            let replica: NodeId = name
                .parse()
                .map_err(|_| SlotError::Corruption(format!("bad consumer name {name:?} in {:?}", self.dir())))?;
            self.build_replica(self.options.leader, replica)?;
        }
        Ok(())
    }

    /// Tell remote peers to reconnect against `leader`
    pub fn leader_changed(&self, leader: NodeId) {
        for (node, peer) in self.peers.lock().iter() {
            if *node != self.options.current_node {
                peer.leader_changed(leader);
            }
        }
    }

    pub fn replica_state(&self) -> FamilyLogReplicaState {
        let replicators = self
            .log
            .consumer_names()
            .into_iter()
            .filter_map(|name| self.log.consumer(&name))
            .map(|c| ReplicaPeerState {
                replicator: c.name().to_string(),
                consume_seq: c.consume_seq(),
                ack_seq: c.ack_seq(),
                pending: c.pending(),
            })
            .collect();
        FamilyLogReplicaState {
            shard_id: self.options.shard_id,
            family_time: self.family.family_time(),
            leader: self.options.leader,
            append_seq: self.log.head_seq(),
            replicators,
        }
    }

    pub fn peer_stats(&self) -> BTreeMap<NodeId, SendStatsSnapshot> {
        self.peers.lock().iter().map(|(n, p)| (*n, p.stats())).collect()
    }

    /// Whether every consumer is caught up and the family can no longer
    /// receive writes
    pub fn is_expired(&self, now: Timestamp) -> bool {
        let idle = self
            .log
            .consumer_names()
            .iter()
            .filter_map(|name| self.log.consumer(name))
            .all(|c| c.is_empty());
        if !idle {
            return false;
        }
        let ahead = self.options.accept_ahead;
        let grace = crate::config::PARTITION_EXPIRE_GRACE.as_millis() as i64;
        !(ahead > 0 && self.family.time_range().end + ahead + grace > now)
    }

    /// Unlink log segments every consumer acknowledged
    pub fn remove_expired_segments(&self, ttl: Duration) -> Result<usize> {
        self.log.remove_expired(Instant::now(), ttl)
    }

    /// Stop every peer
    pub fn stop(&self) {
        let peers = std::mem::take(&mut *self.peers.lock());
        for peer in peers.values() {
            peer.shutdown();
        }
    }

    pub fn close(&self) -> Result<()> {
        self.stop();
        self.log.close()
    }

    /// Close the log and delete its directory
    pub fn destroy(&self) -> Result<()> {
        self.stop();
        info!(
            database = %self.options.database,
            shard = self.options.shard_id,
            family = timeutil::format_timestamp(self.family.family_time()),
            leader = self.options.leader,
            "partition removed"
        );
        self.log.clone().destroy()
    }
}

impl Drop for Partition {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
