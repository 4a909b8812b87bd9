//! Replication of family write logs
//!
//! Every `(database, shard, family, leader)` owns a [`Partition`]: a
//! fan-out queue the leader appends compressed row batches to. Each replica
//! node, the leader included, is a named consumer of that queue driven by a
//! [`ReplicatorPeer`]. The peer of the local node applies batches into the
//! data family; peers of remote nodes ship them over a [`ReplicaStream`].
//!
//! On the ingest side a [`ChannelManager`] routes routed rows into
//! per-family [`FamilyChannel`]s, which batch and compress rows and send the
//! batches to the current shard leader.

mod channel;
mod chunk;
pub mod codec;
mod manager;
mod partition;
mod peer;
mod replicator;
mod stream;

pub use channel::{FamilyChannel, WriteStream, WriteStreamFactory};
pub use chunk::{decode_batch, Chunk};
pub use manager::ChannelManager;
pub use partition::{Partition, PartitionOptions};
pub use peer::{PeerState, ReplicatorPeer};
pub use replicator::{LocalReplicator, RemoteReplicator, Replicator};
pub use stream::{LoopbackNetwork, NoopStreamFactory, PartitionWriteStream, ReplicaStream, StreamFactory};

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, ShardId, Timestamp};

/// Leader and replica nodes of a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    pub id: ShardId,
    pub leader: NodeId,
    pub replicas: Vec<NodeId>,
}

/// Identity of one replication channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub database: String,
    pub shard_id: ShardId,
    pub family_time: Timestamp,
    pub leader: NodeId,
    pub follower: NodeId,
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/shard-{}/family-{}/{}->{}",
            self.database, self.shard_id, self.family_time, self.leader, self.follower
        )
    }
}

/// Cursor report of one consumer of a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaPeerState {
    pub replicator: String,
    pub consume_seq: u64,
    pub ack_seq: u64,
    pub pending: u64,
}

/// Cursor report of a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyLogReplicaState {
    pub shard_id: ShardId,
    pub family_time: Timestamp,
    pub leader: NodeId,
    pub append_seq: u64,
    pub replicators: Vec<ReplicaPeerState>,
}

/// Send counters of a peer or a family channel
#[derive(Debug, Default)]
pub struct SendStats {
    sent: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    retry_drop: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`SendStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendStatsSnapshot {
    pub sent: u64,
    pub failed: u64,
    pub retried: u64,
    pub retry_drop: u64,
    pub reconnects: u64,
}

impl SendStats {
    pub fn incr_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_retry_drop(&self) {
        self.retry_drop.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_reconnects(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SendStatsSnapshot {
        SendStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            retry_drop: self.retry_drop.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}
