//! Transport seams of replication
//!
//! [`StreamFactory`] opens leader to follower replica streams,
//! [`WriteStreamFactory`](super::WriteStreamFactory) opens ingest to leader
//! write streams. [`LoopbackNetwork`] implements both between engines of
//! the same process, which is what a single binary and the tests use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::channel::{WriteStream, WriteStreamFactory};
use super::partition::Partition;
use super::{ReplicaState, ShardState};
use crate::storage::Engine;
use crate::types::{NodeId, Timestamp};
use crate::{Result, SlotError};

/// Leader side of a replica stream
pub trait ReplicaStream: Send {
    /// Next sequence the follower expects
    fn handshake(&mut self) -> Result<u64>;

    /// Move the follower log to `seq`
    fn reset(&mut self, seq: u64) -> Result<()>;

    /// Send record `seq`; returns the follower head afterwards
    fn send(&mut self, seq: u64, data: &[u8]) -> Result<u64>;

    fn close(&mut self) {}
}

pub trait StreamFactory: Send + Sync {
    fn connect(&self, state: &ReplicaState) -> Result<Box<dyn ReplicaStream>>;
}

/// Factory of a node without peers
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStreamFactory;

impl StreamFactory for NoopStreamFactory {
    fn connect(&self, state: &ReplicaState) -> Result<Box<dyn ReplicaStream>> {
        Err(SlotError::Closed(format!("no route to node {}", state.follower)))
    }
}

impl WriteStreamFactory for NoopStreamFactory {
    fn open(&self, target: NodeId, _: &str, _: &ShardState, _: Timestamp) -> Result<Box<dyn WriteStream>> {
        Err(SlotError::Closed(format!("no route to node {target}")))
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_sends: AtomicUsize,
    lost_responses: AtomicUsize,
}

impl Faults {
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-process transport between registered engines
#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: RwLock<HashMap<NodeId, Weak<Engine>>>,
    faults: Arc<Faults>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, engine: &Arc<Engine>) {
        self.nodes.write().insert(engine.node_id(), Arc::downgrade(engine));
    }

    pub fn unregister(&self, node: NodeId) {
        self.nodes.write().remove(&node);
    }

    /// Fail the next `n` replica sends before they reach the follower
    pub fn fail_sends(&self, n: usize) {
        self.faults.fail_sends.store(n, Ordering::Release);
    }

    /// Deliver the next `n` replica sends but lose their responses
    pub fn lose_responses(&self, n: usize) {
        self.faults.lost_responses.store(n, Ordering::Release);
    }

    fn engine(&self, node: NodeId) -> Result<Arc<Engine>> {
        self.nodes
            .read()
            .get(&node)
            .and_then(Weak::upgrade)
            .ok_or_else(|| SlotError::Closed(format!("node {node} unreachable")))
    }
}

impl StreamFactory for LoopbackNetwork {
    fn connect(&self, state: &ReplicaState) -> Result<Box<dyn ReplicaStream>> {
        let engine = self.engine(state.follower)?;
        let shard = engine
            .shard(&state.database, state.shard_id)
            .ok_or_else(|| SlotError::NotFound(format!("shard {} of {}", state.shard_id, state.database)))?;
        let partition = shard.get_or_create_partition(state.family_time, state.leader)?;
        partition.build_replica_for_follower(state.leader, state.follower)?;
        Ok(Box::new(LoopbackReplicaStream {
            partition,
            faults: self.faults.clone(),
        }))
    }
}

impl WriteStreamFactory for LoopbackNetwork {
    fn open(
        &self,
        target: NodeId,
        database: &str,
        shard: &ShardState,
        family_time: Timestamp,
    ) -> Result<Box<dyn WriteStream>> {
        let engine = self.engine(target)?;
        let partition = engine.partition_for_write(database, shard, family_time)?;
        Ok(Box::new(PartitionWriteStream { partition }))
    }
}

struct LoopbackReplicaStream {
    partition: Arc<Partition>,
    faults: Arc<Faults>,
}

impl ReplicaStream for LoopbackReplicaStream {
    fn handshake(&mut self) -> Result<u64> {
        Ok(self.partition.head_seq())
    }

    fn reset(&mut self, seq: u64) -> Result<()> {
        self.partition.reset_replica_index(seq)
    }

    fn send(&mut self, seq: u64, data: &[u8]) -> Result<u64> {
        if Faults::take(&self.faults.fail_sends) {
            return Err(SlotError::Closed("injected send failure".into()));
        }
        let head = self.partition.replica_log(seq, data)?;
        if Faults::take(&self.faults.lost_responses) {
            return Err(SlotError::Timeout);
        }
        Ok(head)
    }
}

/// Write stream appending straight into a leader partition
pub struct PartitionWriteStream {
    partition: Arc<Partition>,
}

impl PartitionWriteStream {
    pub fn new(partition: Arc<Partition>) -> Self {
        Self { partition }
    }
}

impl WriteStream for PartitionWriteStream {
    fn send(&mut self, batch: &[u8]) -> Result<()> {
        self.partition.write_log(batch)
    }
}
