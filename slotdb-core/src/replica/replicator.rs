//! Replicators: what a peer does with each record of its consumer

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::chunk::decode_batch;
use super::stream::{ReplicaStream, StreamFactory};
use super::ReplicaState;
use crate::log_limiter::LogLimiter;
use crate::storage::DataFamily;
use crate::types::NodeId;
use crate::wal::Consumer;
use crate::{Result, SlotError};

/// Target of one partition consumer
pub trait Replicator: Send + Sync {
    fn state(&self) -> ReplicaState;

    fn consumer(&self) -> &Consumer;

    fn is_ready(&self) -> bool;

    /// Prepare for streaming and align the consumer with the target
    fn connect(&self) -> Result<()>;

    /// Replicate record `seq`
    fn replica(&self, seq: u64, data: &[u8]) -> Result<()>;

    /// Highest sequence the target holds durably, if any
    fn ack_seq(&self) -> Option<u64>;

    /// Switch to a new leader; takes effect on the next `connect`
    fn leader_changed(&self, _leader: NodeId) {}

    fn close(&self);
}

/// Applies records into the data family of this node
pub struct LocalReplicator {
    state: ReplicaState,
    consumer: Consumer,
    family: Arc<DataFamily>,
    ready: AtomicBool,
    limiter: LogLimiter,
}

impl LocalReplicator {
    pub fn new(state: ReplicaState, consumer: Consumer, family: Arc<DataFamily>) -> Self {
        Self {
            state,
            consumer,
            family,
            ready: AtomicBool::new(false),
            limiter: LogLimiter::default(),
        }
    }
}

impl Replicator for LocalReplicator {
    fn state(&self) -> ReplicaState {
        self.state.clone()
    }

    fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn connect(&self) -> Result<()> {
        // records past the ack may only live in memdbs lost on restart
        let ack = self.consumer.ack_seq();
        self.consumer.rewind(ack);
        debug!(replica = %self.state, from = ack, "local replicator ready");
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    fn replica(&self, seq: u64, data: &[u8]) -> Result<()> {
        let rows = match decode_batch(data) {
            Ok(rows) => rows,
            Err(e) => {
                crate::limited!(
                    self.limiter,
                    "decode",
                    warn,
                    replica = %self.state,
                    seq,
                    error = %e,
                    "drop undecodable batch"
                );
                return Ok(());
            }
        };
        self.family.apply(self.state.leader, seq, &rows)?;
        Ok(())
    }

    fn ack_seq(&self) -> Option<u64> {
        self.family.persisted_sequence(self.state.leader)
    }

    fn close(&self) {
        self.ready.store(false, Ordering::Release);
    }
}

/// Ships records to a follower node over a [`ReplicaStream`]
pub struct RemoteReplicator {
    state: RwLock<ReplicaState>,
    consumer: Consumer,
    factory: Arc<dyn StreamFactory>,
    stream: Mutex<Option<Box<dyn ReplicaStream>>>,
    ready: AtomicBool,
    /// One past the highest sequence the follower holds, 0 for none
    acked: AtomicU64,
}

impl RemoteReplicator {
    pub fn new(state: ReplicaState, consumer: Consumer, factory: Arc<dyn StreamFactory>) -> Self {
        Self {
            state: RwLock::new(state),
            consumer,
            factory,
            stream: Mutex::new(None),
            ready: AtomicBool::new(false),
            acked: AtomicU64::new(0),
        }
    }

    fn drop_stream(&self) {
        self.ready.store(false, Ordering::Release);
        if let Some(mut stream) = self.stream.lock().take() {
            stream.close();
        }
    }

    /// Align follower head `follower` with the consumer cursors and return
    /// the follower head afterwards
    fn reconcile(&self, stream: &mut dyn ReplicaStream, follower: u64) -> Result<u64> {
        let ack = self.consumer.ack_seq();
        let consume = self.consumer.consume_seq();
        let state = self.state.read().clone();
        if follower > consume {
            info!(replica = %state, follower, consume, "follower ahead of leader, reset follower");
            stream.reset(consume)?;
            Ok(consume)
        } else if follower < ack {
            info!(replica = %state, follower, ack, "follower behind acknowledged log, reset follower");
            stream.reset(ack)?;
            self.consumer.rewind(ack);
            Ok(ack)
        } else {
            if follower != consume {
                info!(replica = %state, follower, consume, "rewind consumer to follower head");
            }
            self.consumer.rewind(follower);
            Ok(follower)
        }
    }
}

impl Replicator for RemoteReplicator {
    fn state(&self) -> ReplicaState {
        self.state.read().clone()
    }

    fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn connect(&self) -> Result<()> {
        self.drop_stream();
        let state = self.state();
        let mut stream = self.factory.connect(&state)?;
        let follower = stream.handshake()?;
        let head = self.reconcile(stream.as_mut(), follower)?;
        self.acked.store(head, Ordering::Release);
        *self.stream.lock() = Some(stream);
        self.ready.store(true, Ordering::Release);
        info!(replica = %state, follower_head = head, "replica stream connected");
        Ok(())
    }

    fn replica(&self, seq: u64, data: &[u8]) -> Result<()> {
        let mut guard = self.stream.lock();
        let stream = guard
            .as_mut()
            .ok_or_else(|| SlotError::Closed(format!("replica stream {}", self.state.read())))?;
        let head = match stream.send(seq, data) {
            Ok(head) => head,
            Err(e) => {
                drop(guard);
                self.drop_stream();
                return Err(e);
            }
        };
        if head <= seq {
            drop(guard);
            self.drop_stream();
            return Err(SlotError::ProtocolViolation(format!(
                "follower head {head} after sending seq {seq}"
            )));
        }
        // a head past seq + 1 means the follower already had the record
        self.acked.fetch_max(seq + 1, Ordering::AcqRel);
        Ok(())
    }

    fn ack_seq(&self) -> Option<u64> {
        self.acked.load(Ordering::Acquire).checked_sub(1)
    }

    fn leader_changed(&self, leader: NodeId) {
        let mut state = self.state.write();
        if state.leader != leader {
            warn!(replica = %state, new_leader = leader, "leader changed, reconnect stream");
            state.leader = leader;
        }
        drop(state);
        self.drop_stream();
    }

    fn close(&self) {
        self.drop_stream();
    }
}
