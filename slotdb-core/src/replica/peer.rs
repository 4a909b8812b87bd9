//! Replicator peer: the worker thread behind one partition consumer
//!
//! ```text
//! Init -> Connecting -> Streaming -> Closed
//!             ^             |
//!             +-------------+  stream error / leader change
//! ```
//!
//! At most one batch is outstanding. A failed batch is retried up to
//! `max_retry_buf` times and then dropped.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::replicator::Replicator;
use super::{SendStats, SendStatsSnapshot};
use crate::log_limiter::LogLimiter;
use crate::types::NodeId;
use crate::{Result, SlotError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const MIN_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    Init = 0,
    Connecting = 1,
    Streaming = 2,
    Closed = 3,
}

impl PeerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => PeerState::Init,
            1 => PeerState::Connecting,
            2 => PeerState::Streaming,
            _ => PeerState::Closed,
        }
    }
}

enum PeerEvent {
    LeaderChanged(NodeId),
    Wake,
}

pub struct ReplicatorPeer {
    replicator: Arc<dyn Replicator>,
    state: Arc<AtomicU8>,
    stats: Arc<SendStats>,
    events: Sender<PeerEvent>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicatorPeer {
    /// Start the worker thread; it stops on [`shutdown`](Self::shutdown)
    /// or when `parent` is canceled
    pub fn start(replicator: Arc<dyn Replicator>, max_retry_buf: usize, parent: &CancellationToken) -> Result<Self> {
        let (events, rx) = crossbeam_channel::unbounded();
        let state = Arc::new(AtomicU8::new(PeerState::Init as u8));
        let stats = Arc::new(SendStats::default());
        let cancel = parent.child_token();
        let worker = PeerLoop {
            replicator: replicator.clone(),
            state: state.clone(),
            stats: stats.clone(),
            events: rx,
            cancel: cancel.clone(),
            max_retry_buf,
            limiter: LogLimiter::default(),
        };
        let handle = thread::Builder::new()
            .name(format!("replica-{}", replicator.consumer().name()))
            .spawn(move || worker.run())
            .map_err(|e| SlotError::Internal(format!("spawn replicator peer: {e}")))?;
        Ok(Self {
            replicator,
            state,
            stats,
            events,
            cancel,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn replicator(&self) -> &Arc<dyn Replicator> {
        &self.replicator
    }

    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> SendStatsSnapshot {
        self.stats.snapshot()
    }

    /// Drop the current stream and reconnect against `leader`
    pub fn leader_changed(&self, leader: NodeId) {
        let _ = self.events.send(PeerEvent::LeaderChanged(leader));
    }

    /// Stop the worker and wait for it
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let _ = self.events.send(PeerEvent::Wake);
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!(consumer = self.replicator.consumer().name(), "replicator peer panicked");
            }
        }
    }
}

impl Drop for ReplicatorPeer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// `d` plus up to a quarter of it, so peers of one node spread reconnects
fn jitter(d: Duration) -> Duration {
    let max = (d.as_millis() as u64 / 4).max(1);
    d + Duration::from_millis(rand::thread_rng().gen_range(0..max))
}

struct Batch {
    seq: u64,
    data: Vec<u8>,
    attempts: usize,
}

struct PeerLoop {
    replicator: Arc<dyn Replicator>,
    state: Arc<AtomicU8>,
    stats: Arc<SendStats>,
    events: Receiver<PeerEvent>,
    cancel: CancellationToken,
    max_retry_buf: usize,
    limiter: LogLimiter,
}

impl PeerLoop {
    fn set_state(&self, state: PeerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn handle(&self, event: PeerEvent) {
        match event {
            PeerEvent::LeaderChanged(leader) => {
                self.replicator.leader_changed(leader);
                self.stats.incr_reconnects();
            }
            PeerEvent::Wake => {}
        }
    }

    /// Sleep up to `d`, waking early for events
    fn wait(&self, d: Duration) {
        match self.events.recv_timeout(d) {
            Ok(event) => self.handle(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
        }
    }

    fn ack(&self) {
        let Some(seq) = self.replicator.ack_seq() else {
            return;
        };
        if seq < self.replicator.consumer().ack_seq() {
            return;
        }
        if let Err(e) = self.replicator.consumer().ack(seq) {
            crate::limited!(self.limiter, "ack", warn, seq, error = %e, "failed to persist ack");
        }
    }

    fn run(self) {
        let replica = self.replicator.state();
        let consumer = self.replicator.consumer().clone();
        info!(replica = %replica, "replicator peer started");

        let mut inflight: Option<Batch> = None;
        let mut backoff = MIN_BACKOFF;
        while !self.cancel.is_cancelled() {
            while let Ok(event) = self.events.try_recv() {
                self.handle(event);
            }
            if self.cancel.is_cancelled() {
                break;
            }

            if !self.replicator.is_ready() {
                self.set_state(PeerState::Connecting);
                if let Err(e) = self.replicator.connect() {
                    crate::limited!(self.limiter, "connect", warn, replica = %replica, error = %e, "replicator connect failed");
                    self.wait(jitter(backoff));
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
                backoff = MIN_BACKOFF;
                self.set_state(PeerState::Streaming);
                // the consumer hands the batch out again after a rewind
                if inflight.as_ref().is_some_and(|b| consumer.consume_seq() <= b.seq) {
                    inflight = None;
                }
            }

            let batch = match inflight.take() {
                Some(batch) => batch,
                None => match consumer.consume_timeout(POLL_INTERVAL) {
                    Ok(Some((seq, data))) => Batch { seq, data, attempts: 0 },
                    Ok(None) => {
                        self.ack();
                        continue;
                    }
                    Err(e) => {
                        crate::limited!(self.limiter, "consume", error, replica = %replica, error = %e, "failed to read write log");
                        self.wait(backoff);
                        continue;
                    }
                },
            };

            match self.replicator.replica(batch.seq, &batch.data) {
                Ok(()) => {
                    self.stats.incr_sent();
                    self.ack();
                }
                Err(e) => {
                    self.stats.incr_failed();
                    crate::limited!(self.limiter, "replica", warn, replica = %replica, seq = batch.seq, error = %e, "replicate batch failed");
                    if batch.attempts >= self.max_retry_buf {
                        self.stats.incr_retry_drop();
                        error!(replica = %replica, seq = batch.seq, attempts = batch.attempts, "too many retries, drop batch");
                    } else {
                        self.stats.incr_retried();
                        inflight = Some(Batch {
                            attempts: batch.attempts + 1,
                            ..batch
                        });
                        self.wait(MIN_BACKOFF);
                    }
                }
            }
        }

        self.replicator.close();
        self.ack();
        self.set_state(PeerState::Closed);
        debug!(replica = %replica, "replicator peer stopped");
    }
}
