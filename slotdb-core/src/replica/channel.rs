//! Family write channel
//!
//! Turns concurrent row writes of one `(database, shard, family)` into a
//! single stream of compressed batches sent to the shard leader. Writers
//! fill a [`Chunk`]; a full chunk is compressed and queued on a bounded
//! channel drained by one task. The task also flushes partial chunks after
//! `batch_timeout` and switches streams when the leader changes.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::chunk::Chunk;
use super::{SendStats, SendStatsSnapshot, ShardState};
use crate::storage::WriteConfig;
use crate::types::{timeutil, NodeId, Row, ShardId, Timestamp};
use crate::{Result, SlotError};

const CHECK_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Ingest side of a leader write stream
pub trait WriteStream: Send {
    fn send(&mut self, batch: &[u8]) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait WriteStreamFactory: Send + Sync {
    fn open(
        &self,
        target: NodeId,
        database: &str,
        shard: &ShardState,
        family_time: Timestamp,
    ) -> Result<Box<dyn WriteStream>>;
}

struct Shared {
    database: String,
    shard_id: ShardId,
    family_time: Timestamp,
    chunk: Mutex<Chunk>,
    shard_state: SyncMutex<ShardState>,
    last_flush: AtomicI64,
    stats: SendStats,
}

pub struct FamilyChannel {
    shared: Arc<Shared>,
    tx: SyncMutex<Option<mpsc::Sender<Vec<u8>>>>,
    leader_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
    task: SyncMutex<Option<JoinHandle<()>>>,
}

impl FamilyChannel {
    /// Create the channel and spawn its send task on the current runtime
    pub fn start(
        database: &str,
        shard_state: ShardState,
        family_time: Timestamp,
        config: &WriteConfig,
        factory: Arc<dyn WriteStreamFactory>,
        parent: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(crate::config::FAMILY_CHANNEL_CAPACITY);
        let (leader_tx, leader_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            database: database.to_string(),
            shard_id: shard_state.id,
            family_time,
            chunk: Mutex::new(Chunk::new(config.batch_block_size)),
            shard_state: SyncMutex::new(shard_state),
            last_flush: AtomicI64::new(timeutil::now()),
            stats: SendStats::default(),
        });
        let cancel = parent.child_token();
        let task = WriteTask {
            shared: shared.clone(),
            factory,
            stream: None,
            retry: Vec::new(),
            max_retry_buf: config.max_retry_buf,
            batch_timeout: config.batch_timeout,
        };
        let handle = tokio::spawn(task.run(rx, leader_rx, cancel.clone()));
        Self {
            shared,
            tx: SyncMutex::new(Some(tx)),
            leader_tx,
            cancel,
            task: SyncMutex::new(Some(handle)),
        }
    }

    pub fn family_time(&self) -> Timestamp {
        self.shared.family_time
    }

    pub fn stats(&self) -> SendStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Buffer `rows`, queueing every chunk that fills up.
    ///
    /// Waiting for queue space ends with [`SlotError::IngestTimeout`] when
    /// `ctx` is canceled and with [`SlotError::FamilyChannelCanceled`] when
    /// the channel stops.
    pub async fn write(&self, ctx: &CancellationToken, rows: &[Row]) -> Result<()> {
        let tx = self.tx.lock().clone().ok_or(SlotError::FamilyChannelCanceled)?;
        let mut chunk = self.shared.chunk.lock().await;
        for row in rows {
            chunk.write(row)?;
            if !chunk.is_full() {
                continue;
            }
            let Some(batch) = chunk.compress() else {
                continue;
            };
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SlotError::FamilyChannelCanceled),
                sent = tx.send(batch) => sent.map_err(|_| SlotError::FamilyChannelCanceled)?,
                _ = ctx.cancelled() => return Err(SlotError::IngestTimeout),
            }
        }
        Ok(())
    }

    /// Switch the send stream to the new leader of `shard_state`
    pub fn leader_changed(&self, shard_state: ShardState) {
        *self.shared.shard_state.lock() = shard_state;
        // one pending signal is enough
        let _ = self.leader_tx.try_send(());
    }

    /// Whether the channel saw no flush for `ahead` plus the grace period
    pub fn is_expired(&self, ahead: i64) -> bool {
        let grace = crate::config::PARTITION_EXPIRE_GRACE.as_millis() as i64;
        let now = timeutil::now();
        !(ahead > 0 && self.shared.last_flush.load(Ordering::Acquire) + ahead + grace > now)
    }

    /// Stop the channel; buffered rows are sent before the task exits
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.tx.lock().take();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(database = %self.shared.database, error = %e, "family channel task failed");
            }
        }
    }
}

struct WriteTask {
    shared: Arc<Shared>,
    factory: Arc<dyn WriteStreamFactory>,
    stream: Option<Box<dyn WriteStream>>,
    retry: Vec<Vec<u8>>,
    max_retry_buf: usize,
    batch_timeout: Duration,
}

impl WriteTask {
    async fn run(mut self, mut rx: mpsc::Receiver<Vec<u8>>, mut leader_rx: mpsc::Receiver<()>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(CHECK_FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = leader_rx.recv() => {
                    if self.stream.is_some() {
                        info!(database = %self.shared.database, shard = self.shared.shard_id, "shard leader changed, switch write stream");
                        self.close_stream();
                    }
                }
                batch = rx.recv() => match batch {
                    Some(batch) => {
                        if self.send(batch) {
                            self.resend();
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if let Some(batch) = self.check_flush() {
                        if self.send(batch) {
                            self.resend();
                        }
                    }
                }
            }
        }

        // drain what writers already queued or buffered
        rx.close();
        while let Some(batch) = rx.recv().await {
            if !self.send(batch) {
                error!(database = %self.shared.database, "send failed before channel close, batch lost");
            }
        }
        let shared = self.shared.clone();
        let last = shared.chunk.lock().await.compress();
        if let Some(batch) = last {
            if !self.send(batch) {
                error!(database = %self.shared.database, "send failed before channel close, batch lost");
            }
        }
        self.resend();
        self.close_stream();
        debug!(database = %self.shared.database, family = self.shared.family_time, "family channel stopped");
    }

    fn close_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close() {
                warn!(database = %self.shared.database, error = %e, "failed to close write stream");
            }
        }
    }

    fn keep_for_retry(&mut self, batch: Vec<u8>) {
        if self.retry.len() >= self.max_retry_buf {
            error!(database = %self.shared.database, "too many retry batches, drop current batch");
            self.shared.stats.incr_retry_drop();
        } else {
            self.shared.stats.incr_retried();
            self.retry.push(batch);
        }
    }

    /// Send one batch, keeping it for retry on failure
    fn send(&mut self, batch: Vec<u8>) -> bool {
        if batch.is_empty() {
            return true;
        }
        if self.stream.is_none() {
            let shard = self.shared.shard_state.lock().clone();
            match self
                .factory
                .open(shard.leader, &self.shared.database, &shard, self.shared.family_time)
            {
                Ok(stream) => {
                    self.shared.stats.incr_reconnects();
                    self.stream = Some(stream);
                }
                Err(e) => {
                    warn!(database = %self.shared.database, leader = shard.leader, error = %e, "failed to open write stream");
                    self.keep_for_retry(batch);
                    return false;
                }
            }
        }
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        match stream.send(&batch) {
            Ok(()) => {
                self.shared.stats.incr_sent();
                true
            }
            Err(e) => {
                self.shared.stats.incr_failed();
                error!(database = %self.shared.database, shard = self.shared.shard_id, error = %e, "failed writing batch to leader");
                self.close_stream();
                self.keep_for_retry(batch);
                false
            }
        }
    }

    fn resend(&mut self) {
        if self.retry.is_empty() {
            return;
        }
        let mut pending = std::mem::take(&mut self.retry).into_iter();
        while let Some(batch) = pending.next() {
            if !self.send(batch) {
                // the failed batch is back in the buffer, keep the rest behind it
                self.retry.extend(pending);
                break;
            }
        }
    }

    /// Partial chunk once `batch_timeout` passed since the last flush.
    /// A writer holding the chunk may be waiting on this task, so a busy
    /// chunk is left for the next tick.
    fn check_flush(&self) -> Option<Vec<u8>> {
        let now = timeutil::now();
        if now - self.shared.last_flush.load(Ordering::Acquire) < self.batch_timeout.as_millis() as i64 {
            return None;
        }
        let mut chunk = self.shared.chunk.try_lock().ok()?;
        self.shared.last_flush.store(now, Ordering::Release);
        chunk.compress()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::chunk::decode_batch;
    use crate::types::FieldType;

    #[derive(Default)]
    struct Sink {
        batches: SyncMutex<Vec<Vec<u8>>>,
        fail: std::sync::atomic::AtomicUsize,
        opened: std::sync::atomic::AtomicUsize,
        leaders: SyncMutex<Vec<NodeId>>,
    }

    struct SinkStream(Arc<Sink>);

    impl WriteStream for SinkStream {
        fn send(&mut self, batch: &[u8]) -> Result<()> {
            if self
                .0
                .fail
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SlotError::Closed("sink".into()));
            }
            self.0.batches.lock().push(batch.to_vec());
            Ok(())
        }
    }

    struct SinkFactory(Arc<Sink>);

    impl WriteStreamFactory for SinkFactory {
        fn open(&self, target: NodeId, _: &str, _: &ShardState, _: Timestamp) -> Result<Box<dyn WriteStream>> {
            self.0.opened.fetch_add(1, Ordering::AcqRel);
            self.0.leaders.lock().push(target);
            Ok(Box::new(SinkStream(self.0.clone())))
        }
    }

    fn config(block: usize) -> WriteConfig {
        WriteConfig {
            batch_timeout: Duration::from_millis(10),
            batch_block_size: block,
            max_retry_buf: 2,
        }
    }

    fn shard(leader: NodeId) -> ShardState {
        ShardState {
            id: 1,
            leader,
            replicas: vec![leader],
        }
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| Row::new(1, i as u32, 1_000).with_field(1, FieldType::Sum, 1.0))
            .collect()
    }

    fn received(sink: &Sink) -> usize {
        sink.batches
            .lock()
            .iter()
            .map(|b| decode_batch(b).unwrap().len())
            .sum()
    }

    #[tokio::test]
    async fn test_rows_reach_the_leader() {
        let sink = Arc::new(Sink::default());
        let ch = FamilyChannel::start(
            "db",
            shard(1),
            0,
            &config(64),
            Arc::new(SinkFactory(sink.clone())),
            &CancellationToken::new(),
        );
        ch.write(&CancellationToken::new(), &rows(10)).await.unwrap();
        ch.stop().await;
        assert_eq!(received(&sink), 10);
        assert!(ch.stats().sent >= 2);
        assert!(matches!(
            ch.write(&CancellationToken::new(), &rows(1)).await,
            Err(SlotError::FamilyChannelCanceled)
        ));
    }

    #[tokio::test]
    async fn test_failed_batches_are_retried() {
        let sink = Arc::new(Sink::default());
        sink.fail.store(1, Ordering::Release);
        let ch = FamilyChannel::start(
            "db",
            shard(1),
            0,
            &config(1),
            Arc::new(SinkFactory(sink.clone())),
            &CancellationToken::new(),
        );
        ch.write(&CancellationToken::new(), &rows(3)).await.unwrap();
        ch.stop().await;
        assert_eq!(received(&sink), 3);
        let stats = ch.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.retry_drop, 0);
    }

    fn task(sink: &Arc<Sink>) -> WriteTask {
        WriteTask {
            shared: Arc::new(Shared {
                database: "db".to_string(),
                shard_id: 1,
                family_time: 0,
                chunk: Mutex::new(Chunk::new(64)),
                shard_state: SyncMutex::new(shard(1)),
                last_flush: AtomicI64::new(timeutil::now()),
                stats: SendStats::default(),
            }),
            factory: Arc::new(SinkFactory(sink.clone())),
            stream: None,
            retry: Vec::new(),
            max_retry_buf: 3,
            batch_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_resend_keeps_unsent_batches_in_order() {
        let sink = Arc::new(Sink::default());
        let mut task = task(&sink);
        task.retry = vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()];

        sink.fail.store(1, Ordering::Release);
        task.resend();
        assert_eq!(task.retry, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
        assert!(sink.batches.lock().is_empty());
        assert_eq!(task.shared.stats.snapshot().retry_drop, 0);

        // a recovered stream delivers the new batch, then the buffer in order
        assert!(task.send(b"4".to_vec()));
        task.resend();
        assert!(task.retry.is_empty());
        assert_eq!(
            *sink.batches.lock(),
            vec![b"4".to_vec(), b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_leader_change_reopens_stream() {
        let sink = Arc::new(Sink::default());
        let ch = FamilyChannel::start(
            "db",
            shard(1),
            0,
            &config(1),
            Arc::new(SinkFactory(sink.clone())),
            &CancellationToken::new(),
        );
        ch.write(&CancellationToken::new(), &rows(1)).await.unwrap();
        while received(&sink) < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        ch.leader_changed(shard(2));
        tokio::time::sleep(Duration::from_millis(20)).await;
        ch.write(&CancellationToken::new(), &rows(1)).await.unwrap();
        ch.stop().await;
        assert_eq!(received(&sink), 2);
        assert_eq!(*sink.leaders.lock(), vec![1, 2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_channel_gives_ingest_timeout() {
        struct Slow;
        impl WriteStream for Slow {
            fn send(&mut self, _: &[u8]) -> Result<()> {
                std::thread::sleep(Duration::from_millis(300));
                Ok(())
            }
        }
        struct SlowFactory;
        impl WriteStreamFactory for SlowFactory {
            fn open(&self, _: NodeId, _: &str, _: &ShardState, _: Timestamp) -> Result<Box<dyn WriteStream>> {
                Ok(Box::new(Slow))
            }
        }
        let ch = FamilyChannel::start("db", shard(1), 0, &config(1), Arc::new(SlowFactory), &CancellationToken::new());
        let ctx = CancellationToken::new();
        ctx.cancel();
        let mut saw_timeout = false;
        for _ in 0..10 {
            match ch.write(&ctx, &rows(1)).await {
                Err(SlotError::IngestTimeout) => {
                    saw_timeout = true;
                    break;
                }
                Ok(()) => {}
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert!(saw_timeout);
        ch.stop().await;
        assert!(ch.stats().sent >= 1);
    }
}
