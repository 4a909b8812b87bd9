//! Fan-out queue: one producer, many named consumers

use super::meta::{Cursor, MetaPage};
use super::record;
use super::segment::{parse_segment_name, Segment};
use super::{QueueOptions, SyncPolicy};
use crate::{Result, SlotError};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Appender {
    file: BufWriter<File>,
    segment: Arc<Segment>,
    writes_since_sync: usize,
    last_sync: Instant,
    scratch: Vec<u8>,
}

struct ConsumerState {
    /// Next sequence to hand out
    consume_seq: AtomicU64,
    /// Every sequence below this is acknowledged
    ack_seq: AtomicU64,
    /// Serializes consume/ack/reset of one consumer
    lock: Mutex<()>,
}

impl ConsumerState {
    fn new(cursor: Cursor) -> Self {
        Self {
            consume_seq: AtomicU64::new(cursor.head),
            ack_seq: AtomicU64::new(cursor.ack),
            lock: Mutex::new(()),
        }
    }

    fn cursor(&self) -> Cursor {
        Cursor {
            head: self.consume_seq.load(Ordering::Acquire),
            ack: self.ack_seq.load(Ordering::Acquire),
        }
    }
}

struct Shared {
    dir: PathBuf,
    options: QueueOptions,
    appender: Mutex<Appender>,
    segments: RwLock<Vec<Arc<Segment>>>,
    head_seq: AtomicU64,
    consumers: RwLock<BTreeMap<String, Arc<ConsumerState>>>,
    meta_lock: Mutex<()>,
    signal: Mutex<()>,
    cond: Condvar,
    closed: AtomicBool,
}

/// Append-only byte queue with independently positioned consumers.
///
/// Sequences start at 0 and are assigned densely. `head_seq` is the next
/// sequence `put` will assign.
#[derive(Clone)]
pub struct FanOutQueue {
    shared: Arc<Shared>,
}

/// A named reader of a [`FanOutQueue`]
#[derive(Clone)]
pub struct Consumer {
    name: String,
    shared: Arc<Shared>,
    state: Arc<ConsumerState>,
}

impl FanOutQueue {
    /// Open or create a queue rooted at `dir`
    pub fn open(dir: impl AsRef<Path>, options: QueueOptions) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut bases: Vec<u64> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(base) = parse_segment_name(name) {
                bases.push(base);
            } else if name.ends_with(".tmp") {
                // interrupted rollover or meta write
                let _ = fs::remove_file(entry.path());
            }
        }
        bases.sort_unstable();

        let mut segments: Vec<Arc<Segment>> = Vec::with_capacity(bases.len().max(1));
        let mut active_file = None;
        for (i, base) in bases.iter().enumerate() {
            let is_last = i + 1 == bases.len();
            let path = dir.join(super::segment::segment_file_name(*base));
            let (segment, writer) = Segment::open(&path, *base, is_last)?;
            if let Some(prev) = segments.last() {
                if prev.end_seq() != *base {
                    return Err(SlotError::Corruption(format!(
                        "WAL gap in {:?}: segment ends at {} but next starts at {}",
                        dir,
                        prev.end_seq(),
                        base
                    )));
                }
            }
            segments.push(Arc::new(segment));
            if is_last {
                active_file = writer;
            }
        }

        let (active, file) = match (segments.last(), active_file) {
            (Some(seg), Some(file)) => (seg.clone(), file),
            _ => {
                let (segment, file) = Segment::create(&dir, 0)?;
                let segment = Arc::new(segment);
                segments.push(segment.clone());
                (segment, file)
            }
        };
        let head_seq = active.end_seq();
        let tail_seq = segments.first().map(|s| s.base_seq()).unwrap_or(head_seq);

        let meta = MetaPage::load(&dir)?;
        let consumers = meta
            .consumers
            .into_iter()
            .map(|(name, cursor)| {
                // unacknowledged records are handed out again after restart
                let ack = cursor.ack.clamp(tail_seq, head_seq);
                (name, Arc::new(ConsumerState::new(Cursor { head: ack, ack })))
            })
            .collect::<BTreeMap<_, _>>();

        info!(
            dir = ?dir,
            head_seq,
            tail_seq,
            segments = segments.len(),
            consumers = consumers.len(),
            "opened fan-out queue"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                dir,
                options,
                appender: Mutex::new(Appender {
                    file: BufWriter::new(file),
                    segment: active,
                    writes_since_sync: 0,
                    last_sync: Instant::now(),
                    scratch: Vec::new(),
                }),
                segments: RwLock::new(segments),
                head_seq: AtomicU64::new(head_seq),
                consumers: RwLock::new(consumers),
                meta_lock: Mutex::new(()),
                signal: Mutex::new(()),
                cond: Condvar::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    /// Next sequence to be assigned
    pub fn head_seq(&self) -> u64 {
        self.shared.head_seq.load(Ordering::Acquire)
    }

    /// Oldest sequence still stored
    pub fn tail_seq(&self) -> u64 {
        self.shared
            .segments
            .read()
            .first()
            .map(|s| s.base_seq())
            .unwrap_or_else(|| self.head_seq())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Append a message, returning its sequence
    pub fn put(&self, data: &[u8]) -> Result<u64> {
        self.put_inner(data, None)
    }

    /// Append unless `cancel` fires before the record is written
    pub fn put_cancelable(&self, data: &[u8], cancel: &CancellationToken) -> Result<u64> {
        self.put_inner(data, Some(cancel))
    }

    fn put_inner(&self, data: &[u8], cancel: Option<&CancellationToken>) -> Result<u64> {
        let shared = &self.shared;
        let mut app = shared.appender.lock();
        if cancel.is_some_and(|c| c.is_cancelled()) {
            return Err(SlotError::Canceled);
        }
        if shared.closed.load(Ordering::Acquire) {
            return Err(SlotError::Closed(format!("queue {:?}", shared.dir)));
        }

        let seq = shared.head_seq.load(Ordering::Acquire);
        let len = record::encoded_len(data.len());
        if app.segment.size() > 0 && app.segment.size() + len as u64 > shared.options.data_size_limit {
            self.roll(&mut app, seq)?;
        }

        let mut scratch = std::mem::take(&mut app.scratch);
        scratch.clear();
        record::encode(seq, data, &mut scratch);
        let written = app.file.write_all(&scratch).and_then(|_| app.file.flush());
        app.scratch = scratch;
        written?;
        app.segment.record_appended(len);
        app.writes_since_sync += 1;

        let sync = match shared.options.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => app.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => app.last_sync.elapsed().as_millis() >= millis as u128,
            SyncPolicy::None => false,
        };
        if sync {
            app.file.get_ref().sync_data()?;
            app.writes_since_sync = 0;
            app.last_sync = Instant::now();
        }

        shared.head_seq.store(seq + 1, Ordering::Release);
        drop(app);
        self.notify();
        Ok(seq)
    }

    fn roll(&self, app: &mut Appender, base_seq: u64) -> Result<()> {
        app.file.flush()?;
        app.file.get_ref().sync_all()?;
        app.segment.seal();

        let (segment, file) = Segment::create(&self.shared.dir, base_seq)?;
        let segment = Arc::new(segment);
        self.shared.segments.write().push(segment.clone());
        app.file = BufWriter::new(file);
        app.segment = segment;
        app.writes_since_sync = 0;
        app.last_sync = Instant::now();
        debug!(dir = ?self.shared.dir, base_seq, "rolled WAL segment");
        Ok(())
    }

    /// Flush and fsync the active segment
    pub fn sync(&self) -> Result<()> {
        let mut app = self.shared.appender.lock();
        app.file.flush()?;
        app.file.get_ref().sync_all()?;
        app.writes_since_sync = 0;
        app.last_sync = Instant::now();
        Ok(())
    }

    /// Get or create the consumer `name`. New consumers start at `head_seq`.
    pub fn fan_out(&self, name: &str) -> Result<Consumer> {
        let state = {
            let mut consumers = self.shared.consumers.write();
            if let Some(state) = consumers.get(name) {
                return Ok(Consumer {
                    name: name.to_string(),
                    shared: self.shared.clone(),
                    state: state.clone(),
                });
            }
            let head = self.head_seq();
            let state = Arc::new(ConsumerState::new(Cursor { head, ack: head }));
            consumers.insert(name.to_string(), state.clone());
            state
        };
        self.persist_meta()?;
        Ok(Consumer {
            name: name.to_string(),
            shared: self.shared.clone(),
            state,
        })
    }

    /// Names of all consumers
    pub fn consumer_names(&self) -> Vec<String> {
        self.shared.consumers.read().keys().cloned().collect()
    }

    pub fn consumer(&self, name: &str) -> Option<Consumer> {
        let state = self.shared.consumers.read().get(name)?.clone();
        Some(Consumer {
            name: name.to_string(),
            shared: self.shared.clone(),
            state,
        })
    }

    /// Whether every consumer has consumed and acknowledged everything
    pub fn is_drained(&self) -> bool {
        let head = self.head_seq();
        self.shared
            .consumers
            .read()
            .values()
            .all(|s| s.ack_seq.load(Ordering::Acquire) >= head)
    }

    /// Lowest ack sequence across consumers, `head_seq` when there are none
    pub fn min_ack_seq(&self) -> u64 {
        self.shared
            .consumers
            .read()
            .values()
            .map(|s| s.ack_seq.load(Ordering::Acquire))
            .min()
            .unwrap_or_else(|| self.head_seq())
    }

    /// Move the queue to `seq`.
    ///
    /// Equal to `head_seq`: no-op. Below it: records `>= seq` are dropped and
    /// cursors clamped. Above it, or below the oldest stored record: the
    /// queue restarts empty at `seq`.
    pub fn set_append_seq(&self, seq: u64) -> Result<()> {
        let shared = &self.shared;
        let mut app = shared.appender.lock();
        let head = shared.head_seq.load(Ordering::Acquire);
        if seq == head {
            return Ok(());
        }
        app.file.flush()?;

        let tail = shared.segments.read().first().map(|s| s.base_seq()).unwrap_or(head);
        if seq < head && seq >= tail {
            let mut segments = shared.segments.write();
            while let Some(last) = segments.last() {
                if last.base_seq() > seq || (last.base_seq() == seq && segments.len() > 1) {
                    last.remove()?;
                    segments.pop();
                } else {
                    break;
                }
            }
            let active = segments
                .last()
                .cloned()
                .ok_or_else(|| SlotError::Internal("queue lost its active segment".into()))?;
            drop(segments);
            active.truncate_from(seq)?;
            if !Arc::ptr_eq(&active, &app.segment) {
                let file = std::fs::OpenOptions::new().append(true).open(active.path())?;
                app.file = BufWriter::new(file);
                app.segment = active;
            }
        } else {
            let mut segments = shared.segments.write();
            for segment in segments.drain(..) {
                segment.remove()?;
            }
            let (segment, file) = Segment::create(&shared.dir, seq)?;
            let segment = Arc::new(segment);
            segments.push(segment.clone());
            app.file = BufWriter::new(file);
            app.segment = segment;
        }
        app.writes_since_sync = 0;
        shared.head_seq.store(seq, Ordering::Release);

        let restart = seq > head || seq < tail;
        for state in shared.consumers.read().values() {
            let _guard = state.lock.lock();
            if restart {
                state.consume_seq.store(seq, Ordering::Release);
                state.ack_seq.store(seq, Ordering::Release);
            } else {
                state.consume_seq.fetch_min(seq, Ordering::AcqRel);
                state.ack_seq.fetch_min(seq, Ordering::AcqRel);
            }
        }
        drop(app);
        info!(dir = ?shared.dir, from = head, to = seq, "reset append sequence");
        self.persist_meta()?;
        self.notify();
        Ok(())
    }

    /// Unlink sealed segments acknowledged by every consumer and sealed for
    /// at least `ttl` as of `now`. Returns the number removed.
    pub fn remove_expired(&self, now: Instant, ttl: Duration) -> Result<usize> {
        let min_ack = self.min_ack_seq();
        let mut removed = 0;
        let mut segments = self.shared.segments.write();
        // the active segment is always kept
        while segments.len() > 1 {
            let first = &segments[0];
            let old_enough = first
                .sealed_at()
                .is_some_and(|at| now.saturating_duration_since(at) >= ttl);
            if first.end_seq() > min_ack || !old_enough {
                break;
            }
            first.remove()?;
            debug!(segment = ?first.path(), "removed acknowledged WAL segment");
            segments.remove(0);
            removed += 1;
        }
        Ok(removed)
    }

    /// Persist the consumer cursors
    pub fn persist_meta(&self) -> Result<()> {
        self.shared.persist_meta()
    }

    /// Flush everything, persist cursors and wake blocked consumers
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.sync().and_then(|_| self.persist_meta());
        self.notify();
        if let Err(e) = &result {
            warn!(dir = ?self.shared.dir, error = %e, "failed to close queue cleanly");
        }
        result
    }

    /// Close and delete the queue directory
    pub fn destroy(self) -> Result<()> {
        self.close()?;
        fs::remove_dir_all(&self.shared.dir)?;
        Ok(())
    }

    fn notify(&self) {
        let _guard = self.shared.signal.lock();
        self.shared.cond.notify_all();
    }
}

impl Shared {
    fn persist_meta(&self) -> Result<()> {
        let _guard = self.meta_lock.lock();
        let page = MetaPage {
            consumers: self
                .consumers
                .read()
                .iter()
                .map(|(name, state)| (name.clone(), state.cursor()))
                .collect(),
        };
        page.store(&self.dir)
    }
}

impl Consumer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consume_seq(&self) -> u64 {
        self.state.consume_seq.load(Ordering::Acquire)
    }

    pub fn ack_seq(&self) -> u64 {
        self.state.ack_seq.load(Ordering::Acquire)
    }

    /// Records produced but not yet handed out
    pub fn pending(&self) -> u64 {
        self.shared
            .head_seq
            .load(Ordering::Acquire)
            .saturating_sub(self.consume_seq())
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Next record, or `None` when caught up
    pub fn consume(&self) -> Result<Option<(u64, Vec<u8>)>> {
        let _guard = self.state.lock.lock();
        let head = self.shared.head_seq.load(Ordering::Acquire);
        let mut seq = self.state.consume_seq.load(Ordering::Acquire);
        if seq >= head {
            return Ok(None);
        }

        let segment = {
            let segments = self.shared.segments.read();
            let first = segments.first().map(|s| s.base_seq()).unwrap_or(head);
            if seq < first {
                // pruned below every consumer
                warn!(consumer = %self.name, from = seq, to = first, "skipping removed WAL range");
                seq = first;
                if seq >= head {
                    self.state.consume_seq.store(seq, Ordering::Release);
                    return Ok(None);
                }
            }
            let idx = segments.partition_point(|s| s.base_seq() <= seq);
            segments
                .get(idx.wrapping_sub(1))
                .cloned()
                .ok_or_else(|| SlotError::Internal(format!("no segment for seq {}", seq)))?
        };

        let data = segment.read(seq)?;
        self.state.consume_seq.store(seq + 1, Ordering::Release);
        Ok(Some((seq, data)))
    }

    /// Wait up to `timeout` for the next record
    pub fn consume_timeout(&self, timeout: Duration) -> Result<Option<(u64, Vec<u8>)>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(rec) = self.consume()? {
                return Ok(Some(rec));
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            let mut guard = self.shared.signal.lock();
            if !self.is_empty() {
                continue;
            }
            if self.shared.cond.wait_until(&mut guard, deadline).timed_out() {
                drop(guard);
                return self.consume();
            }
        }
    }

    /// Acknowledge every sequence up to and including `seq`
    pub fn ack(&self, seq: u64) -> Result<()> {
        {
            let _guard = self.state.lock.lock();
            let limit = self.state.consume_seq.load(Ordering::Acquire);
            let target = (seq + 1).min(limit);
            if target <= self.state.ack_seq.load(Ordering::Acquire) {
                return Ok(());
            }
            self.state.ack_seq.store(target, Ordering::Release);
        }
        self.shared.persist_meta()
    }

    /// Move the consume position back to `seq` (not below the ack cursor)
    pub fn rewind(&self, seq: u64) {
        let _guard = self.state.lock.lock();
        let ack = self.state.ack_seq.load(Ordering::Acquire);
        let current = self.state.consume_seq.load(Ordering::Acquire);
        self.state
            .consume_seq
            .store(seq.clamp(ack, current), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn options(limit: u64) -> QueueOptions {
        QueueOptions {
            data_size_limit: limit,
            sync_policy: SyncPolicy::None,
        }
    }

    #[test]
    fn test_put_consume_ack() {
        let dir = TempDir::new().unwrap();
        let queue = FanOutQueue::open(dir.path(), options(1 << 20)).unwrap();
        let a = queue.fan_out("a").unwrap();
        let b = queue.fan_out("b").unwrap();

        for i in 0..10u64 {
            assert_eq!(queue.put(format!("m{i}").as_bytes()).unwrap(), i);
        }
        assert_eq!(queue.head_seq(), 10);
        assert_eq!(a.pending(), 10);

        for i in 0..10u64 {
            let (seq, data) = a.consume().unwrap().unwrap();
            assert_eq!(seq, i);
            assert_eq!(data, format!("m{i}").into_bytes());
        }
        assert!(a.consume().unwrap().is_none());
        assert!(a.is_empty());
        assert_eq!(b.pending(), 10);

        // ack is clamped to what was consumed
        b.consume().unwrap();
        b.ack(9).unwrap();
        assert_eq!(b.ack_seq(), 1);
        a.ack(4).unwrap();
        a.ack(2).unwrap();
        assert_eq!(a.ack_seq(), 5);
        assert_eq!(queue.min_ack_seq(), 1);

        // fan_out is idempotent
        let again = queue.fan_out("a").unwrap();
        assert_eq!(again.consume_seq(), 10);
    }

    #[test]
    fn test_restart_replays_unacked() {
        let dir = TempDir::new().unwrap();
        {
            let queue = FanOutQueue::open(dir.path(), options(4096)).unwrap();
            let c = queue.fan_out("c").unwrap();
            for i in 0..1000u32 {
                queue.put(&i.to_le_bytes()).unwrap();
            }
            for _ in 0..10 {
                c.consume().unwrap();
            }
            // no ack, no close
        }
        let queue = FanOutQueue::open(dir.path(), options(4096)).unwrap();
        assert_eq!(queue.head_seq(), 1000);
        let c = queue.consumer("c").unwrap();
        assert_eq!(c.consume_seq(), 0);
        for i in 0..1000u32 {
            let (seq, data) = c.consume().unwrap().unwrap();
            assert_eq!(seq, i as u64);
            assert_eq!(data, i.to_le_bytes());
        }
    }

    #[test]
    fn test_segment_roll_and_remove() {
        let dir = TempDir::new().unwrap();
        let queue = FanOutQueue::open(dir.path(), options(200)).unwrap();
        let c = queue.fan_out("c").unwrap();
        for _ in 0..50 {
            queue.put(&[7u8; 40]).unwrap();
        }
        let segments_before = queue.shared.segments.read().len();
        assert!(segments_before > 5);

        assert_eq!(queue.remove_expired(Instant::now(), Duration::ZERO).unwrap(), 0);
        for _ in 0..30 {
            let (seq, _) = c.consume().unwrap().unwrap();
            c.ack(seq).unwrap();
        }
        let removed = queue.remove_expired(Instant::now(), Duration::ZERO).unwrap();
        assert!(removed > 0);
        assert!(queue.tail_seq() <= 30);

        // remaining records are still readable in order
        let (seq, _) = c.consume().unwrap().unwrap();
        assert_eq!(seq, 30);
    }

    #[test]
    fn test_set_append_seq() {
        let dir = TempDir::new().unwrap();
        let queue = FanOutQueue::open(dir.path(), options(1 << 20)).unwrap();
        let c = queue.fan_out("c").unwrap();
        for i in 0..5u8 {
            queue.put(&[i]).unwrap();
        }
        for _ in 0..4 {
            c.consume().unwrap();
        }
        c.ack(1).unwrap();

        queue.set_append_seq(5).unwrap();
        assert_eq!(queue.head_seq(), 5);

        queue.set_append_seq(3).unwrap();
        assert_eq!(queue.head_seq(), 3);
        assert_eq!(c.consume_seq(), 3);
        assert_eq!(c.ack_seq(), 2);
        assert_eq!(queue.put(&[9]).unwrap(), 3);
        assert_eq!(c.consume().unwrap().unwrap(), (3, vec![9]));

        queue.set_append_seq(100).unwrap();
        assert_eq!(queue.head_seq(), 100);
        assert_eq!(c.consume_seq(), 100);
        assert_eq!(queue.put(&[1]).unwrap(), 100);
        drop(queue);

        let reopened = FanOutQueue::open(dir.path(), options(1 << 20)).unwrap();
        assert_eq!(reopened.head_seq(), 101);
        assert_eq!(reopened.consumer("c").unwrap().consume_seq(), 100);
    }

    #[test]
    fn test_consume_timeout_wakes_on_put() {
        let dir = TempDir::new().unwrap();
        let queue = FanOutQueue::open(dir.path(), options(1 << 20)).unwrap();
        let c = queue.fan_out("c").unwrap();
        assert!(c.consume_timeout(Duration::from_millis(10)).unwrap().is_none());

        let producer = queue.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.put(b"late").unwrap();
        });
        let rec = c.consume_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(rec, Some((0, b"late".to_vec())));
        handle.join().unwrap();

        queue.close().unwrap();
        assert!(matches!(queue.put(b"x"), Err(SlotError::Closed(_))));
    }
}
