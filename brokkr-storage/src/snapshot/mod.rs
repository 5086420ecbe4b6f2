//! Segmented append-only message log.
//!
//! The [`MessageStore`] owns an ordered set of segments under
//! `<dir>/snapshot/`, allocates globally monotonic chunk ids, rolls the
//! active segment past a size threshold, flushes chunks in batches through a
//! background task and reclaims segments whose every chunk is deleted or
//! expired. Mutations are appended to the owning segment's oplog first; the
//! oplog stream is replayed on restart to rebuild the caller's index.

use std::fmt;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod chunk;
mod flusher;
mod log;
mod segment;

pub use log::{OpBody, OpKind, OpRecord};

use chunk::ChunkFlag;
use flusher::WriteCommand;
use segment::{Segment, SEGMENT_DATA_SUFFIX, SEGMENT_PREFIX};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};

const SNAPSHOT_DIR: &str = "snapshot";

/// Depth of the bounded flush queue between `append` and the flusher task.
const WRITE_QUEUE_DEPTH: usize = 10_000;

struct StoreInner {
    /// All known segments, ordered by `sid`.
    segments: Vec<Arc<Segment>>,
    /// Opened segments; pushing past capacity closes the least recent.
    cache: LruCache<i64, Arc<Segment>>,
}

struct Shared {
    dir: PathBuf,
    max_segment_size: u64,
    check_period: Duration,
    /// Highest assigned chunk id; -1 before the first save.
    chunk_id: AtomicI64,
    running: AtomicBool,
    inner: Mutex<StoreInner>,
}

/// The segmented message log.
pub struct MessageStore {
    shared: Arc<Shared>,
    batch_size: usize,
    flush_interval: Duration,
    tx: Mutex<Option<mpsc::Sender<WriteCommand>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MessageStore {
    pub fn new(config: &StoreConfig) -> Self {
        let cache_size =
            NonZeroUsize::new(config.segcache_size).unwrap_or(NonZeroUsize::MIN);
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                dir: config.dir.join(SNAPSHOT_DIR),
                max_segment_size: config.max_segment_size,
                check_period: config.check_period,
                chunk_id: AtomicI64::new(-1),
                running: AtomicBool::new(false),
                inner: Mutex::new(StoreInner {
                    segments: Vec::new(),
                    cache: LruCache::new(cache_size),
                }),
            }),
            batch_size: config.batch_size,
            flush_interval: config.flush_interval,
            tx: Mutex::new(None),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Load the segment directory, replay every oplog through `replay` and
    /// start the flusher and evictor tasks.
    ///
    /// # Errors
    /// Fails if the directory cannot be prepared or the first segment cannot
    /// be created; the store must not be used after a failed start.
    pub async fn start<F>(&self, replay: F) -> Result<()>
    where
        F: FnMut(OpRecord),
    {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let loaded = std::fs::create_dir_all(&self.shared.dir)
            .map_err(StoreError::from)
            .and_then(|()| self.load(replay));
        if let Err(e) = loaded {
            self.shared.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        *self.tx.lock() = Some(tx);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(flusher::run(rx, self.batch_size, self.flush_interval)));
        tasks.push(tokio::spawn(run_evictor(
            Arc::clone(&self.shared),
            self.shutdown.subscribe(),
        )));

        info!(
            dir = %self.shared.dir.display(),
            chunk_id = self.shared.chunk_id.load(Ordering::SeqCst),
            segments = self.shared.inner.lock().segments.len(),
            "message store started"
        );
        Ok(())
    }

    fn load<F>(&self, mut replay: F) -> Result<()>
    where
        F: FnMut(OpRecord),
    {
        let mut sids = Vec::new();
        for entry in std::fs::read_dir(&self.shared.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(SEGMENT_DATA_SUFFIX) else { continue };
            match stem
                .strip_prefix(SEGMENT_PREFIX)
                .and_then(|s| s.strip_prefix('-'))
                .and_then(|s| s.parse::<i64>().ok())
            {
                Some(sid) => sids.push(sid),
                None => warn!(file = name, "skipping data file with unparsable segment id"),
            }
        }
        sids.sort_unstable();

        let segments: Vec<Arc<Segment>> = sids
            .iter()
            .map(|sid| Arc::new(Segment::new(&self.shared.dir, *sid)))
            .collect();

        // Replay in sid order. The highest assigned chunk id is the max over
        // the last data chunk and every replayed record, so an oplog that ran
        // ahead of the data file cannot cause id reuse.
        let mut max_id = -1i64;
        let count = segments.len();
        for (i, segment) in segments.iter().enumerate() {
            segment.open()?;
            if let Some(last) = segment.last_chunk_id() {
                max_id = max_id.max(last);
            }
            let replayed = segment.replay_oplog(|record| {
                max_id = max_id.max(record.chunk_id);
                replay(record);
            })?;
            debug!(segment = %segment.name(), replayed, "oplog replayed");
            if i + 1 < count {
                segment.close();
            }
        }
        self.shared.chunk_id.store(max_id, Ordering::SeqCst);

        let mut inner = self.shared.inner.lock();
        inner.segments = segments;
        self.check_roll_locked(&mut inner)?;
        Ok(())
    }

    /// Persist a new message: assign the next chunk id, append a `C` oplog
    /// record to the active segment and queue the payload for flushing.
    ///
    /// Returns the assigned chunk id. An oplog failure fails the save and the
    /// chunk is never queued. A full flush queue fails the save with
    /// [`StoreError::QueueFull`]; the already-durable `C` record then replays
    /// as an orphan entry whose queries report a missing chunk.
    pub fn append(&self, logic_id: &str, payload: Bytes, body: &OpBody) -> Result<i64> {
        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let mut inner = self.shared.inner.lock();
        let segment = self.check_roll_locked(&mut inner)?;
        let id = self.shared.chunk_id.fetch_add(1, Ordering::SeqCst) + 1;

        let mut body = body.clone();
        body.id = id;
        segment.append_oplog(&OpRecord::new(OpKind::Create, logic_id, id, Some(body)))?;

        let tx = self.tx.lock();
        let sender = tx.as_ref().ok_or(StoreError::Closed)?;
        match sender.try_send(WriteCommand { id, payload, segment: Arc::clone(&segment) }) {
            Ok(()) => Ok(id),
            Err(mpsc::error::TrySendError::Full(_)) => Err(StoreError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(StoreError::Closed),
        }
    }

    /// Append a `U` record to the segment owning `chunk_id`.
    ///
    /// A chunk id no segment covers is an idempotent no-op.
    pub fn update(&self, chunk_id: i64, logic_id: &str, body: &OpBody) -> Result<()> {
        let Some(segment) = self.segment_for_op(chunk_id, logic_id)? else {
            return Ok(());
        };
        segment.append_oplog(&OpRecord::new(OpKind::Update, logic_id, chunk_id, Some(body.clone())))
    }

    /// Append a `D` record and rewrite the chunk's flag byte.
    pub fn delete(&self, chunk_id: i64, logic_id: &str, body: Option<&OpBody>) -> Result<()> {
        let Some(segment) = self.segment_for_op(chunk_id, logic_id)? else {
            return Ok(());
        };
        segment.append_oplog(&OpRecord::new(OpKind::Delete, logic_id, chunk_id, body.cloned()))?;
        // the durable D record already governs replay; a failed flag rewrite
        // only delays segment reclaim
        if let Err(e) = segment.mark(chunk_id, ChunkFlag::Deleted) {
            error!(segment = %segment.name(), chunk = chunk_id, error = %e, "delete flag rewrite failed");
        }
        Ok(())
    }

    /// Append an `E` record and rewrite the chunk's flag byte.
    pub fn expired(&self, chunk_id: i64, logic_id: &str) -> Result<()> {
        let Some(segment) = self.segment_for_op(chunk_id, logic_id)? else {
            return Ok(());
        };
        segment.append_oplog(&OpRecord::new(OpKind::Expire, logic_id, chunk_id, None))?;
        if let Err(e) = segment.mark(chunk_id, ChunkFlag::Expired) {
            error!(segment = %segment.name(), chunk = chunk_id, error = %e, "expire flag rewrite failed");
        }
        Ok(())
    }

    /// Fetch the frozen payload of one chunk.
    pub fn query(&self, chunk_id: i64) -> Result<Bytes> {
        let segment = self.index_segment(chunk_id)?;
        segment.chunk_data(chunk_id)
    }

    fn segment_for_op(&self, chunk_id: i64, logic_id: &str) -> Result<Option<Arc<Segment>>> {
        match self.index_segment(chunk_id) {
            Ok(segment) => Ok(Some(segment)),
            Err(StoreError::NoSegment(_)) => {
                debug!(chunk = chunk_id, message_id = logic_id, "mutation on unknown chunk skipped");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Find the segment owning `cid`: scan the opened-segment cache first,
    /// then binary-search the ordered set and open the hit.
    fn index_segment(&self, cid: i64) -> Result<Arc<Segment>> {
        let mut inner = self.shared.inner.lock();
        for (_, segment) in inner.cache.iter() {
            if segment.covers(cid) {
                return Ok(Arc::clone(segment));
            }
        }

        // greatest sid <= cid
        let idx = inner.segments.partition_point(|s| s.sid() <= cid);
        if idx == 0 {
            return Err(StoreError::NoSegment(cid));
        }
        let segment = Arc::clone(&inner.segments[idx - 1]);
        segment.open()?;
        Self::cache_insert(&mut inner.cache, Arc::clone(&segment));
        Ok(segment)
    }

    /// Return the active segment, creating or rolling one as needed.
    fn check_roll_locked(&self, inner: &mut StoreInner) -> Result<Arc<Segment>> {
        let active = match inner.segments.last() {
            Some(segment) => Arc::clone(segment),
            None => {
                let segment = Arc::new(Segment::new(&self.shared.dir, 0));
                // the very first segment failing to open is fatal
                segment.open()?;
                info!(segment = %segment.name(), "created initial segment");
                inner.segments.push(Arc::clone(&segment));
                Self::cache_insert(&mut inner.cache, Arc::clone(&segment));
                return Ok(segment);
            }
        };

        if active.byte_size() <= self.shared.max_segment_size {
            return Ok(active);
        }

        let next_sid = self.shared.chunk_id.load(Ordering::SeqCst) + 1;
        let segment = Arc::new(Segment::new(&self.shared.dir, next_sid));
        match segment.open() {
            Ok(()) => {
                info!(segment = %segment.name(), "rolled active segment");
                inner.segments.push(Arc::clone(&segment));
                Self::cache_insert(&mut inner.cache, Arc::clone(&segment));
                Ok(segment)
            }
            Err(e) => {
                error!(segment = %segment.name(), error = %e, "segment roll failed, keeping active segment");
                Ok(active)
            }
        }
    }

    fn cache_insert(cache: &mut LruCache<i64, Arc<Segment>>, segment: Arc<Segment>) {
        let sid = segment.sid();
        if let Some((evicted_sid, evicted)) = cache.push(sid, segment) {
            if evicted_sid != sid {
                debug!(segment = evicted_sid, "closing segment evicted from cache");
                evicted.close();
            }
        }
    }

    /// Stop the background tasks, drain the write queue and close every
    /// segment.
    pub async fn destroy(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);

        // dropping the sender closes the channel; the flusher drains whatever
        // is queued and performs its final flush before exiting
        let sender = self.tx.lock().take();
        drop(sender);

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task join failed");
            }
        }

        let segments: Vec<Arc<Segment>> = {
            let mut inner = self.shared.inner.lock();
            inner.cache.clear();
            inner.segments.clone()
        };
        for segment in segments {
            segment.close();
        }
        info!("message store destroyed");
    }

    /// Highest assigned chunk id, -1 before the first save.
    pub fn last_chunk_id(&self) -> i64 {
        self.shared.chunk_id.load(Ordering::SeqCst)
    }

    /// Number of known segments.
    pub fn segment_count(&self) -> usize {
        self.shared.inner.lock().segments.len()
    }
}

impl fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageStore")
            .field("dir", &self.shared.dir)
            .field("chunk_id", &self.shared.chunk_id.load(Ordering::SeqCst))
            .field("segments", &self.shared.inner.lock().segments.len())
            .finish()
    }
}

async fn run_evictor(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(shared.check_period) => {}
            _ = shutdown.changed() => break,
        }
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }
        evict_once(&shared);
    }
    debug!("segment evictor stopped");
}

/// Walk the opened-segment cache oldest-first and remove every segment with
/// no normal chunks left. The active segment is exempt while writable.
fn evict_once(shared: &Shared) {
    let (candidates, active_sid) = {
        let inner = shared.inner.lock();
        let active_sid = inner.segments.last().map(|s| s.sid());
        let candidates: Vec<Arc<Segment>> =
            inner.cache.iter().rev().map(|(_, s)| Arc::clone(s)).collect();
        (candidates, active_sid)
    };

    let mut table = String::new();
    let mut removable = Vec::new();
    for segment in candidates {
        if let Err(e) = segment.open() {
            warn!(segment = %segment.name(), error = %e, "evictor failed to open segment");
            continue;
        }
        let stats = segment.stat();
        table.push_str(&format!(
            "|{}\t|{}\t|{}\t|{}\t|{}\t|\n",
            segment.name(),
            stats.total,
            stats.normal,
            stats.deleted,
            stats.expired
        ));
        if stats.normal == 0 && Some(segment.sid()) != active_sid {
            removable.push(segment);
        }
    }

    if !table.is_empty() {
        info!(
            "segment stats\n|segment\t|total\t|normal\t|deleted\t|expired\t|\n{}",
            table
        );
    }

    for segment in removable {
        remove_segment(shared, &segment);
    }
}

fn remove_segment(shared: &Shared, segment: &Arc<Segment>) {
    {
        let mut inner = shared.inner.lock();
        inner.cache.pop(&segment.sid());
        inner.segments.retain(|s| s.sid() != segment.sid());
    }
    segment.close();
    let log_path = segment.log_path();
    if let Err(e) = std::fs::remove_file(segment.data_path()) {
        warn!(segment = %segment.name(), error = %e, "failed to remove data file");
    }
    if let Err(e) = std::fs::remove_file(&log_path) {
        warn!(segment = %segment.name(), error = %e, "failed to remove log file");
    }
    info!(segment = %segment.name(), "removed empty segment");
}
