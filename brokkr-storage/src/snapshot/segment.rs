//! A bounded pair of files holding a contiguous range of chunk ids: the data
//! file of chunk records plus the oplog that mutates them.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

use super::chunk::{Chunk, ChunkFlag, FLAG_OFFSET};
use super::log::{OpRecord, SegmentLog};

pub(crate) const SEGMENT_PREFIX: &str = "segment";
pub(crate) const SEGMENT_DATA_SUFFIX: &str = ".data";
pub(crate) const SEGMENT_LOG_SUFFIX: &str = ".log";

/// Per-segment chunk counts by flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentStats {
    pub total: usize,
    pub normal: usize,
    pub deleted: usize,
    pub expired: usize,
}

#[derive(Debug)]
struct SegmentInner {
    file: Option<File>,
    log: SegmentLog,
    byte_size: u64,
    chunks: Vec<Chunk>,
}

/// One segment of the message store.
///
/// A segment is independently lockable; the flusher appends chunk batches,
/// callers rewrite flag bytes and append oplog records, and the evictor reads
/// stats, all serialized through the inner lock.
#[derive(Debug)]
pub(crate) struct Segment {
    sid: i64,
    name: String,
    path: PathBuf,
    inner: RwLock<SegmentInner>,
}

impl Segment {
    pub fn new(dir: &Path, sid: i64) -> Self {
        let name = format!("{}-{}", SEGMENT_PREFIX, sid);
        let path = dir.join(format!("{}{}", name, SEGMENT_DATA_SUFFIX));
        let log_path = dir.join(format!("{}{}", name, SEGMENT_LOG_SUFFIX));
        Self {
            sid,
            name,
            path,
            inner: RwLock::new(SegmentInner {
                file: None,
                log: SegmentLog::new(log_path),
                byte_size: 0,
                chunks: Vec::new(),
            }),
        }
    }

    pub fn sid(&self) -> i64 {
        self.sid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_path(&self) -> &Path {
        &self.path
    }

    pub fn log_path(&self) -> PathBuf {
        self.inner.read().log.path().to_path_buf()
    }

    /// Open both files and rebuild the in-memory chunk list. Idempotent.
    pub fn open(&self) -> Result<()> {
        let mut inner = self.inner.write();
        self.open_locked(&mut inner)
    }

    fn open_locked(&self, inner: &mut SegmentInner) -> Result<()> {
        if inner.file.is_some() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;

        let mut raw = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut raw)?;
        let raw = Bytes::from(raw);

        let mut chunks = Vec::new();
        let mut offset = 0usize;
        while offset < raw.len() {
            match Chunk::decode_at(&raw, offset) {
                Ok(chunk) => {
                    offset += chunk.encoded_len();
                    chunks.push(chunk);
                }
                Err(details) => {
                    let corruption = StoreError::Corruption {
                        segment: self.name.clone(),
                        offset: offset as u64,
                        details,
                    };
                    warn!(error = %corruption, "truncating segment to last valid boundary");
                    file.set_len(offset as u64)?;
                    break;
                }
            }
        }

        inner.byte_size = offset as u64;
        inner.chunks = chunks;
        inner.file = Some(file);
        inner.log.open()?;
        Ok(())
    }

    /// Flush and close both files, dropping the scanned chunks.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        if let Some(file) = inner.file.take() {
            if let Err(e) = file.sync_all() {
                warn!(segment = %self.name, error = %e, "data sync on close failed");
            }
        }
        inner.log.close();
        inner.chunks.clear();
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().file.is_some()
    }

    /// Append a batch of chunks to the data file.
    pub fn append_chunks(&self, batch: Vec<Chunk>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut inner = self.inner.write();
        self.open_locked(&mut inner)?;

        let mut buf = BytesMut::with_capacity(batch.iter().map(Chunk::encoded_len).sum());
        let mut offset = inner.byte_size;
        let mut appended = batch;
        for chunk in &mut appended {
            chunk.offset = offset;
            offset += chunk.encoded_len() as u64;
            chunk.encode(&mut buf);
        }

        let start = inner.byte_size;
        let file = inner.file.as_mut().ok_or(StoreError::Closed)?;
        file.seek(SeekFrom::Start(start))?;
        file.write_all(&buf)?;

        inner.byte_size = offset;
        inner.chunks.append(&mut appended);
        Ok(())
    }

    /// Append one record to the segment's oplog.
    pub fn append_oplog(&self, record: &OpRecord) -> Result<()> {
        let mut inner = self.inner.write();
        self.open_locked(&mut inner)?;
        inner.log.append(record)
    }

    /// Replay the segment's oplog through `apply`.
    pub fn replay_oplog<F>(&self, apply: F) -> Result<u64>
    where
        F: FnMut(OpRecord),
    {
        self.inner.read().log.replay(apply)
    }

    /// Fetch the payload of the chunk with the given id.
    pub fn chunk_data(&self, id: i64) -> Result<Bytes> {
        let inner = self.inner.read();
        inner
            .chunks
            .binary_search_by_key(&id, |c| c.id)
            .ok()
            .map(|idx| inner.chunks[idx].data.clone())
            .ok_or_else(|| StoreError::NoChunk { segment: self.name.clone(), chunk: id })
    }

    /// Rewrite the flag byte of one chunk in place.
    ///
    /// Returns `Ok(false)` when the chunk is unknown or already carries the
    /// flag; both are no-ops.
    pub fn mark(&self, id: i64, flag: ChunkFlag) -> Result<bool> {
        let mut inner = self.inner.write();
        self.open_locked(&mut inner)?;

        let Ok(idx) = inner.chunks.binary_search_by_key(&id, |c| c.id) else {
            debug!(segment = %self.name, chunk = id, "flag rewrite for unknown chunk skipped");
            return Ok(false);
        };
        if inner.chunks[idx].flag == flag {
            return Ok(false);
        }

        let flag_pos = inner.chunks[idx].offset + FLAG_OFFSET;
        let file = inner.file.as_mut().ok_or(StoreError::Closed)?;
        file.seek(SeekFrom::Start(flag_pos))?;
        file.write_all(&[flag as u8])?;
        inner.chunks[idx].flag = flag;
        Ok(true)
    }

    /// Whether the segment's flushed chunk range covers `cid`.
    pub fn covers(&self, cid: i64) -> bool {
        let inner = self.inner.read();
        self.sid <= cid && cid < self.sid + inner.chunks.len() as i64
    }

    pub fn last_chunk_id(&self) -> Option<i64> {
        self.inner.read().chunks.last().map(|c| c.id)
    }

    pub fn byte_size(&self) -> u64 {
        self.inner.read().byte_size
    }

    pub fn stat(&self) -> SegmentStats {
        let inner = self.inner.read();
        let mut stats = SegmentStats { total: inner.chunks.len(), ..Default::default() };
        for chunk in &inner.chunks {
            match chunk.flag {
                ChunkFlag::Normal => stats.normal += 1,
                ChunkFlag::Deleted => stats.deleted += 1,
                ChunkFlag::Expired => stats.expired += 1,
            }
        }
        stats
    }
}
