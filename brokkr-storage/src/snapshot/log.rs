//! Per-segment operation log.
//!
//! One JSON object per line, append-only. The log is the source of truth for
//! the in-memory index: on restart every record is replayed in order and the
//! last record for a message id wins.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use brokkr_core::MessageEntity;

use crate::error::{Result, StoreError};

/// Operation kind of an oplog record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Message created (chunk enqueued for flush).
    #[serde(rename = "C")]
    Create,
    /// Delivery state updated.
    #[serde(rename = "U")]
    Update,
    /// Message deleted or rolled back.
    #[serde(rename = "D")]
    Delete,
    /// Message expired. Kept distinct from delete so offline analysis can
    /// tell expiry from explicit removal.
    #[serde(rename = "E")]
    Expire,
}

/// Mutable projection of a live message, serialized into every oplog record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpBody {
    /// Chunk id assigned on save.
    pub id: i64,

    #[serde(rename = "mid")]
    pub message_id: String,

    pub commit: bool,

    #[serde(rename = "fg", default)]
    pub fail_groups: Vec<String>,

    #[serde(rename = "sg", default)]
    pub succ_groups: Vec<String>,

    #[serde(rename = "ndt")]
    pub next_deliver_time: i64,

    #[serde(rename = "dc")]
    pub deliver_count: i32,
}

impl OpBody {
    /// Project the mutable delivery-state fields out of a full entity.
    pub fn from_entity(entity: &MessageEntity) -> Self {
        Self {
            id: -1,
            message_id: entity.message_id.clone(),
            commit: entity.commit,
            fail_groups: entity.fail_groups.clone(),
            succ_groups: entity.succ_groups.clone(),
            next_deliver_time: entity.next_deliver_time,
            deliver_count: entity.deliver_count,
        }
    }
}

/// One line of a segment's log file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpRecord {
    pub op: OpKind,
    pub logic_id: String,
    pub chunk_id: i64,
    /// Absent for `E` records; replay keys off `logic_id` alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<OpBody>,
}

impl OpRecord {
    pub fn new(op: OpKind, logic_id: &str, chunk_id: i64, body: Option<OpBody>) -> Self {
        Self { op, logic_id: logic_id.to_string(), chunk_id, body }
    }
}

/// Append handle plus replay access for one segment's log file.
#[derive(Debug)]
pub(crate) struct SegmentLog {
    path: PathBuf,
    file: Option<File>,
}

impl SegmentLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open (or create) the log file in append mode. Idempotent.
    pub fn open(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.file = Some(file);
        Ok(())
    }

    /// Append one record and push it to the OS synchronously.
    pub fn append(&mut self, record: &OpRecord) -> Result<()> {
        let file = self.file.as_mut().ok_or(StoreError::Closed)?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line)?;
        Ok(())
    }

    /// Stream every record in order through `apply`.
    ///
    /// A malformed line (typically a torn tail write) stops the replay with a
    /// warning; everything before it has already been applied. The callback
    /// must be idempotent.
    pub fn replay<F>(&self, mut apply: F) -> Result<u64>
    where
        F: FnMut(OpRecord),
    {
        if !self.path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut replayed = 0u64;
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "oplog read stopped early");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<OpRecord>(&line) {
                Ok(record) => {
                    apply(record);
                    replayed += 1;
                }
                Err(e) => {
                    warn!(
                        path = %self.path.display(),
                        error = %e,
                        replayed,
                        "malformed oplog record, stopping replay"
                    );
                    break;
                }
            }
        }
        Ok(replayed)
    }

    /// Flush and drop the append handle.
    pub fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = file.sync_all() {
                warn!(path = %self.path.display(), error = %e, "oplog sync on close failed");
            }
        }
    }
}
