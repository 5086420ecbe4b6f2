//! Background chunk flusher.
//!
//! Saved payloads are queued as [`WriteCommand`]s and written to their target
//! segment in batches. A batch is flushed when the target segment changes,
//! when it reaches the configured size, or when the interval tick fires with
//! data pending. When the command channel closes the queue is drained and a
//! final flush runs before the task exits.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc::Receiver;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use super::chunk::Chunk;
use super::segment::Segment;

/// One queued chunk write, bound to the segment that was active when the
/// chunk id was assigned.
#[derive(Debug)]
pub(crate) struct WriteCommand {
    pub id: i64,
    pub payload: Bytes,
    pub segment: Arc<Segment>,
}

pub(crate) async fn run(
    mut rx: Receiver<WriteCommand>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut batch: Vec<Chunk> = Vec::with_capacity(batch_size);
    let mut current: Option<Arc<Segment>> = None;

    let mut tick = tokio::time::interval(flush_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(cmd) = maybe else {
                    // channel closed and drained
                    break;
                };

                match &current {
                    Some(segment) if segment.sid() != cmd.segment.sid() => {
                        flush(segment, &mut batch);
                        current = Some(cmd.segment);
                    }
                    None => current = Some(cmd.segment),
                    _ => {}
                }

                batch.push(Chunk::new(cmd.id, cmd.payload));
                if batch.len() >= batch_size {
                    if let Some(segment) = &current {
                        flush(segment, &mut batch);
                    }
                }
            }
            _ = tick.tick() => {
                if !batch.is_empty() {
                    if let Some(segment) = &current {
                        flush(segment, &mut batch);
                    }
                }
            }
        }
    }

    if let Some(segment) = &current {
        flush(segment, &mut batch);
    }
    debug!("chunk flusher stopped");
}

fn flush(segment: &Segment, batch: &mut Vec<Chunk>) {
    if batch.is_empty() {
        return;
    }
    let count = batch.len();
    let chunks = std::mem::replace(batch, Vec::with_capacity(count));
    if let Err(e) = segment.append_chunks(chunks) {
        // The oplog is already ahead of the data; queries for these ids will
        // report a missing chunk until the broker expires them.
        error!(segment = %segment.name(), count, error = %e, "chunk flush failed");
    }
}
