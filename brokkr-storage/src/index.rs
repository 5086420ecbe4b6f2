//! Sharded in-memory index of live messages.
//!
//! The [`FileStore`] is the store surface the broker talks to. Live messages
//! are tracked as [`OpBody`] projections across 16 independent shards keyed
//! by the final hex digit of the message id; each shard is a map plus a
//! recency list (oldest entries at the tail), which gives O(1) keyed access
//! and oldest-first walks for paged redelivery queries. Every mutation is
//! appended to the owning segment's oplog through the [`MessageStore`], and
//! the index is rebuilt from that stream on restart.

use std::fmt;

use lru::LruCache;
use parking_lot::RwLock;
use tracing::{error, info, warn};

use brokkr_core::{shard_of, MessageEntity};

use crate::config::StoreConfig;
use crate::error::{Result, StoreError};
use crate::snapshot::{MessageStore, OpBody, OpKind, OpRecord};

/// Fixed shard count; the shard key is the last hex digit of the message id.
pub const CONCURRENT_LEVEL: usize = 16;

type Shard = RwLock<LruCache<String, OpBody>>;

/// Store-wide live-entry counters, as reported by [`FileStore::monitor`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMonitor {
    /// Total live index entries across all shards.
    pub message_count: usize,
}

impl fmt::Display for StoreMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message-length:{}", self.message_count)
    }
}

/// The persistent message store.
pub struct FileStore {
    shards: Vec<Shard>,
    shard_capacity: usize,
    snapshot: MessageStore,
}

impl FileStore {
    /// Build a store over the configured directory. No files are touched
    /// until [`FileStore::start`].
    ///
    /// # Errors
    /// Returns [`StoreError::Configuration`] when the config is invalid.
    pub fn new(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let shards = (0..CONCURRENT_LEVEL)
            .map(|_| RwLock::new(LruCache::unbounded()))
            .collect();
        Ok(Self {
            shards,
            shard_capacity: config.max_capacity / CONCURRENT_LEVEL,
            snapshot: MessageStore::new(&config),
        })
    }

    /// Load the snapshot directory and rebuild the index by oplog replay.
    pub async fn start(&self) -> Result<()> {
        self.snapshot.start(|record| self.apply(record)).await?;
        info!(entries = self.monitor().message_count, "file store started");
        Ok(())
    }

    /// Flush outstanding writes and shut the store down.
    pub async fn stop(&self) {
        self.snapshot.destroy().await;
        info!("file store stopped");
    }

    /// Number of independent recovery partitions (the shard count).
    pub fn recover_num(&self) -> usize {
        CONCURRENT_LEVEL
    }

    /// Live-entry counters across all shards.
    pub fn monitor(&self) -> StoreMonitor {
        let message_count = self.shards.iter().map(|s| s.read().len()).sum();
        StoreMonitor { message_count }
    }

    /// Persist a new message.
    ///
    /// Returns `false` when the entity fails validation, when the owning
    /// shard is at capacity, when the entity cannot be serialized or when the
    /// oplog append fails; in every case the index is left untouched and the
    /// caller must apply backpressure.
    pub fn save(&self, entity: &MessageEntity) -> bool {
        if let Err(e) = entity.validate() {
            error!(error = %e, "rejecting invalid entity");
            return false;
        }

        let mut entries = self.shard(&entity.message_id).write();
        if entries.len() >= self.shard_capacity {
            return false;
        }

        let payload = match serde_json::to_vec(entity) {
            Ok(payload) => payload,
            Err(e) => {
                error!(message_id = %entity.message_id, error = %e, "entity serialization failed");
                return false;
            }
        };
        let mut body = OpBody::from_entity(entity);
        body.deliver_count = 0;

        match self.snapshot.append(&entity.message_id, payload.into(), &body) {
            Ok(id) => {
                body.id = id;
                entries.put(entity.message_id.clone(), body);
                true
            }
            Err(e) => {
                error!(message_id = %entity.message_id, error = %e, "save failed");
                false
            }
        }
    }

    /// Fetch a live message: the frozen chunk overlaid with the current
    /// delivery state.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] when no live entry exists;
    /// [`StoreError::NoChunk`] when the entry exists but its chunk was never
    /// flushed (the broker treats this as a lost message).
    pub fn query(&self, message_id: &str) -> Result<MessageEntity> {
        let entries = self.shard(message_id).read();
        let body = entries
            .peek(message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?
            .clone();

        let raw = self.snapshot.query(body.id)?;
        let mut entity: MessageEntity = serde_json::from_slice(&raw)?;
        entity.commit = body.commit;
        entity.fail_groups = body.fail_groups;
        entity.succ_groups = body.succ_groups;
        entity.next_deliver_time = body.next_deliver_time;
        entity.deliver_count = body.deliver_count;
        Ok(entity)
    }

    /// Mark a message committed for delivery.
    ///
    /// Returns `false` for an unknown message id or a failed oplog append.
    pub fn commit(&self, message_id: &str) -> bool {
        let mut entries = self.shard(message_id).write();
        let Some(body) = entries.peek_mut(message_id) else {
            return false;
        };
        let mut updated = body.clone();
        updated.commit = true;
        match self.snapshot.update(updated.id, message_id, &updated) {
            Ok(()) => {
                *body = updated;
                true
            }
            Err(e) => {
                error!(message_id, error = %e, "commit failed");
                false
            }
        }
    }

    /// Overwrite the delivery-state fields from the caller's entity.
    ///
    /// Unknown message ids are an idempotent no-op returning `true`.
    pub fn update_entity(&self, entity: &MessageEntity) -> bool {
        let mut entries = self.shard(&entity.message_id).write();
        let Some(body) = entries.peek_mut(&entity.message_id) else {
            return true;
        };
        let mut updated = body.clone();
        updated.deliver_count = entity.deliver_count;
        updated.next_deliver_time = entity.next_deliver_time;
        updated.succ_groups = entity.succ_groups.clone();
        updated.fail_groups = entity.fail_groups.clone();
        match self.snapshot.update(updated.id, &entity.message_id, &updated) {
            Ok(()) => {
                *body = updated;
                true
            }
            Err(e) => {
                error!(message_id = %entity.message_id, error = %e, "update failed");
                false
            }
        }
    }

    /// Remove a message and mark its chunk deleted.
    ///
    /// Unknown message ids are an idempotent no-op returning `true`.
    pub fn delete(&self, message_id: &str) -> bool {
        let mut entries = self.shard(message_id).write();
        let Some(body) = entries.peek(message_id).cloned() else {
            return true;
        };
        match self.snapshot.delete(body.id, message_id, Some(&body)) {
            Ok(()) => {
                entries.pop(message_id);
                true
            }
            Err(e) => {
                error!(message_id, error = %e, "delete failed");
                false
            }
        }
    }

    /// Rollback an uncommitted message. Identical to [`FileStore::delete`].
    pub fn rollback(&self, message_id: &str) -> bool {
        self.delete(message_id)
    }

    /// Remove an expired message and mark its chunk expired. The distinct
    /// `E` oplog record lets offline analysis tell expiry from deletion.
    pub fn expired(&self, message_id: &str) -> bool {
        let mut entries = self.shard(message_id).write();
        let Some(body) = entries.peek(message_id).cloned() else {
            return true;
        };
        match self.snapshot.expired(body.id, message_id) {
            Ok(()) => {
                entries.pop(message_id);
                true
            }
            Err(e) => {
                error!(message_id, error = %e, "expire failed");
                false
            }
        }
    }

    /// Identical to [`FileStore::commit`]; kept for the broker API.
    pub fn async_commit(&self, message_id: &str) -> bool {
        self.commit(message_id)
    }

    /// Identical to [`FileStore::update_entity`]; kept for the broker API.
    pub fn async_update(&self, entity: &MessageEntity) -> bool {
        self.update_entity(entity)
    }

    /// Identical to [`FileStore::delete`]; kept for the broker API.
    pub fn async_delete(&self, message_id: &str) -> bool {
        self.delete(message_id)
    }

    /// Page through one shard's messages due for redelivery.
    ///
    /// Walks the shard oldest-first, keeps entries with
    /// `next_deliver_time <= deadline`, skips the first `start_index`
    /// matches and collects up to `limit`. The returned flag tells whether at
    /// least one further match exists beyond the page. Entries are
    /// projections only (no payload); the scheduler queries the full entity
    /// when it actually delivers.
    pub fn page_query_entity(
        &self,
        hash_key: &str,
        _server: &str,
        deadline: i64,
        start_index: usize,
        limit: usize,
    ) -> (bool, Vec<MessageEntity>) {
        let entries = self.shard(hash_key).read();
        let mut page = Vec::new();
        let mut matched = 0usize;

        for (_, body) in entries.iter().rev() {
            if body.next_deliver_time > deadline {
                continue;
            }
            if matched >= start_index {
                page.push(Self::projection(body));
            }
            matched += 1;
            if page.len() > limit {
                break;
            }
        }

        if page.len() > limit {
            page.truncate(limit);
            (true, page)
        } else {
            (false, page)
        }
    }

    /// Rebuild one index entry from an oplog record during replay.
    ///
    /// Must be idempotent: a `D`/`E` for an absent id is a no-op, a repeated
    /// `C`/`U` overwrites.
    fn apply(&self, record: OpRecord) {
        let mut entries = self.shard(&record.logic_id).write();
        match record.op {
            OpKind::Create | OpKind::Update => {
                let Some(mut body) = record.body else {
                    warn!(
                        message_id = %record.logic_id,
                        chunk = record.chunk_id,
                        "replayed create/update without body, skipping"
                    );
                    return;
                };
                body.id = record.chunk_id;
                entries.put(record.logic_id, body);
            }
            OpKind::Delete | OpKind::Expire => {
                entries.pop(&record.logic_id);
            }
        }
    }

    fn projection(body: &OpBody) -> MessageEntity {
        MessageEntity {
            message_id: body.message_id.clone(),
            commit: body.commit,
            fail_groups: body.fail_groups.clone(),
            succ_groups: body.succ_groups.clone(),
            next_deliver_time: body.next_deliver_time,
            deliver_count: body.deliver_count,
            ..Default::default()
        }
    }

    fn shard(&self, message_id: &str) -> &Shard {
        &self.shards[shard_of(message_id, CONCURRENT_LEVEL)]
    }
}

impl fmt::Debug for FileStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStore")
            .field("entries", &self.monitor().message_count)
            .field("shard_capacity", &self.shard_capacity)
            .field("snapshot", &self.snapshot)
            .finish()
    }
}
