//! Message entity persisted by the store and routed by the broker.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Immutable header fields set by the publisher.
///
/// The store persists the header verbatim inside the message chunk; it never
/// reads it back except to hand the full entity to the delivery scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Topic the message was published to.
    pub topic: String,

    /// Application-level message type within the topic.
    pub message_type: String,

    /// Publisher group that produced the message.
    pub group_id: String,

    /// Epoch seconds after which the message may be expired.
    pub expired_time: i64,

    /// Maximum delivery attempts before the broker gives up.
    pub deliver_limit: i32,

    /// Fly messages are delivered without waiting for a commit.
    pub fly: bool,
}

/// The full message record.
///
/// The entity is written once to the chunk file at save time; the delivery
/// state fields (`commit`, groups, `next_deliver_time`, `deliver_count`) are
/// mutated in the store's in-memory index afterwards and overlaid on top of
/// the frozen copy when the entity is queried back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageEntity {
    /// Unique message identifier. The final hex digit selects the index shard.
    pub message_id: String,

    /// Publisher-supplied header, persisted verbatim.
    pub header: Header,

    /// Opaque payload.
    pub body: Bytes,

    /// Whether the publisher has committed the message for delivery.
    pub commit: bool,

    /// Groups whose delivery failed and will be retried.
    pub fail_groups: Vec<String>,

    /// Groups that acknowledged delivery.
    pub succ_groups: Vec<String>,

    /// Earliest epoch seconds at which the next delivery may happen.
    pub next_deliver_time: i64,

    /// Delivery attempts so far.
    pub deliver_count: i32,

    /// Epoch seconds at which the message was accepted.
    pub publish_time: i64,
}

impl MessageEntity {
    /// Create an uncommitted entity with the given id, header and payload.
    pub fn new(message_id: impl Into<String>, header: Header, body: impl Into<Bytes>) -> Self {
        Self {
            message_id: message_id.into(),
            header,
            body: body.into(),
            ..Default::default()
        }
    }

    /// Validate the entity before it is handed to a store.
    ///
    /// # Errors
    /// Returns [`Error::InvalidMessage`] if the message id is empty.
    pub fn validate(&self) -> Result<()> {
        if self.message_id.is_empty() {
            return Err(Error::InvalidMessage {
                message: "message id cannot be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Index shard selector shared by the broker and its stores: the last hex
/// digit of the message id modulo `shards`. Ids with a non-hex final
/// character all route to shard 0.
pub fn shard_of(message_id: &str, shards: usize) -> usize {
    message_id
        .chars()
        .last()
        .and_then(|c| c.to_digit(16))
        .map(|digit| digit as usize % shards)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_of_uses_last_hex_digit() {
        assert_eq!(shard_of("message-0", 16), 0);
        assert_eq!(shard_of("message-7", 16), 7);
        assert_eq!(shard_of("message-a", 16), 10);
        assert_eq!(shard_of("message-F", 16), 15);
        // digits wrap around smaller shard counts
        assert_eq!(shard_of("message-a", 4), 2);
    }

    #[test]
    fn test_shard_of_invalid_tail_routes_to_zero() {
        assert_eq!(shard_of("message-z", 16), 0);
        assert_eq!(shard_of("", 16), 0);
    }

    #[test]
    fn test_new_entity_defaults() {
        let entity = MessageEntity::new("m0", Header::default(), &b"payload"[..]);
        assert_eq!(entity.message_id, "m0");
        assert!(!entity.commit);
        assert_eq!(entity.deliver_count, 0);
        assert!(entity.fail_groups.is_empty());
        assert!(entity.validate().is_ok());
    }

    #[test]
    fn test_empty_message_id_rejected() {
        let entity = MessageEntity::new("", Header::default(), Bytes::new());
        assert!(entity.validate().is_err());
    }

    #[test]
    fn test_entity_serde_roundtrip() {
        let mut entity = MessageEntity::new("abc0", Header::default(), &b"hello"[..]);
        entity.header.topic = "trade".to_string();
        entity.next_deliver_time = 1_700_000_000;
        entity.fail_groups = vec!["g-a".to_string()];

        let json = serde_json::to_vec(&entity).unwrap();
        let back: MessageEntity = serde_json::from_slice(&json).unwrap();
        assert_eq!(entity, back);
    }
}
