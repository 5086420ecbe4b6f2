//! Persistent message store for the Brokkr broker.
//!
//! Two tightly coupled layers:
//!
//! - [`snapshot::MessageStore`]: a segmented append-only log. Each segment
//!   is a data file of checksummed chunks (one per message) plus an oplog of
//!   `C`/`U`/`D`/`E` records replayed on restart. Chunks are flushed in
//!   batches by a background task; segments whose every chunk is deleted or
//!   expired are reclaimed by a background evictor.
//! - [`index::FileStore`]: a 16-shard in-memory index of live messages,
//!   queried by message id and walked oldest-first for paged redelivery
//!   scans. Every index mutation appends an oplog record, so the index is
//!   always reconstructible from the log.
//!
//! ```no_run
//! use brokkr_core::{Header, MessageEntity};
//! use brokkr_storage::{FileStore, StoreConfig};
//!
//! # async fn demo() -> brokkr_storage::Result<()> {
//! let store = FileStore::new(StoreConfig::default())?;
//! store.start().await?;
//!
//! let entity = MessageEntity::new("m0", Header::default(), &b"payload"[..]);
//! assert!(store.save(&entity));
//! store.commit("m0");
//!
//! store.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod index;
pub mod snapshot;

pub use config::StoreConfig;
pub use error::{Result, StoreError};
pub use index::{FileStore, StoreMonitor, CONCURRENT_LEVEL};
pub use snapshot::{MessageStore, OpBody, OpKind, OpRecord};
