//! Core message model shared between the Brokkr broker and its stores.
//!
//! This crate carries no I/O: it defines the message entity persisted by the
//! storage layer and handed to the delivery scheduler.

pub mod error;
pub mod message;

pub use error::{Error, Result};
pub use message::{shard_of, Header, MessageEntity};
