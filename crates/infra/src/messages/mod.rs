//! Source messages and the derived-record stores written by the stage workers.
//!
//! Two seams:
//! - `MessageSource`: read-only view of the messenger `messages` table
//! - `DerivedRecordStore`: per-stage outputs (`normalized_messages`, `message_embeddings`,
//!   `message_annotations`), keyed by message id

pub mod in_memory;
pub mod postgres;
pub mod types;

pub use in_memory::{InMemoryDerivedStore, InMemoryMessageStore};
pub use postgres::{PostgresDerivedStore, PostgresMessageStore};
pub use types::{DerivedRecord, DerivedRecordStore, Message, MessageDirection, MessageSource, MessageStoreError};
