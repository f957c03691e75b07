//! Core type definitions for FieldSync.
//!
//! This crate defines the storage- and transport-agnostic types shared by the
//! offline engine:
//! - Record identifiers, split into locally-minted and canonical ids
//! - Generic records stored in local collections
//! - Sync queue items and their discard policy
//! - Derived status entries used by the status cache
//!
//! Domain-specific payloads (visits, orders, customers) stay as JSON; only the
//! fields the sync engine needs to reason about are modelled here.

mod ids;
mod queue;
mod record;
mod status;
pub mod time;

pub use ids::{LOCAL_ID_PREFIX, LocalId, RecordId, RemoteId};
pub use queue::{DiscardReason, NewQueueItem, QueueItem};
pub use record::Record;
pub use status::{DerivedStatus, StatusKey, WorkStatus};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("record {0} already has a canonical id")]
    AlreadyCanonical(String),
}
