//! SQLite storage layer for FieldSync.
//!
//! Provides the durable, network-independent half of the offline engine.
//!
//! # Architecture
//!
//! - Records of every entity type live in one `records` table, partitioned by
//!   collection name and keyed by id (upsert, last write wins)
//! - The sync queue is an append-ordered table; its autoincrement id is the
//!   enqueue order
//! - Discarded queue items are copied to `dead_letter` before removal
//! - `id_map` remembers which canonical id superseded each locally-minted id
//! - `meta` holds scalar timestamps used for cache TTL gating
//!
//! All public operations are async; the blocking SQLite work runs on tokio's
//! blocking pool so callers on the interactive path never wait on disk I/O.

mod error;
mod local_store;

pub use error::{StorageError, StorageResult};
pub use local_store::{DeadLetter, LocalStore, META_LAST_FULL_CACHE, META_LAST_WARM};
