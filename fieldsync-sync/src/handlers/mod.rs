//! Replay handlers: one per queued action.
//!
//! A handler must be safe against a remote store that already holds a prior,
//! partially acknowledged attempt of the same mutation. The helpers in this
//! module implement the shared parts of that contract: idempotency-key
//! lookup, uniqueness violations read as success, and foreign keys that
//! still point at locally-minted ids.

mod order;
mod record;
mod visit;

pub use order::{CREATE_ORDER, CreateOrderHandler, OrderPayload};
pub use record::{
    DELETE_RECORD, DeleteRecordHandler, DeleteRecordPayload, UPDATE_RECORD, UpdateRecordHandler,
    UpdateRecordPayload,
};
pub use visit::{RECORD_VISIT, RecordVisitHandler, VisitPayload};

use crate::error::{RemoteError, ReplayError};
use crate::remote::{Filter, RemoteService, row_id};
use crate::status_cache::DerivedStatusCache;
use async_trait::async_trait;
use fieldsync_storage::{LocalStore, StorageResult};
use fieldsync_types::{LocalId, Record, RecordId, RemoteId};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Local and remote collection of visit outcomes.
pub const VISITS: &str = "visits";
/// Local and remote collection of orders.
pub const ORDERS: &str = "orders";
/// Remote column holding the caller-supplied idempotency key.
pub const IDEMPOTENCY_FIELD: &str = "idempotency_key";
/// Local-only marker set once a record is confirmed by the remote service.
pub const SYNCED_FIELD: &str = "synced";

/// How a successful replay landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The mutation was applied by this replay.
    Applied,
    /// The remote service already held the mutation.
    AlreadyApplied,
}

/// Everything a handler may touch.
#[derive(Clone)]
pub struct ReplayContext {
    pub store: LocalStore,
    pub remote: Arc<dyn RemoteService>,
    pub status: Arc<DerivedStatusCache>,
}

/// Replays one queued action against the remote service.
#[async_trait]
pub trait ReplayHandler: Send + Sync {
    /// Action name this handler is registered under.
    fn action(&self) -> &'static str;

    /// Whether a successful replay invalidates the dependent aggregates.
    fn is_transactional(&self) -> bool {
        false
    }

    async fn replay(&self, payload: &Value, ctx: &ReplayContext) -> Result<ReplayOutcome, ReplayError>;
}

/// Maps action names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<&'static str, Arc<dyn ReplayHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in visit, order, and generic record handlers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(RecordVisitHandler));
        registry.register(Arc::new(CreateOrderHandler));
        registry.register(Arc::new(UpdateRecordHandler));
        registry.register(Arc::new(DeleteRecordHandler));
        registry
    }

    /// Registers a handler, replacing any previous one for the same action.
    pub fn register(&mut self, handler: Arc<dyn ReplayHandler>) -> Option<Arc<dyn ReplayHandler>> {
        self.handlers.insert(handler.action(), handler)
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn ReplayHandler>> {
        self.handlers.get(action).cloned()
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<&'static str> {
        let mut actions: Vec<_> = self.handlers.keys().copied().collect();
        actions.sort_unstable();
        actions
    }
}

/// Prepares a row for an upstream call: drops the local `id` and the synced
/// marker, and rewrites string fields holding locally-minted ids to the
/// canonical id they were promoted to. Ids not promoted yet are stripped.
pub async fn resolve_foreign_keys(store: &LocalStore, row: &mut Map<String, Value>) -> StorageResult<()> {
    row.remove("id");
    row.remove(SYNCED_FIELD);

    let local_fields: Vec<(String, LocalId)> = row
        .iter()
        .filter_map(|(field, value)| {
            let raw = value.as_str().filter(|s| RecordId::is_local_key(s))?;
            raw.parse::<LocalId>().ok().map(|id| (field.clone(), id))
        })
        .collect();

    for (field, local) in local_fields {
        match store.resolve_local(local).await? {
            Some(remote) => {
                row.insert(field, Value::String(remote.to_string()));
            }
            None => {
                debug!("Stripping unsynced reference {}={}", field, local);
                row.remove(&field);
            }
        }
    }
    Ok(())
}

/// Returns the first remote row whose `key_field` equals `key`.
pub async fn find_by_key(
    remote: &dyn RemoteService,
    collection: &str,
    key_field: &str,
    key: &str,
) -> Result<Option<Value>, RemoteError> {
    let filter = Filter::new().eq(key_field, key);
    Ok(remote.select(collection, &filter).await?.into_iter().next())
}

/// Inserts `row` unless a row with the same idempotency key already exists.
/// A uniqueness violation on insert is read as an earlier attempt that
/// landed.
pub async fn insert_idempotent(
    remote: &dyn RemoteService,
    collection: &str,
    key: &str,
    mut row: Map<String, Value>,
) -> Result<(Value, ReplayOutcome), ReplayError> {
    if let Some(existing) = find_by_key(remote, collection, IDEMPOTENCY_FIELD, key).await? {
        debug!("{} with key {} already exists remotely", collection, key);
        return Ok((existing, ReplayOutcome::AlreadyApplied));
    }

    row.insert(IDEMPOTENCY_FIELD.to_string(), Value::String(key.to_string()));
    match remote.insert(collection, Value::Object(row)).await {
        Ok(stored) => Ok((stored, ReplayOutcome::Applied)),
        Err(RemoteError::Conflict(detail)) => {
            debug!("Insert into {} hit uniqueness violation for key {}", collection, key);
            match find_by_key(remote, collection, IDEMPOTENCY_FIELD, key).await? {
                Some(existing) => Ok((existing, ReplayOutcome::AlreadyApplied)),
                None => Err(RemoteError::Conflict(detail).into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Canonical id of a row returned by the remote service.
pub fn stored_id(row: &Value, collection: &str) -> Result<RemoteId, ReplayError> {
    row_id(row).ok_or_else(|| {
        RemoteError::Validation(format!("{collection} row returned without a canonical id")).into()
    })
}

/// Supersedes the local record `local` with the stored remote row.
///
/// The local payload is kept and marked synced. Fields only the stored row
/// carries (server defaults, the idempotency key) are added, and references
/// to locally-minted ids take the stored canonical value. Other local fields
/// are never overwritten. When the local record is gone, only the id mapping is
/// written.
pub async fn promote_local(
    store: &LocalStore,
    collection: &str,
    local: LocalId,
    remote: RemoteId,
    stored: &Value,
) -> StorageResult<()> {
    let existing: Option<Record> = store.get_by_id(collection, &RecordId::Local(local)).await?;
    let Some(existing) = existing else {
        return store.record_promotion(collection, local, remote).await;
    };

    let mut data = match existing.data {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Value::Object(fields) = stored {
        for (field, value) in fields {
            let keep_local = data
                .get(field)
                .is_some_and(|local| !local.as_str().is_some_and(RecordId::is_local_key));
            if !keep_local {
                data.insert(field.clone(), value.clone());
            }
        }
    }
    data.insert(SYNCED_FIELD.to_string(), Value::Bool(true));

    let promoted = Record::new(RecordId::Remote(remote), Value::Object(data));
    store.promote(collection, local, &promoted).await
}

/// Whether a queued item still creates the record minted as `local`, i.e.
/// carries it as its `local_id`.
pub async fn create_queued(store: &LocalStore, local: LocalId) -> StorageResult<bool> {
    let target = RecordId::Local(local);
    Ok(store.queue_items().await?.iter().any(|item| {
        item.payload
            .get("local_id")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse::<RecordId>().ok())
            == Some(target)
    }))
}
