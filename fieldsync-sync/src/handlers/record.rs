use super::{
    ReplayContext, ReplayHandler, ReplayOutcome, SYNCED_FIELD, create_queued, resolve_foreign_keys,
};
use crate::error::{RemoteError, ReplayError};
use async_trait::async_trait;
use fieldsync_storage::LocalStore;
use fieldsync_types::{Record, RecordId, RemoteId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

pub const UPDATE_RECORD: &str = "update_record";
pub const DELETE_RECORD: &str = "delete_record";

/// Patch of an existing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecordPayload {
    pub collection: String,
    pub id: RecordId,
    pub changes: Map<String, Value>,
}

/// Removal of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteRecordPayload {
    pub collection: String,
    pub id: RecordId,
}

/// Canonical id for `id`, through the id map for locally-minted ids.
async fn canonical(store: &LocalStore, id: RecordId) -> Result<Option<RemoteId>, ReplayError> {
    match id {
        RecordId::Remote(remote) => Ok(Some(remote)),
        RecordId::Local(local) => Ok(store.resolve_local(local).await?),
    }
}

/// Replays `update_record`. A target that has not been promoted yet is a
/// retryable failure: its create is still queued.
pub struct UpdateRecordHandler;

#[async_trait]
impl ReplayHandler for UpdateRecordHandler {
    fn action(&self) -> &'static str {
        UPDATE_RECORD
    }

    async fn replay(&self, payload: &Value, ctx: &ReplayContext) -> Result<ReplayOutcome, ReplayError> {
        let update: UpdateRecordPayload = serde_json::from_value(payload.clone())?;
        let Some(target) = canonical(&ctx.store, update.id).await? else {
            return Err(ReplayError::DependencyPending(format!(
                "{}/{} has no canonical id yet",
                update.collection, update.id
            )));
        };

        let mut changes = update.changes;
        resolve_foreign_keys(&ctx.store, &mut changes).await?;
        let stored = ctx
            .remote
            .update(&update.collection, target, Value::Object(changes))
            .await?;

        let cached: Option<Record> = ctx
            .store
            .get_by_id(&update.collection, &RecordId::Remote(target))
            .await?;
        if let Some(cached) = cached {
            let mut data = match cached.data {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            if let Value::Object(fields) = stored {
                data.extend(fields);
            }
            data.insert(SYNCED_FIELD.into(), Value::Bool(true));
            ctx.store
                .save(&update.collection, &Record::new(RecordId::Remote(target), Value::Object(data)))
                .await?;
        }

        debug!("Updated {}/{}", update.collection, target);
        Ok(ReplayOutcome::Applied)
    }
}

/// Replays `delete_record`. Deleting a record the remote service never saw,
/// or no longer has, is a success. While the create of a locally-minted
/// target is still queued, the delete waits for it.
pub struct DeleteRecordHandler;

#[async_trait]
impl ReplayHandler for DeleteRecordHandler {
    fn action(&self) -> &'static str {
        DELETE_RECORD
    }

    async fn replay(&self, payload: &Value, ctx: &ReplayContext) -> Result<ReplayOutcome, ReplayError> {
        let delete: DeleteRecordPayload = serde_json::from_value(payload.clone())?;
        let Some(target) = canonical(&ctx.store, delete.id).await? else {
            if let Some(local) = delete.id.as_local() {
                if create_queued(&ctx.store, local).await? {
                    return Err(ReplayError::DependencyPending(format!(
                        "create of {}/{} is still queued",
                        delete.collection, delete.id
                    )));
                }
            }
            debug!("{}/{} never reached the remote service", delete.collection, delete.id);
            return Ok(ReplayOutcome::AlreadyApplied);
        };

        let outcome = match ctx.remote.delete(&delete.collection, target).await {
            Ok(()) => ReplayOutcome::Applied,
            Err(RemoteError::NotFound(_)) => ReplayOutcome::AlreadyApplied,
            Err(e) => return Err(e.into()),
        };
        ctx.store
            .delete(&delete.collection, &RecordId::Remote(target))
            .await?;
        Ok(outcome)
    }
}
