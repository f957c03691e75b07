use super::{
    ReplayContext, ReplayHandler, ReplayOutcome, SYNCED_FIELD, VISITS, insert_idempotent,
    promote_local, resolve_foreign_keys, stored_id,
};
use crate::error::ReplayError;
use async_trait::async_trait;
use fieldsync_storage::{LocalStore, StorageResult};
use fieldsync_types::{Record, RecordId, StatusKey, WorkStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::info;

pub const RECORD_VISIT: &str = "record_visit";

/// Outcome of a visit to a customer by a user on a date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitPayload {
    /// Locally-minted id of the visit record, if it was saved locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<RecordId>,
    pub customer_id: String,
    pub user_id: String,
    /// `YYYY-MM-DD`.
    pub visit_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Remaining columns, passed through.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl VisitPayload {
    /// Builds the payload from a locally saved visit record.
    pub fn from_record(record: &Record) -> Result<Self, ReplayError> {
        let mut payload: Self = serde_json::from_value(record.data.clone())?;
        if record.id.is_local() {
            payload.local_id = Some(record.id);
        }
        payload.fields.remove("id");
        payload.fields.remove(SYNCED_FIELD);
        Ok(payload)
    }

    /// `customer:user:date`. At most one visit outcome exists per key.
    pub fn natural_key(&self) -> String {
        natural_key(&self.customer_id, &self.user_id, &self.visit_date)
    }

    /// The caller-supplied key, or one derived from the natural key.
    pub fn idempotency_key(&self) -> String {
        self.idempotency_key
            .clone()
            .unwrap_or_else(|| format!("visit:{}", self.natural_key()))
    }

    pub fn status_key(&self) -> StatusKey {
        StatusKey::visit(&self.customer_id, &self.user_id, &self.visit_date)
    }

    pub(crate) fn to_row(&self) -> Map<String, Value> {
        let mut row = self.fields.clone();
        row.insert("customer_id".into(), json!(self.customer_id));
        row.insert("user_id".into(), json!(self.user_id));
        row.insert("visit_date".into(), json!(self.visit_date));
        if let Some(outcome) = &self.outcome {
            row.insert("outcome".into(), json!(outcome));
        }
        if let Some(reason) = &self.reason_code {
            row.insert("reason_code".into(), json!(reason));
        }
        row
    }
}

pub(crate) fn natural_key(customer_id: &str, user_id: &str, visit_date: &str) -> String {
    format!("{customer_id}:{user_id}:{visit_date}")
}

/// The locally saved visit with `natural` as its key that still waits for a
/// canonical id.
pub(crate) async fn find_pending_visit(store: &LocalStore, natural: &str) -> StorageResult<Option<Record>> {
    let records: Vec<Record> = store.get_all(VISITS).await?;
    Ok(records.into_iter().filter(|r| r.is_pending()).find(|record| {
        VisitPayload::from_record(record).is_ok_and(|payload| payload.natural_key() == natural)
    }))
}

/// Whether a `record_visit` for `natural` is waiting in the queue.
pub(crate) async fn visit_queued(store: &LocalStore, natural: &str) -> StorageResult<bool> {
    Ok(store.queue_items().await?.iter().any(|item| {
        item.action == RECORD_VISIT
            && serde_json::from_value::<VisitPayload>(item.payload.clone())
                .is_ok_and(|payload| payload.natural_key() == natural)
    }))
}

/// Replays `record_visit`.
pub struct RecordVisitHandler;

#[async_trait]
impl ReplayHandler for RecordVisitHandler {
    fn action(&self) -> &'static str {
        RECORD_VISIT
    }

    fn is_transactional(&self) -> bool {
        true
    }

    async fn replay(&self, payload: &Value, ctx: &ReplayContext) -> Result<ReplayOutcome, ReplayError> {
        let visit: VisitPayload = serde_json::from_value(payload.clone())?;
        let key = visit.idempotency_key();

        let mut row = visit.to_row();
        resolve_foreign_keys(&ctx.store, &mut row).await?;
        let (stored, outcome) = insert_idempotent(ctx.remote.as_ref(), VISITS, &key, row).await?;
        let remote_id = stored_id(&stored, VISITS)?;

        let local = match visit.local_id.and_then(|id| id.as_local()) {
            Some(local) => Some(local),
            None => find_pending_visit(&ctx.store, &visit.natural_key())
                .await?
                .and_then(|record| record.id.as_local()),
        };
        if let Some(local) = local {
            promote_local(&ctx.store, VISITS, local, remote_id, &stored).await?;
        }

        ctx.status
            .set(
                visit.status_key(),
                WorkStatus::Completed,
                Some(json!({ "visit_id": remote_id, "outcome": visit.outcome })),
                visit.reason_code.clone(),
            )
            .await;

        info!("Visit {} synced as {} ({:?})", visit.natural_key(), remote_id, outcome);
        Ok(outcome)
    }
}
