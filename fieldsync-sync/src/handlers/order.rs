use super::visit::{find_pending_visit, natural_key, visit_queued};
use super::{
    IDEMPOTENCY_FIELD, ORDERS, ReplayContext, ReplayHandler, ReplayOutcome, VISITS, find_by_key,
    VisitPayload, insert_idempotent, promote_local, resolve_foreign_keys, stored_id,
};
use crate::error::ReplayError;
use crate::remote::Filter;
use async_trait::async_trait;
use fieldsync_types::{Record, RecordId, RemoteId, StatusKey, WorkStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

pub const CREATE_ORDER: &str = "create_order";

/// Outcome given to a parent visit created on behalf of an order that has no
/// local visit record to take it from.
const ORDER_OUTCOME: &str = "order";

/// An order taken during a visit. The parent visit may not be synced yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<RecordId>,
    pub customer_id: String,
    pub user_id: String,
    pub visit_date: String,
    /// Parent visit, canonical or locally-minted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visit_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl OrderPayload {
    /// The caller-supplied key, falling back to the local record id.
    pub fn idempotency_key(&self) -> Result<String, ReplayError> {
        self.idempotency_key
            .clone()
            .or_else(|| self.local_id.map(|id| format!("order:{id}")))
            .ok_or_else(|| ReplayError::InvalidPayload("order without idempotency key".into()))
    }
}

/// Replays `create_order`, creating the parent visit first when the remote
/// service does not know it yet.
pub struct CreateOrderHandler;

impl CreateOrderHandler {
    /// Resolves the canonical id of the parent visit, creating it from the
    /// local parent record when the remote service does not know it yet.
    ///
    /// A parent whose own `record_visit` is still queued is left to that
    /// item: the order waits instead of creating the visit first.
    async fn resolve_parent(&self, order: &OrderPayload, ctx: &ReplayContext) -> Result<RemoteId, ReplayError> {
        let natural = natural_key(&order.customer_id, &order.user_id, &order.visit_date);
        let local_parent = match order.visit_id {
            Some(RecordId::Remote(id)) => return Ok(id),
            Some(RecordId::Local(local)) => {
                if let Some(id) = ctx.store.resolve_local(local).await? {
                    return Ok(id);
                }
                Some(local)
            }
            None => None,
        };

        if visit_queued(&ctx.store, &natural).await? {
            return Err(ReplayError::DependencyPending(format!(
                "visit {natural} is still queued"
            )));
        }

        let parent_record: Option<Record> = match local_parent {
            Some(local) => ctx.store.get_by_id(VISITS, &RecordId::Local(local)).await?,
            None => find_pending_visit(&ctx.store, &natural).await?,
        };
        let local_parent = local_parent.or_else(|| parent_record.as_ref().and_then(|r| r.id.as_local()));

        let filter = Filter::new()
            .eq("customer_id", order.customer_id.as_str())
            .eq("user_id", order.user_id.as_str())
            .eq("visit_date", order.visit_date.as_str());
        if let Some(existing) = ctx.remote.select(VISITS, &filter).await?.into_iter().next() {
            let id = stored_id(&existing, VISITS)?;
            if let Some(local) = local_parent {
                promote_local(&ctx.store, VISITS, local, id, &existing).await?;
            }
            return Ok(id);
        }

        let parent = parent_record
            .as_ref()
            .and_then(|record| VisitPayload::from_record(record).ok());
        let (key, mut row, reason_code) = match &parent {
            Some(visit) => (visit.idempotency_key(), visit.to_row(), visit.reason_code.clone()),
            None => (format!("visit:{natural}"), Map::new(), None),
        };
        row.entry("customer_id").or_insert_with(|| json!(order.customer_id));
        row.entry("user_id").or_insert_with(|| json!(order.user_id));
        row.entry("visit_date").or_insert_with(|| json!(order.visit_date));
        let outcome = row
            .entry("outcome")
            .or_insert_with(|| json!(ORDER_OUTCOME))
            .clone();
        resolve_foreign_keys(&ctx.store, &mut row).await?;

        let (stored, inserted) = insert_idempotent(ctx.remote.as_ref(), VISITS, &key, row).await?;
        let id = stored_id(&stored, VISITS)?;
        debug!("Parent visit {} resolved as {} ({:?})", key, id, inserted);

        if let Some(local) = local_parent {
            promote_local(&ctx.store, VISITS, local, id, &stored).await?;
        }
        if inserted == ReplayOutcome::Applied {
            ctx.status
                .set(
                    StatusKey::visit(&order.customer_id, &order.user_id, &order.visit_date),
                    WorkStatus::Completed,
                    Some(json!({ "visit_id": id, "outcome": outcome })),
                    reason_code,
                )
                .await;
        }
        Ok(id)
    }
}

#[async_trait]
impl ReplayHandler for CreateOrderHandler {
    fn action(&self) -> &'static str {
        CREATE_ORDER
    }

    fn is_transactional(&self) -> bool {
        true
    }

    async fn replay(&self, payload: &Value, ctx: &ReplayContext) -> Result<ReplayOutcome, ReplayError> {
        let order: OrderPayload = serde_json::from_value(payload.clone())?;
        let key = order.idempotency_key()?;

        let (stored, outcome) = match find_by_key(ctx.remote.as_ref(), ORDERS, IDEMPOTENCY_FIELD, &key).await? {
            Some(existing) => (existing, ReplayOutcome::AlreadyApplied),
            None => {
                let visit_id = self.resolve_parent(&order, ctx).await?;

                let mut row = order.fields.clone();
                resolve_foreign_keys(&ctx.store, &mut row).await?;
                row.insert("customer_id".into(), json!(order.customer_id));
                row.insert("user_id".into(), json!(order.user_id));
                row.insert("visit_date".into(), json!(order.visit_date));
                row.insert("visit_id".into(), json!(visit_id));
                insert_idempotent(ctx.remote.as_ref(), ORDERS, &key, row).await?
            }
        };
        let order_id = stored_id(&stored, ORDERS)?;

        if let Some(local) = order.local_id.and_then(|id| id.as_local()) {
            promote_local(&ctx.store, ORDERS, local, order_id, &stored).await?;
        }

        ctx.status
            .set(
                StatusKey::new(["order", key.as_str()]),
                WorkStatus::Completed,
                Some(json!({ "order_id": order_id })),
                None,
            )
            .await;

        info!("Order {} synced as {} ({:?})", key, order_id, outcome);
        Ok(outcome)
    }
}
