//! Rebuilds queue items that local state says should exist but the queue
//! lost (app killed between the local write and the enqueue, queue cleared
//! by a re-login, and so on).

use crate::error::SyncResult;
use crate::handlers::{RECORD_VISIT, SYNCED_FIELD, VISITS, VisitPayload};
use async_trait::async_trait;
use fieldsync_storage::LocalStore;
use fieldsync_types::{NewQueueItem, QueueItem, Record};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Scans local collections for mutations missing from the queue.
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Items to enqueue, given the drain's queue snapshot (items discarded by
    /// this drain included). Running this twice over the same state must not
    /// yield the same item twice, and an item the discard policy dropped must
    /// never come back.
    async fn missing_items(&self, store: &LocalStore, queue: &[QueueItem]) -> SyncResult<Vec<NewQueueItem>>;
}

/// Re-queues visit outcomes that were recorded locally but never synced.
///
/// Deduplicates by the visit's natural key (customer, user, date), so at most
/// one `record_visit` is queued per key. Keys with a dead-lettered
/// `record_visit` are never re-queued. An idempotency key stored on the
/// record is carried into the synthesized payload.
pub struct VisitOutcomeReconciler;

impl VisitOutcomeReconciler {
    fn needs_sync(record: &Record) -> bool {
        record.is_pending()
            && record.has_value("/outcome")
            && record.get_bool(&format!("/{SYNCED_FIELD}")) != Some(true)
    }
}

#[async_trait]
impl Reconciler for VisitOutcomeReconciler {
    fn name(&self) -> &'static str {
        "visit_outcome"
    }

    async fn missing_items(&self, store: &LocalStore, queue: &[QueueItem]) -> SyncResult<Vec<NewQueueItem>> {
        let dead = store.dead_letters().await?;
        let mut queued: HashSet<String> = queue
            .iter()
            .chain(dead.iter().map(|letter| &letter.item))
            .filter_map(visit_key)
            .collect();

        let records: Vec<Record> = store.get_all(VISITS).await?;
        let mut missing = Vec::new();
        for record in records.iter().filter(|r| Self::needs_sync(r)) {
            let payload = match VisitPayload::from_record(record) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Skipping unsyncable visit {}: {}", record.id, e);
                    continue;
                }
            };
            if !queued.insert(payload.natural_key()) {
                continue;
            }
            debug!("Re-queueing visit {}", payload.natural_key());
            missing.push(NewQueueItem::new(RECORD_VISIT, serde_json::to_value(&payload)?));
        }
        Ok(missing)
    }
}

/// Natural key of a queued `record_visit`.
fn visit_key(item: &QueueItem) -> Option<String> {
    if item.action != RECORD_VISIT {
        return None;
    }
    serde_json::from_value::<VisitPayload>(item.payload.clone())
        .ok()
        .map(|payload| payload.natural_key())
}
