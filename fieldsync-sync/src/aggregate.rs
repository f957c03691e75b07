//! Aggregates derived from transactional records, recomputed once per drain.

use crate::error::SyncResult;
use crate::handlers::{ReplayContext, SYNCED_FIELD, VISITS};
use async_trait::async_trait;
use fieldsync_types::time::{date_key, today};
use fieldsync_types::{Record, StatusKey, WorkStatus};
use serde_json::json;

/// A value computed over many records that goes stale when a transactional
/// item syncs.
#[async_trait]
pub trait DependentAggregate: Send + Sync {
    fn name(&self) -> &'static str;

    async fn recompute(&self, ctx: &ReplayContext) -> SyncResult<()>;
}

/// Today's visit progress for one user, written to the status cache under
/// `progress:<user>:<date>` as `{completed, pending}`.
pub struct DailyVisitProgress {
    user_id: String,
}

impl DailyVisitProgress {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn status_key(&self, date: &str) -> StatusKey {
        StatusKey::new(["progress", self.user_id.as_str(), date])
    }
}

#[async_trait]
impl DependentAggregate for DailyVisitProgress {
    fn name(&self) -> &'static str {
        "daily_visit_progress"
    }

    async fn recompute(&self, ctx: &ReplayContext) -> SyncResult<()> {
        let date = date_key(today());
        let visits: Vec<Record> = ctx.store.get_all(VISITS).await?;

        let (mut completed, mut pending) = (0u64, 0u64);
        for visit in visits.iter().filter(|v| {
            v.get_str("/user_id") == Some(self.user_id.as_str())
                && v.get_str("/visit_date") == Some(date.as_str())
                && v.has_value("/outcome")
        }) {
            if visit.id.is_remote() || visit.get_bool(&format!("/{SYNCED_FIELD}")) == Some(true) {
                completed += 1;
            } else {
                pending += 1;
            }
        }

        let status = if pending == 0 {
            WorkStatus::Completed
        } else {
            WorkStatus::Pending
        };
        ctx.status
            .set(
                self.status_key(&date),
                status,
                Some(json!({ "completed": completed, "pending": pending })),
                None,
            )
            .await;
        Ok(())
    }
}
