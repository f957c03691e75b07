//! Cache warming.
//!
//! Pulls owner-scoped reference collections and date-bounded transactional
//! collections into the local store so reads work offline. A local
//! collection is replaced only when its fetch succeeded; a failed fetch
//! leaves the previous copy in place.

use crate::config::WarmerConfig;
use crate::connectivity::ConnectivityState;
use crate::error::SyncResult;
use crate::events::{EventBus, SyncEvent};
use crate::remote::{Filter, RemoteService, row_id};
use chrono::{Days, NaiveDate};
use fieldsync_storage::{LocalStore, META_LAST_FULL_CACHE, META_LAST_WARM};
use fieldsync_types::time::{date_key, now_millis, today};
use fieldsync_types::{Record, RecordId};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// How a step scopes its fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Slow-changing data, limited to active rows.
    Reference {
        #[serde(default)]
        active_field: Option<String>,
    },
    /// Daily work, limited to `today ..= today + days_ahead`. Local records
    /// still waiting for a canonical id survive the replacement.
    Transactional {
        date_field: String,
        #[serde(default)]
        days_ahead: u32,
    },
}

/// One named step of the warming pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarmStep {
    /// Stable id reported to progress callbacks.
    pub id: String,
    pub remote_collection: String,
    pub local_collection: String,
    /// Field that must equal the signed-in user's id.
    #[serde(default)]
    pub owner_field: Option<String>,
    pub kind: StepKind,
}

impl WarmStep {
    pub fn reference(collection: &str) -> Self {
        Self {
            id: collection.to_string(),
            remote_collection: collection.to_string(),
            local_collection: collection.to_string(),
            owner_field: None,
            kind: StepKind::Reference { active_field: None },
        }
    }

    pub fn transactional(collection: &str, date_field: &str, days_ahead: u32) -> Self {
        Self {
            id: collection.to_string(),
            remote_collection: collection.to_string(),
            local_collection: collection.to_string(),
            owner_field: None,
            kind: StepKind::Transactional {
                date_field: date_field.to_string(),
                days_ahead,
            },
        }
    }

    pub fn owned_by(mut self, field: &str) -> Self {
        self.owner_field = Some(field.to_string());
        self
    }

    /// Limits a reference step to rows whose `field` is true.
    pub fn active_when(mut self, field: &str) -> Self {
        if let StepKind::Reference { active_field } = &mut self.kind {
            *active_field = Some(field.to_string());
        }
        self
    }

    /// Pipeline of a field user's day.
    pub fn field_plan() -> Vec<Self> {
        vec![
            Self::reference("customers").active_when("is_active").owned_by("owner_id"),
            Self::reference("products").active_when("is_active"),
            Self::transactional("visit_plans", "plan_date", 6).owned_by("user_id"),
            Self::transactional("visits", "visit_date", 0).owned_by("user_id"),
            Self::transactional("orders", "visit_date", 0).owned_by("user_id"),
        ]
    }

    pub fn is_transactional(&self) -> bool {
        matches!(self.kind, StepKind::Transactional { .. })
    }

    /// Remote filter for this step.
    pub fn filter(&self, owner_id: Option<&str>, today: NaiveDate) -> Filter {
        let mut filter = Filter::new();
        if let (Some(field), Some(owner)) = (&self.owner_field, owner_id) {
            filter = filter.eq(field.as_str(), owner);
        }
        match &self.kind {
            StepKind::Reference { active_field } => {
                if let Some(field) = active_field {
                    filter = filter.eq(field.as_str(), true);
                }
            }
            StepKind::Transactional {
                date_field,
                days_ahead,
            } => {
                let last = today
                    .checked_add_days(Days::new(u64::from(*days_ahead)))
                    .unwrap_or(today);
                filter = filter
                    .gte(date_field.as_str(), date_key(today))
                    .lte(date_field.as_str(), date_key(last));
            }
        }
        filter
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Loading,
    Done,
    Error,
}

/// Progress report for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepProgress {
    pub step_id: String,
    pub status: StepStatus,
    /// Records written, once done.
    pub records: Option<usize>,
    pub error: Option<String>,
}

/// Result of one step within a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSummary {
    pub step_id: String,
    pub records: Option<usize>,
    pub error: Option<String>,
}

/// Counts from one warming pass. Not persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub steps: Vec<StepSummary>,
}

impl SyncSummary {
    /// Steps whose collection was replaced.
    pub fn refreshed(&self) -> usize {
        self.steps.iter().filter(|s| s.error.is_none()).count()
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.error.is_some())
            .map(|s| s.step_id.as_str())
            .collect()
    }

    pub fn total_records(&self) -> usize {
        self.steps.iter().filter_map(|s| s.records).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.error.is_none())
    }

    pub fn records_for(&self, step_id: &str) -> Option<usize> {
        self.steps
            .iter()
            .find(|s| s.step_id == step_id)
            .and_then(|s| s.records)
    }
}

/// Keeps local copies of remote collections fresh.
pub struct CacheWarmer {
    config: WarmerConfig,
    store: LocalStore,
    remote: Arc<dyn RemoteService>,
    events: EventBus,
    owner_id: Option<String>,
    /// One pass at a time.
    pass_lock: Mutex<()>,
}

impl CacheWarmer {
    pub fn new(
        config: WarmerConfig,
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            store,
            remote,
            events,
            owner_id: None,
            pass_lock: Mutex::new(()),
        }
    }

    /// Scopes owner-filtered steps to `owner_id`.
    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn steps(&self) -> &[WarmStep] {
        &self.config.steps
    }

    /// Sequential pass reporting each step as it loads.
    pub async fn full_sync<F>(&self, mut progress: F) -> SyncResult<SyncSummary>
    where
        F: FnMut(StepProgress) + Send,
    {
        let _pass = self.pass_lock.lock().await;
        let today = today();
        let mut summary = SyncSummary::default();

        for step in &self.config.steps {
            progress(StepProgress {
                step_id: step.id.clone(),
                status: StepStatus::Loading,
                records: None,
                error: None,
            });

            let fetched = self.fetch(step, today).await;
            let result = self.apply(step, fetched).await;
            let (status, records, error) = match result {
                Ok(n) => (StepStatus::Done, Some(n), None),
                Err(e) => (StepStatus::Error, None, Some(e)),
            };
            progress(StepProgress {
                step_id: step.id.clone(),
                status,
                records,
                error: error.clone(),
            });
            summary.steps.push(StepSummary {
                step_id: step.id.clone(),
                records,
                error,
            });
        }

        self.finish_pass(&summary).await?;
        Ok(summary)
    }

    /// Best-effort pass with all fetches in flight at once.
    pub async fn refresh_in_background(&self) -> SyncResult<SyncSummary> {
        let _pass = self.pass_lock.lock().await;
        let today = today();

        let fetches = join_all(self.config.steps.iter().map(|step| self.fetch(step, today))).await;

        let mut summary = SyncSummary::default();
        for (step, fetched) in self.config.steps.iter().zip(fetches) {
            let result = self.apply(step, fetched).await;
            summary.steps.push(StepSummary {
                step_id: step.id.clone(),
                records: result.as_ref().ok().copied(),
                error: result.err(),
            });
        }

        self.finish_pass(&summary).await?;
        Ok(summary)
    }

    /// Whether the last full pass is older than the TTL (or never ran).
    pub async fn is_stale(&self) -> SyncResult<bool> {
        let Some(last) = self.store.meta_time(META_LAST_FULL_CACHE).await? else {
            return Ok(true);
        };
        let age = Duration::from_millis(now_millis().saturating_sub(last).max(0) as u64);
        Ok(age >= self.config.ttl())
    }

    /// Runs a full pass only when the cache is stale.
    pub async fn warm_if_stale(&self) -> SyncResult<Option<SyncSummary>> {
        if !self.is_stale().await? {
            debug!("Cache is fresh, skipping warm");
            return Ok(None);
        }
        self.full_sync(|_| {}).await.map(Some)
    }

    /// Refreshes in the background on a fixed interval, skipping ticks while
    /// offline.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        connectivity: watch::Receiver<ConnectivityState>,
    ) -> JoinHandle<()> {
        let warmer = Arc::clone(self);
        tokio::spawn(async move {
            let period = warmer.config.background_interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if connectivity.has_changed().is_err() {
                    break;
                }
                let online = *connectivity.borrow() == ConnectivityState::Online;
                if !online {
                    debug!("Skipping background refresh while offline");
                    continue;
                }
                if let Err(e) = warmer.refresh_in_background().await {
                    warn!("Background refresh failed: {}", e);
                }
            }
        })
    }

    async fn fetch(&self, step: &WarmStep, today: NaiveDate) -> Result<Vec<Value>, String> {
        let filter = step.filter(self.owner_id.as_deref(), today);
        self.remote
            .select(&step.remote_collection, &filter)
            .await
            .map_err(|e| e.to_string())
    }

    /// Replaces the local collection with fetched rows. A failed fetch
    /// returns its error without touching the store.
    async fn apply(&self, step: &WarmStep, fetched: Result<Vec<Value>, String>) -> Result<usize, String> {
        let rows = fetched.map_err(|e| {
            warn!("Warm step {} failed, keeping cached copy: {}", step.id, e);
            e
        })?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match row_id(&row) {
                Some(id) => records.push(Record::new(RecordId::Remote(id), row)),
                None => debug!("Step {}: skipping row without canonical id", step.id),
            }
        }

        self.store
            .replace_collection(&step.local_collection, &records, step.is_transactional())
            .await
            .map_err(|e| {
                warn!("Warm step {} could not be stored: {}", step.id, e);
                e.to_string()
            })
    }

    async fn finish_pass(&self, summary: &SyncSummary) -> SyncResult<()> {
        let now = now_millis();
        self.store.set_meta_time(META_LAST_WARM, now).await?;
        if summary.is_complete() {
            self.store.set_meta_time(META_LAST_FULL_CACHE, now).await?;
        }

        if summary.refreshed() > 0 {
            info!(
                "Warmed {} of {} steps ({} records)",
                summary.refreshed(),
                summary.steps.len(),
                summary.total_records()
            );
            self.events.publish(SyncEvent::ReferenceDataRefreshed(summary.clone()));
        }
        if !summary.is_complete() {
            warn!("Warm steps failed: {:?}", summary.failed_steps());
        }
        Ok(())
    }
}
