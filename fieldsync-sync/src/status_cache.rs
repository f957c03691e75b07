//! Keyed cache of computed work outcomes.
//!
//! Not a source of truth: every entry can be rebuilt from the local store and
//! the remote service. Writers publish `StatusChanged` so views refresh from
//! the cache instead of re-deriving from raw records.

use crate::events::{EventBus, SyncEvent};
use fieldsync_types::{DerivedStatus, StatusKey, WorkStatus};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

pub struct DerivedStatusCache {
    entries: RwLock<HashMap<StatusKey, DerivedStatus>>,
    events: EventBus,
}

impl DerivedStatusCache {
    pub fn new(events: EventBus) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Writes an entry and broadcasts the change.
    pub async fn set(
        &self,
        key: StatusKey,
        status: WorkStatus,
        value: Option<Value>,
        reason_code: Option<String>,
    ) -> DerivedStatus {
        let mut entry = DerivedStatus::new(key.clone(), status);
        entry.value = value;
        entry.reason_code = reason_code;

        self.entries.write().await.insert(key.clone(), entry.clone());
        debug!("Status {} -> {:?}", key, status);
        self.events.publish(SyncEvent::StatusChanged(key));
        entry
    }

    pub async fn get(&self, key: &StatusKey) -> Option<DerivedStatus> {
        self.entries.read().await.get(key).cloned()
    }

    /// All entries, ordered by key.
    pub async fn all(&self) -> Vec<DerivedStatus> {
        let mut entries: Vec<DerivedStatus> = self.entries.read().await.values().cloned().collect();
        entries.sort_by(|a, b| a.entity_key.cmp(&b.entity_key));
        entries
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drops every entry. Only called on session reset.
    pub async fn reset(&self) {
        self.entries.write().await.clear();
    }
}
