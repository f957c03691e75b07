//! In-memory remote service for tests and offline demos.
//!
//! Enforces per-collection unique keys so idempotent replay can be checked
//! against the same uniqueness signal the real service raises.

use super::{Filter, RemoteResult, RemoteService, row_id};
use crate::error::RemoteError;
use async_trait::async_trait;
use fieldsync_types::RemoteId;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct InMemoryRemote {
    tables: Mutex<HashMap<String, Vec<Value>>>,
    unique_keys: Mutex<HashMap<String, Vec<String>>>,
    failures: Mutex<HashMap<String, RemoteError>>,
    latency: Option<Duration>,
    calls: AtomicUsize,
    inserts: AtomicUsize,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares `field` unique within `collection`.
    pub fn with_unique_key(self, collection: &str, field: &str) -> Self {
        self.unique_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(collection.to_string())
            .or_default()
            .push(field.to_string());
        self
    }

    /// Delays every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Inserts rows directly, bypassing counters and unique checks.
    pub fn seed(&self, collection: &str, rows: impl IntoIterator<Item = Value>) {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.entry(collection.to_string()).or_default().extend(rows);
    }

    /// Current rows of a collection.
    pub fn rows(&self, collection: &str) -> Vec<Value> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(collection).cloned().unwrap_or_default()
    }

    /// Makes every call touching `collection` fail with `error`.
    pub fn fail_collection(&self, collection: &str, error: RemoteError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(collection.to_string(), error);
    }

    pub fn heal_collection(&self, collection: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(collection);
    }

    /// Calls received, of any kind.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Insert calls received, including rejected ones.
    pub fn insert_count(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    async fn enter(&self, collection: &str) -> RemoteResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match failures.get(collection) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteService for InMemoryRemote {
    async fn select(&self, collection: &str, filter: &Filter) -> RemoteResult<Vec<Value>> {
        self.enter(collection).await?;
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tables
            .get(collection)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert(&self, collection: &str, mut row: Value) -> RemoteResult<Value> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        self.enter(collection).await?;

        let Some(fields) = row.as_object_mut() else {
            return Err(RemoteError::Validation("row must be an object".to_string()));
        };
        if !fields.get("id").is_some_and(Value::is_string) {
            fields.insert("id".to_string(), Value::String(RemoteId::generate().to_string()));
        }

        let unique = self
            .unique_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(collection)
            .cloned()
            .unwrap_or_default();

        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let rows = tables.entry(collection.to_string()).or_default();
        for field in unique.iter().map(String::as_str).chain(["id"]) {
            let Some(value) = row.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            if rows.iter().any(|r| r.get(field) == Some(value)) {
                return Err(RemoteError::Conflict(format!(
                    "duplicate key value violates unique constraint on {collection}.{field}"
                )));
            }
        }
        rows.push(row.clone());
        Ok(row)
    }

    async fn update(&self, collection: &str, id: RemoteId, patch: Value) -> RemoteResult<Value> {
        self.enter(collection).await?;
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let row = tables
            .get_mut(collection)
            .and_then(|rows| rows.iter_mut().find(|r| row_id(r) == Some(id)))
            .ok_or_else(|| RemoteError::NotFound(format!("{collection}/{id}")))?;

        if let (Some(target), Value::Object(changes)) = (row.as_object_mut(), patch) {
            for (key, value) in changes {
                if key != "id" {
                    target.insert(key, value);
                }
            }
        }
        Ok(row.clone())
    }

    async fn delete(&self, collection: &str, id: RemoteId) -> RemoteResult<()> {
        self.enter(collection).await?;
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let rows = tables
            .get_mut(collection)
            .ok_or_else(|| RemoteError::NotFound(format!("{collection}/{id}")))?;
        let before = rows.len();
        rows.retain(|r| row_id(r) != Some(id));
        if rows.len() == before {
            return Err(RemoteError::NotFound(format!("{collection}/{id}")));
        }
        Ok(())
    }
}
