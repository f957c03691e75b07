//! Remote service boundary.
//!
//! Collections are addressed by name. Rows travel as JSON objects carrying
//! their canonical id in an `id` field.

pub mod memory;
mod rest;

pub use rest::{RemoteConfig, RestRemote};

use crate::error::RemoteError;
use async_trait::async_trait;
use fieldsync_types::RemoteId;
use serde_json::Value;
use std::cmp::Ordering;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// The system of record, as seen by the sync engine.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Returns the rows of `collection` matching every condition of `filter`.
    async fn select(&self, collection: &str, filter: &Filter) -> RemoteResult<Vec<Value>>;

    /// Inserts a row and returns it as stored, including its canonical id.
    async fn insert(&self, collection: &str, row: Value) -> RemoteResult<Value>;

    /// Patches a row and returns it as stored.
    async fn update(&self, collection: &str, id: RemoteId, patch: Value) -> RemoteResult<Value>;

    async fn delete(&self, collection: &str, id: RemoteId) -> RemoteResult<()>;
}

/// A single predicate on a row field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(String, Value),
    Gte(String, Value),
    Lte(String, Value),
}

/// A conjunction of predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(field.into(), value.into()));
        self
    }

    pub fn gte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Gte(field.into(), value.into()));
        self
    }

    pub fn lte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Lte(field.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    /// Evaluates the filter against a row.
    pub fn matches(&self, row: &Value) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(field, expected) => row.get(field).is_some_and(|v| loose_eq(v, expected)),
            Condition::Gte(field, bound) => row
                .get(field)
                .and_then(|v| compare(v, bound))
                .is_some_and(|o| o != Ordering::Less),
            Condition::Lte(field, bound) => row
                .get(field)
                .and_then(|v| compare(v, bound))
                .is_some_and(|o| o != Ordering::Greater),
        })
    }

    /// Query-string form (`field=op.value`).
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        self.conditions
            .iter()
            .map(|condition| match condition {
                Condition::Eq(field, v) => (field.clone(), format!("eq.{}", scalar(v))),
                Condition::Gte(field, v) => (field.clone(), format!("gte.{}", scalar(v))),
                Condition::Lte(field, v) => (field.clone(), format!("lte.{}", scalar(v))),
            })
            .collect()
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn loose_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => actual == expected,
    }
}

fn compare(actual: &Value, bound: &Value) -> Option<Ordering> {
    match (actual, bound) {
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        _ => None,
    }
}

/// Canonical id carried by a row, if any.
pub fn row_id(row: &Value) -> Option<RemoteId> {
    row.get("id")
        .and_then(Value::as_str)
        .and_then(|s| RemoteId::parse(s).ok())
}
