//! Derived status entries: computed "is this unit of work done, and how".

use crate::time::now_millis;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of a derived status entry, built from its key fields
/// (e.g. `visit:<customer>:<user>:<date>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusKey(String);

impl StatusKey {
    /// Joins the key fields with `:`.
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let parts: Vec<String> = fields.into_iter().map(|s| s.as_ref().to_string()).collect();
        Self(parts.join(":"))
    }

    /// Key of the outcome of a visit to a customer by a user on a date.
    pub fn visit(customer_id: &str, user_id: &str, date: &str) -> Self {
        Self::new(["visit", customer_id, user_id, date])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StatusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome state of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Recorded locally, not yet confirmed by the remote service.
    Pending,
    /// Confirmed by the remote service.
    Completed,
    /// Could not be completed; see `reason_code`.
    Failed,
}

/// A cached, computed outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedStatus {
    pub entity_key: StatusKey,
    pub status: WorkStatus,
    pub value: Option<serde_json::Value>,
    pub reason_code: Option<String>,
    pub last_updated: i64,
}

impl DerivedStatus {
    pub fn new(entity_key: StatusKey, status: WorkStatus) -> Self {
        Self {
            entity_key,
            status,
            value: None,
            reason_code: None,
            last_updated: now_millis(),
        }
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_reason(mut self, reason_code: impl Into<String>) -> Self {
        self.reason_code = Some(reason_code.into());
        self
    }
}
