use crate::ids::RecordId;
use crate::time::now_millis;
use serde::{Deserialize, Serialize};

/// A domain entity held in a local collection.
///
/// `data` is the collaborator's payload. The engine only looks inside it
/// through the JSON accessors on `Record<serde_json::Value>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record<T = serde_json::Value> {
    pub id: RecordId,
    pub data: T,
    /// Milliseconds since Unix epoch of the last local write.
    pub updated_at: i64,
}

impl<T> Record<T> {
    /// Creates a record with an explicit id.
    pub fn new(id: RecordId, data: T) -> Self {
        Self {
            id,
            data,
            updated_at: now_millis(),
        }
    }

    /// Creates a record for data captured offline, with a locally-minted id.
    pub fn new_local(data: T) -> Self {
        Self::new(RecordId::mint(), data)
    }

    /// Whether the record still waits for a canonical id.
    pub fn is_pending(&self) -> bool {
        self.id.is_local()
    }

    /// Replaces the payload, bumping `updated_at`.
    pub fn with_data<U>(self, data: U) -> Record<U> {
        Record {
            id: self.id,
            data,
            updated_at: now_millis(),
        }
    }
}

impl Record<serde_json::Value> {
    /// Extract a string value from `data` using a JSON pointer (e.g., "/customer_id").
    pub fn get_str(&self, pointer: &str) -> Option<&str> {
        self.data.pointer(pointer).and_then(|v| v.as_str())
    }

    /// Extract a boolean value from `data` using a JSON pointer.
    pub fn get_bool(&self, pointer: &str) -> Option<bool> {
        self.data.pointer(pointer).and_then(|v| v.as_bool())
    }

    /// Whether `data` holds a non-null value at `pointer`.
    pub fn has_value(&self, pointer: &str) -> bool {
        self.data.pointer(pointer).is_some_and(|v| !v.is_null())
    }
}
