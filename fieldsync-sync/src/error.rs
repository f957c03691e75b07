//! Error types for the sync layer.

use fieldsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Local storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Remote service error.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors surfaced by the remote service boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network failure, timeout, or 5xx. Worth retrying.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// Uniqueness violation: the mutation already landed.
    #[error("uniqueness violation: {0}")]
    Conflict(String),

    /// Payload rejected by the remote schema.
    #[error("rejected by remote: {0}")]
    Validation(String),

    /// The addressed record does not exist remotely.
    #[error("not found: {0}")]
    NotFound(String),
}

impl RemoteError {
    /// Normalized code used in logs and `last_error`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Conflict(_) => "conflict",
            Self::Validation(_) => "validation",
            Self::NotFound(_) => "not_found",
        }
    }
}

/// Errors returned by a replay handler.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A referenced record has not been promoted to a canonical id yet.
    #[error("dependency not synced yet: {0}")]
    DependencyPending(String),

    #[error("no handler registered for action {0}")]
    UnknownAction(String),
}

impl ReplayError {
    /// Normalized code used in logs and `last_error`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Remote(e) => e.code(),
            Self::Storage(_) => "storage",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::DependencyPending(_) => "dependency_pending",
            Self::UnknownAction(_) => "unknown_action",
        }
    }

    /// A uniqueness violation means the mutation already landed.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Remote(RemoteError::Conflict(_)))
    }
}

impl From<serde_json::Error> for ReplayError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidPayload(e.to_string())
    }
}

/// Errors from a connectivity probe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    /// The probe exceeded its deadline.
    #[error("probe timed out")]
    Timeout,

    /// The request could not be completed.
    #[error("probe failed: {0}")]
    Network(String),

    /// The probe resource answered with a non-success status.
    #[error("probe returned HTTP {0}")]
    Status(u16),
}
