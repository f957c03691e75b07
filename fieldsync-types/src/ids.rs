//! Identifier types for records held in local collections.
//!
//! A record is created either with a canonical id issued by the remote system
//! of record, or with a locally-minted id while offline. The two are kept apart
//! in [`RecordId`] so that a temporary id can never be mistaken for a durable
//! one; the only way from one to the other is [`RecordId::promote`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Prefix marking a locally-minted id in its string form.
pub const LOCAL_ID_PREFIX: &str = "local:";

/// Temporary on-device identifier for a record created while offline.
/// Uses UUID v7 so locally-minted ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Mints a new local id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a local id from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LocalId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{LOCAL_ID_PREFIX}{}", self.0)
    }
}

impl FromStr for LocalId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix(LOCAL_ID_PREFIX).unwrap_or(s);
        Ok(Self(Uuid::parse_str(raw)?))
    }
}

/// Canonical identifier issued by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(Uuid);

impl RemoteId {
    /// Creates a remote id from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generates a fresh random id. Used by remote fakes; real canonical ids
    /// come from the server.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Parses a remote id from a string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemoteId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Identifier of a record: either locally-minted or canonical.
///
/// Serialized as a plain string (`local:<uuid>` or `<uuid>`) so that ids can
/// be embedded in JSON payloads and recognised again when they are replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RecordId {
    /// Minted on this device; not known to the remote service.
    Local(LocalId),
    /// Issued by the remote service.
    Remote(RemoteId),
}

impl RecordId {
    /// Mints a fresh local id for a record created offline.
    #[must_use]
    pub fn mint() -> Self {
        Self::Local(LocalId::new())
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    pub fn as_local(&self) -> Option<LocalId> {
        match self {
            Self::Local(id) => Some(*id),
            Self::Remote(_) => None,
        }
    }

    pub fn as_remote(&self) -> Option<RemoteId> {
        match self {
            Self::Remote(id) => Some(*id),
            Self::Local(_) => None,
        }
    }

    /// Promotes a locally-minted id to the canonical id assigned after sync.
    ///
    /// Fails if this id is already canonical: a canonical id is never
    /// replaced.
    pub fn promote(&self, canonical: RemoteId) -> crate::Result<Self> {
        match self {
            Self::Local(_) => Ok(Self::Remote(canonical)),
            Self::Remote(id) => Err(crate::Error::AlreadyCanonical(id.to_string())),
        }
    }

    /// Returns true if `raw` is the string form of a locally-minted id.
    pub fn is_local_key(raw: &str) -> bool {
        raw.starts_with(LOCAL_ID_PREFIX)
    }
}

impl From<LocalId> for RecordId {
    fn from(id: LocalId) -> Self {
        Self::Local(id)
    }
}

impl From<RemoteId> for RecordId {
    fn from(id: RemoteId) -> Self {
        Self::Remote(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(id) => id.fmt(f),
            Self::Remote(id) => id.fmt(f),
        }
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if Self::is_local_key(s) {
            Ok(Self::Local(s.parse()?))
        } else {
            Ok(Self::Remote(s.parse()?))
        }
    }
}

impl TryFrom<String> for RecordId {
    type Error = uuid::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RecordId> for String {
    fn from(id: RecordId) -> Self {
        id.to_string()
    }
}
