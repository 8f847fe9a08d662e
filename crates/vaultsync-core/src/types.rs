//! Core types for Vaultsync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a synced record
///
/// Stable across devices; the only plaintext identifier the remote store sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    /// Create a new random RecordId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Parse from the hyphenated string form
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the device that produced a record version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    /// Create a new random DeviceId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device_{}", &self.0.simple().to_string()[..8])
    }
}

/// Kind of synced record, sent to the remote store as routing metadata.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordType(String);

impl RecordType {
    /// Wardrobe/collection entries (garments, accessories)
    pub const COLLECTION_ITEM: &'static str = "collection_item";
    /// Style and sizing preferences
    pub const PREFERENCE_PROFILE: &'static str = "preference_profile";
    /// Opaque vault contents
    pub const VAULT_ITEM: &'static str = "vault_item";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn collection_item() -> Self {
        Self::new(Self::COLLECTION_ITEM)
    }

    pub fn preference_profile() -> Self {
        Self::new(Self::PREFERENCE_PROFILE)
    }

    pub fn vault_item() -> Self {
        Self::new(Self::VAULT_ITEM)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A decrypted record as held by the device.
///
/// `body` is the type-specific payload; its shape is only interpreted by
/// merge rules. A deleted record is kept as a tombstone with a null body so
/// deletions propagate and can be detected as conflicts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub record_type: RecordType,
    /// Monotonic per-record version counter
    pub version: u64,
    pub last_modified: DateTime<Utc>,
    /// Version of the body layout for this record type
    pub schema_version: u32,
    pub deleted: bool,
    pub body: serde_json::Value,
}

impl Record {
    /// Create version 1 of a new record
    pub fn new(record_type: RecordType, body: serde_json::Value) -> Self {
        Self {
            id: RecordId::new(),
            record_type,
            version: 1,
            last_modified: Utc::now(),
            schema_version: 1,
            deleted: false,
            body,
        }
    }

    /// Produce the next version with a new body
    pub fn updated(&self, body: serde_json::Value) -> Self {
        Self {
            version: self.version + 1,
            last_modified: Utc::now(),
            deleted: false,
            body,
            ..self.clone()
        }
    }

    /// Produce the next version as a tombstone
    pub fn tombstone(&self) -> Self {
        Self {
            version: self.version + 1,
            last_modified: Utc::now(),
            deleted: true,
            body: serde_json::Value::Null,
            ..self.clone()
        }
    }

    /// Whether two versions carry the same user-visible content.
    pub fn same_content(&self, other: &Record) -> bool {
        self.deleted == other.deleted
            && self.schema_version == other.schema_version
            && self.body == other.body
    }

    /// Serialize the body for sealing.
    pub fn encode_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&BodyEnvelope {
            schema_version: self.schema_version,
            deleted: self.deleted,
            body: &self.body,
        })
    }

    /// Rebuild a record from opened envelope parts.
    pub fn decode_body(
        id: RecordId,
        record_type: RecordType,
        version: u64,
        last_modified: DateTime<Utc>,
        bytes: &[u8],
    ) -> Result<Self, serde_json::Error> {
        let parsed: OwnedBodyEnvelope = serde_json::from_slice(bytes)?;
        Ok(Self {
            id,
            record_type,
            version,
            last_modified,
            schema_version: parsed.schema_version,
            deleted: parsed.deleted,
            body: parsed.body,
        })
    }
}

#[derive(Serialize)]
struct BodyEnvelope<'a> {
    schema_version: u32,
    deleted: bool,
    body: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct OwnedBodyEnvelope {
    schema_version: u32,
    deleted: bool,
    body: serde_json::Value,
}

/// Per-item progress of a batch operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

impl Progress {
    pub fn new(completed: usize, total: usize) -> Self {
        Self { completed, total }
    }

    /// Completed share in `[0.0, 1.0]`; an empty batch counts as done.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.completed, self.total)
    }
}
