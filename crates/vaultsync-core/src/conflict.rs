//! Conflict detection and resolution
//!
//! Runs on decrypted records only. Detection pairs local and remote records
//! by id and classifies every real divergence:
//!
//! | Divergence                          | Kind               | Automatic? |
//! |-------------------------------------|--------------------|------------|
//! | one side deleted, other modified    | `DeletionConflict` | never      |
//! | differing `schema_version`          | `SchemaConflict`   | never      |
//! | anything else                       | `DataConflict`     | newest wins|
//!
//! Every resolution produces a record that supersedes both sides:
//! `version = max(local, remote) + 1` and `last_modified = max(local, remote)`,
//! so resolving the same conflict twice yields the same record.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SyncResult;
use crate::types::{Record, RecordId, RecordType};

/// How two versions of a record diverge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    DataConflict,
    DeletionConflict,
    SchemaConflict,
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::DataConflict => write!(f, "data"),
            ConflictKind::DeletionConflict => write!(f, "deletion"),
            ConflictKind::SchemaConflict => write!(f, "schema"),
        }
    }
}

/// Two diverging versions of one record, both decrypted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: Uuid,
    pub record_id: RecordId,
    pub record_type: RecordType,
    pub local_version: DateTime<Utc>,
    pub remote_version: DateTime<Utc>,
    pub kind: ConflictKind,
    pub local: Record,
    pub remote: Record,
}

impl SyncConflict {
    fn new(local: &Record, remote: &Record, kind: ConflictKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_id: local.id,
            record_type: local.record_type.clone(),
            local_version: local.last_modified,
            remote_version: remote.last_modified,
            kind,
            local: local.clone(),
            remote: remote.clone(),
        }
    }

    /// Whether automatic last-write-wins may settle this conflict.
    pub fn auto_resolvable(&self) -> bool {
        self.kind == ConflictKind::DataConflict
    }
}

/// Manual (or automatic) resolution decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionChoice {
    UseLocal,
    UseRemote,
    Merge,
}

impl std::str::FromStr for ResolutionChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" | "use-local" => Ok(ResolutionChoice::UseLocal),
            "remote" | "use-remote" => Ok(ResolutionChoice::UseRemote),
            "merge" => Ok(ResolutionChoice::Merge),
            other => Err(format!("unknown resolution '{}'", other)),
        }
    }
}

/// Field-level merge for one record type.
pub trait MergeRule: Send + Sync {
    /// Merge two bodies. `newer` is the side with the later modification.
    fn merge(&self, older: &Value, newer: &Value) -> Value;

    fn name(&self) -> &'static str;
}

/// Union of the listed array fields, newer side wins everything else.
///
/// Used for collection items, whose `tags` and `colors` only grow.
pub struct SetUnionMerge {
    fields: Vec<String>,
}

impl SetUnionMerge {
    pub fn new(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl MergeRule for SetUnionMerge {
    fn merge(&self, older: &Value, newer: &Value) -> Value {
        let (Some(old), Some(new)) = (as_object(older), as_object(newer)) else {
            return newer.clone();
        };

        let mut merged = old.clone();
        for (key, value) in &new {
            merged.insert(key.clone(), value.clone());
        }

        for field in &self.fields {
            let mut union: Vec<Value> = Vec::new();
            for side in [old.get(field), new.get(field)] {
                if let Some(Value::Array(items)) = side {
                    for item in items {
                        if !union.contains(item) {
                            union.push(item.clone());
                        }
                    }
                }
            }
            if !union.is_empty() {
                merged.insert(field.clone(), Value::Array(union));
            }
        }

        Value::Object(merged)
    }

    fn name(&self) -> &'static str {
        "set_union"
    }
}

/// Key-wise union of objects, recursing into nested objects; the newer side
/// wins per key.
pub struct KeyUnionMerge;

impl MergeRule for KeyUnionMerge {
    fn merge(&self, older: &Value, newer: &Value) -> Value {
        merge_objects(older, newer)
    }

    fn name(&self) -> &'static str {
        "key_union"
    }
}

fn merge_objects(older: &Value, newer: &Value) -> Value {
    match (older, newer) {
        (Value::Object(old), Value::Object(new)) => {
            let mut merged = old.clone();
            for (key, value) in new {
                let next = match old.get(key) {
                    Some(existing) => merge_objects(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (Value::Null, new) => new.clone(),
        (old, Value::Null) => old.clone(),
        (_, new) => new.clone(),
    }
}

// A tombstone's null body merges as an empty object.
fn as_object(value: &Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map.clone()),
        Value::Null => Some(Map::new()),
        _ => None,
    }
}

/// Merge rules keyed by record type
#[derive(Clone, Default)]
pub struct MergeRegistry {
    rules: HashMap<RecordType, Arc<dyn MergeRule>>,
}

impl MergeRegistry {
    /// Registry with no rules; every merge falls back to the remote side.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with the built-in rules for collection items and
    /// preference profiles.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(
            RecordType::collection_item(),
            SetUnionMerge::new(["tags", "colors"]),
        );
        registry.register(RecordType::preference_profile(), KeyUnionMerge);
        registry
    }

    pub fn register(&mut self, record_type: RecordType, rule: impl MergeRule + 'static) {
        self.rules.insert(record_type, Arc::new(rule));
    }

    pub fn get(&self, record_type: &RecordType) -> Option<&Arc<dyn MergeRule>> {
        self.rules.get(record_type)
    }
}

/// Compares decrypted versions and settles conflicts.
#[derive(Clone)]
pub struct ConflictResolver {
    registry: MergeRegistry,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(MergeRegistry::with_defaults())
    }
}

impl ConflictResolver {
    pub fn new(registry: MergeRegistry) -> Self {
        Self { registry }
    }

    /// Conflicts between two record sets, sorted by record id.
    ///
    /// Swapping the arguments reports the same record ids and kinds.
    pub fn detect(&self, local: &[Record], remote: &[Record]) -> Vec<SyncConflict> {
        let remote_by_id: HashMap<RecordId, &Record> = remote.iter().map(|r| (r.id, r)).collect();

        let mut conflicts: Vec<SyncConflict> = local
            .iter()
            .filter_map(|l| {
                let r = remote_by_id.get(&l.id)?;
                classify(l, r).map(|kind| SyncConflict::new(l, r, kind))
            })
            .collect();

        conflicts.sort_by_key(|c| c.record_id);
        debug!(conflicts = conflicts.len(), "Conflict detection finished");
        conflicts
    }

    /// Last-write-wins for data conflicts; `None` for anything needing a person.
    pub fn auto_resolve(&self, conflict: &SyncConflict) -> Option<Record> {
        if !conflict.auto_resolvable() {
            return None;
        }
        let choice = if remote_is_newer(&conflict.local, &conflict.remote) {
            ResolutionChoice::UseRemote
        } else {
            ResolutionChoice::UseLocal
        };
        Some(self.settle(conflict, choice))
    }

    /// Apply a resolution choice.
    pub fn resolve(&self, conflict: &SyncConflict, choice: ResolutionChoice) -> SyncResult<Record> {
        Ok(self.settle(conflict, choice))
    }

    fn settle(&self, conflict: &SyncConflict, choice: ResolutionChoice) -> Record {
        let local = &conflict.local;
        let remote = &conflict.remote;

        let mut resolved = match choice {
            ResolutionChoice::UseLocal => local.clone(),
            ResolutionChoice::UseRemote => remote.clone(),
            ResolutionChoice::Merge => match self.registry.get(&conflict.record_type) {
                Some(rule) => {
                    let (older, newer) = if remote_is_newer(local, remote) {
                        (local, remote)
                    } else {
                        (remote, local)
                    };
                    let mut merged = newer.clone();
                    merged.body = rule.merge(&older.body, &newer.body);
                    merged.deleted = false;
                    merged.schema_version = local.schema_version.max(remote.schema_version);
                    debug!(record_id = %conflict.record_id, rule = rule.name(), "Merged record");
                    merged
                }
                None => {
                    warn!(
                        record_id = %conflict.record_id,
                        record_type = %conflict.record_type,
                        "No merge rule for record type, using remote version"
                    );
                    remote.clone()
                }
            },
        };

        resolved.version = local.version.max(remote.version) + 1;
        resolved.last_modified = local.last_modified.max(remote.last_modified);
        resolved
    }
}

fn classify(local: &Record, remote: &Record) -> Option<ConflictKind> {
    let diverged = local.version != remote.version || local.last_modified != remote.last_modified;
    if !diverged || local.same_content(remote) {
        return None;
    }
    if local.deleted != remote.deleted {
        Some(ConflictKind::DeletionConflict)
    } else if local.schema_version != remote.schema_version {
        Some(ConflictKind::SchemaConflict)
    } else {
        Some(ConflictKind::DataConflict)
    }
}

// Later modification wins; ties go to the higher version, then to remote.
fn remote_is_newer(local: &Record, remote: &Record) -> bool {
    (remote.last_modified, remote.version) >= (local.last_modified, local.version)
}
