//! Device-side collaborators: plaintext record storage and sync checkpoints
//!
//! The orchestrator only talks to these traits. [`Storage`](crate::storage::Storage)
//! implements both on redb; the memory versions here back unit and scenario
//! tests.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::types::{Record, RecordId, RecordType};

/// Plaintext record storage owned by the app.
pub trait LocalStore: Send + Sync {
    fn get(&self, id: &RecordId) -> SyncResult<Option<Record>>;

    /// Every record of one type, tombstones included, sorted by id.
    fn all(&self, record_type: &RecordType) -> SyncResult<Vec<Record>>;

    /// Records of one type modified after `since` (all when `None`).
    fn changed_since(
        &self,
        record_type: &RecordType,
        since: Option<DateTime<Utc>>,
    ) -> SyncResult<Vec<Record>> {
        Ok(self
            .all(record_type)?
            .into_iter()
            .filter(|r| since.map_or(true, |t| r.last_modified > t))
            .collect())
    }

    /// Insert or replace a record.
    fn apply(&self, record: &Record) -> SyncResult<()>;
}

/// Outcome of the last successful cycle for one record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub record_count: u64,
    /// Remote store sequence the next incremental pull starts after
    #[serde(default)]
    pub remote_cursor: u64,
}

/// Persistence for [`SyncCheckpoint`]s and per-record sync bases.
pub trait CheckpointStore: Send + Sync {
    /// The stored checkpoint, or the empty one before the first sync.
    fn load_checkpoint(&self, record_type: &RecordType) -> SyncResult<SyncCheckpoint>;
    fn save_checkpoint(&self, record_type: &RecordType, checkpoint: &SyncCheckpoint)
        -> SyncResult<()>;

    /// Stored version the local copy of `id` last matched, if any.
    fn synced_version(&self, id: &RecordId) -> SyncResult<Option<u64>>;
    fn set_synced_version(&self, id: &RecordId, version: u64) -> SyncResult<()>;
}

/// In-memory [`LocalStore`]
#[derive(Default)]
pub struct MemoryLocalStore {
    records: RwLock<HashMap<RecordId, Record>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, id: &RecordId) -> SyncResult<Option<Record>> {
        Ok(self.records.read().get(id).cloned())
    }

    fn all(&self, record_type: &RecordType) -> SyncResult<Vec<Record>> {
        let mut records: Vec<Record> = self
            .records
            .read()
            .values()
            .filter(|r| &r.record_type == record_type)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    fn apply(&self, record: &Record) -> SyncResult<()> {
        self.records.write().insert(record.id, record.clone());
        Ok(())
    }
}

/// In-memory [`CheckpointStore`]
#[derive(Default)]
pub struct MemoryCheckpoints {
    checkpoints: RwLock<HashMap<RecordType, SyncCheckpoint>>,
    synced: RwLock<HashMap<RecordId, u64>>,
}

impl MemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointStore for MemoryCheckpoints {
    fn load_checkpoint(&self, record_type: &RecordType) -> SyncResult<SyncCheckpoint> {
        Ok(self
            .checkpoints
            .read()
            .get(record_type)
            .copied()
            .unwrap_or_default())
    }

    fn save_checkpoint(
        &self,
        record_type: &RecordType,
        checkpoint: &SyncCheckpoint,
    ) -> SyncResult<()> {
        self.checkpoints
            .write()
            .insert(record_type.clone(), *checkpoint);
        Ok(())
    }

    fn synced_version(&self, id: &RecordId) -> SyncResult<Option<u64>> {
        Ok(self.synced.read().get(id).copied())
    }

    fn set_synced_version(&self, id: &RecordId, version: u64) -> SyncResult<()> {
        self.synced.write().insert(*id, version);
        Ok(())
    }
}
