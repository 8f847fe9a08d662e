//! Persistent local state using redb.
//!
//! This module provides ACID-compliant storage for:
//! - Plaintext records (the CLI's [`LocalStore`])
//! - Wrapped per-record keys
//! - Sync checkpoints per record type, and the stored version each
//!   record last matched
//! - Software device key pairs and the device id

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{SyncError, SyncResult};
use crate::keys::{DeviceKeyId, WrappedKeyStore, WrappedRecordKeys};
use crate::local::{CheckpointStore, LocalStore, SyncCheckpoint};
use crate::types::{DeviceId, Record, RecordId, RecordType};

/// Every table maps a string key to opaque bytes
type BytesTable = TableDefinition<'static, &'static str, &'static [u8]>;

// Table definitions
const LOCAL_RECORDS_TABLE: BytesTable = TableDefinition::new("local_records");
const RECORD_KEYS_TABLE: BytesTable = TableDefinition::new("record_keys");
const CHECKPOINTS_TABLE: BytesTable = TableDefinition::new("checkpoints");
const SYNCED_VERSIONS_TABLE: TableDefinition<&str, u64> = TableDefinition::new("synced_versions");
const DEVICE_KEYS_TABLE: BytesTable = TableDefinition::new("device_keys");
const META_TABLE: BytesTable = TableDefinition::new("meta");

const DEVICE_ID_KEY: &str = "device_id";
const CURRENT_DEVICE_KEY: &str = "current_device_key";

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// Creates the parent directory and every table if missing.
    pub fn new(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(LOCAL_RECORDS_TABLE)?;
            let _ = write_txn.open_table(RECORD_KEYS_TABLE)?;
            let _ = write_txn.open_table(CHECKPOINTS_TABLE)?;
            let _ = write_txn.open_table(SYNCED_VERSIONS_TABLE)?;
            let _ = write_txn.open_table(DEVICE_KEYS_TABLE)?;
            let _ = write_txn.open_table(META_TABLE)?;
        }
        write_txn.commit()?;

        debug!(path = %path.display(), "Opened local storage");
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    fn put(&self, table: BytesTable, key: &str, value: &[u8]) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn fetch(&self, table: BytesTable, key: &str) -> SyncResult<Option<Vec<u8>>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(table)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn remove(&self, table: BytesTable, key: &str) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            table.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn scan(&self, table: BytesTable) -> SyncResult<Vec<(String, Vec<u8>)>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(table)?;

        let mut entries = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            entries.push((key.value().to_string(), value.value().to_vec()));
        }
        Ok(entries)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Device Identity
    // ═══════════════════════════════════════════════════════════════════════

    /// This device's id, created on first call.
    pub fn device_id(&self) -> SyncResult<DeviceId> {
        if let Some(bytes) = self.fetch(META_TABLE, DEVICE_ID_KEY)? {
            let id = Uuid::from_slice(&bytes)
                .map_err(|e| SyncError::Storage(format!("Corrupt device id: {}", e)))?;
            return Ok(DeviceId(id));
        }

        let id = DeviceId::new();
        self.put(META_TABLE, DEVICE_ID_KEY, id.0.as_bytes())?;
        debug!(device_id = %id, "Created device id");
        Ok(id)
    }

    /// Persist a software device secret and mark it current.
    pub fn save_device_secret(&self, key_id: &DeviceKeyId, secret: &[u8; 32]) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut keys = write_txn.open_table(DEVICE_KEYS_TABLE)?;
            keys.insert(key_id.to_hex().as_str(), secret.as_slice())?;
            let mut meta = write_txn.open_table(META_TABLE)?;
            meta.insert(CURRENT_DEVICE_KEY, key_id.0.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Every stored device secret, current and retired.
    pub fn load_device_secrets(&self) -> SyncResult<Vec<(DeviceKeyId, Zeroizing<[u8; 32]>)>> {
        self.scan(DEVICE_KEYS_TABLE)?
            .into_iter()
            .map(|(key, value)| {
                let key_id = DeviceKeyId::from_hex(&key)?;
                let mut secret = Zeroizing::new([0u8; 32]);
                if value.len() != 32 {
                    return Err(SyncError::Storage(format!(
                        "Corrupt device key {}",
                        key_id
                    )));
                }
                secret.copy_from_slice(&value);
                Ok((key_id, secret))
            })
            .collect()
    }

    /// Delete a retired device secret.
    pub fn remove_device_secret(&self, key_id: &DeviceKeyId) -> SyncResult<()> {
        self.remove(DEVICE_KEYS_TABLE, &key_id.to_hex())
    }

    pub fn current_device_key(&self) -> SyncResult<Option<DeviceKeyId>> {
        match self.fetch(META_TABLE, CURRENT_DEVICE_KEY)? {
            Some(bytes) => {
                let id: [u8; 16] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| SyncError::Storage("Corrupt current device key".into()))?;
                Ok(Some(DeviceKeyId(id)))
            }
            None => Ok(None),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Record Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Number of stored records of one type, tombstones excluded.
    pub fn live_count(&self, record_type: &RecordType) -> SyncResult<usize> {
        Ok(self.all(record_type)?.iter().filter(|r| !r.deleted).count())
    }
}

impl LocalStore for Storage {
    fn get(&self, id: &RecordId) -> SyncResult<Option<Record>> {
        match self.fetch(LOCAL_RECORDS_TABLE, &id.to_string())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn all(&self, record_type: &RecordType) -> SyncResult<Vec<Record>> {
        let mut records = Vec::new();
        for (_, bytes) in self.scan(LOCAL_RECORDS_TABLE)? {
            let record: Record = serde_json::from_slice(&bytes)?;
            if &record.record_type == record_type {
                records.push(record);
            }
        }
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    fn apply(&self, record: &Record) -> SyncResult<()> {
        let data = serde_json::to_vec(record)?;
        self.put(LOCAL_RECORDS_TABLE, &record.id.to_string(), &data)
    }
}

impl CheckpointStore for Storage {
    fn load_checkpoint(&self, record_type: &RecordType) -> SyncResult<SyncCheckpoint> {
        match self.fetch(CHECKPOINTS_TABLE, record_type.as_str())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(SyncCheckpoint::default()),
        }
    }

    fn save_checkpoint(
        &self,
        record_type: &RecordType,
        checkpoint: &SyncCheckpoint,
    ) -> SyncResult<()> {
        let data = serde_json::to_vec(checkpoint)?;
        self.put(CHECKPOINTS_TABLE, record_type.as_str(), &data)
    }

    fn synced_version(&self, id: &RecordId) -> SyncResult<Option<u64>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SYNCED_VERSIONS_TABLE)?;
        let version = table.get(id.to_string().as_str())?.map(|v| v.value());
        Ok(version)
    }

    fn set_synced_version(&self, id: &RecordId, version: u64) -> SyncResult<()> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SYNCED_VERSIONS_TABLE)?;
            table.insert(id.to_string().as_str(), version)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl WrappedKeyStore for Storage {
    fn load_wrapped(&self, id: &RecordId) -> SyncResult<Option<WrappedRecordKeys>> {
        match self.fetch(RECORD_KEYS_TABLE, &id.to_string())? {
            Some(bytes) => Ok(Some(WrappedRecordKeys::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_wrapped(&self, id: &RecordId, keys: &WrappedRecordKeys) -> SyncResult<()> {
        self.put(RECORD_KEYS_TABLE, &id.to_string(), &keys.to_bytes()?)
    }

    fn remove_wrapped(&self, id: &RecordId) -> SyncResult<()> {
        self.remove(RECORD_KEYS_TABLE, &id.to_string())
    }

    fn list_wrapped(&self) -> SyncResult<Vec<(RecordId, WrappedRecordKeys)>> {
        let mut all = Vec::new();
        for (key, bytes) in self.scan(RECORD_KEYS_TABLE)? {
            let id = RecordId::parse(&key)
                .map_err(|e| SyncError::Storage(format!("Corrupt record key id: {}", e)))?;
            all.push((id, WrappedRecordKeys::from_bytes(&bytes)?));
        }
        all.sort_by_key(|(id, _)| *id);
        Ok(all)
    }
}
