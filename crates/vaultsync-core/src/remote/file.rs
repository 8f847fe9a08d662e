use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{check_write, RemoteChanges, RemoteStore};
use crate::envelope::EncryptedRecord;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::types::{RecordId, RecordType};

const REMOTE_RECORDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("remote_records");
const REMOTE_META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("remote_meta");

const SEQUENCE_KEY: &str = "sequence";

/// One stored envelope and the sequence of the write that stored it
#[derive(Serialize, Deserialize)]
struct StoredEnvelope {
    sequence: u64,
    record: EncryptedRecord,
}

/// Remote store kept in a redb file.
///
/// Stands in for a hosted object store when driving the engine from the
/// command line: two data directories pointed at the same file behave like
/// two devices sharing one account.
#[derive(Clone)]
pub struct FileRemoteStore {
    db: Arc<RwLock<Database>>,
}

impl FileRemoteStore {
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(REMOTE_RECORDS_TABLE)?;
            let _ = write_txn.open_table(REMOTE_META_TABLE)?;
        }
        write_txn.commit()?;

        debug!(path = %path.display(), "Opened file remote store");
        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    fn write(&self, record: &EncryptedRecord) -> SyncResult<Result<(), RemoteError>> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(REMOTE_RECORDS_TABLE)?;
            let key = record.id.to_string();
            let stored = match table.get(key.as_str())? {
                Some(bytes) => Some(postcard::from_bytes::<StoredEnvelope>(bytes.value())?),
                None => None,
            };
            if let Err(conflict) = check_write(stored.as_ref().map(|s| &s.record), record) {
                return Ok(Err(conflict));
            }

            let mut meta = write_txn.open_table(REMOTE_META_TABLE)?;
            let sequence = meta.get(SEQUENCE_KEY)?.map(|v| v.value()).unwrap_or(0) + 1;
            meta.insert(SEQUENCE_KEY, sequence)?;

            let data = postcard::to_allocvec(&StoredEnvelope {
                sequence,
                record: record.clone(),
            })?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(Ok(()))
    }

    fn read_since(&self, record_type: &RecordType, after: u64) -> SyncResult<RemoteChanges> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(REMOTE_RECORDS_TABLE)?;
        let meta = read_txn.open_table(REMOTE_META_TABLE)?;
        let cursor = meta.get(SEQUENCE_KEY)?.map(|v| v.value()).unwrap_or(0);

        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let stored: StoredEnvelope = postcard::from_bytes(value.value())?;
            if stored.sequence > after && &stored.record.record_type == record_type {
                records.push(stored.record);
            }
        }
        records.sort_by_key(|r| r.id);
        Ok(RemoteChanges { records, cursor })
    }

    fn remove(&self, id: &RecordId) -> SyncResult<bool> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(REMOTE_RECORDS_TABLE)?;
            let existed = table.remove(id.to_string().as_str())?.is_some();
            existed
        };
        write_txn.commit()?;
        Ok(removed)
    }
}

fn store_failure(err: SyncError) -> RemoteError {
    RemoteError::Other(err.to_string())
}

#[async_trait]
impl RemoteStore for FileRemoteStore {
    async fn push(&self, record: &EncryptedRecord) -> Result<(), RemoteError> {
        self.write(record).map_err(store_failure)?
    }

    async fn pull_since(
        &self,
        record_type: &RecordType,
        after: u64,
    ) -> Result<RemoteChanges, RemoteError> {
        self.read_since(record_type, after).map_err(store_failure)
    }

    async fn delete(&self, id: &RecordId) -> Result<(), RemoteError> {
        if self.remove(id).map_err(store_failure)? {
            Ok(())
        } else {
            Err(RemoteError::NotFound(id.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record() -> EncryptedRecord {
        EncryptedRecord {
            id: RecordId::new(),
            record_type: RecordType::preference_profile(),
            encrypted_data: vec![1; 16],
            encrypted_metadata: vec![2; 16],
            authentication_tag: vec![3; 32],
            version: 1,
            base_version: 0,
            last_modified: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_push_pull_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("remote.redb");
        let rec = record();

        {
            let store = FileRemoteStore::open(&path).unwrap();
            store.push(&rec).await.unwrap();
        }

        let store = FileRemoteStore::open(&path).unwrap();
        let pulled = store.pull(&RecordType::preference_profile()).await.unwrap();
        assert_eq!(pulled, vec![rec]);
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let dir = TempDir::new().unwrap();
        let store = FileRemoteStore::open(dir.path().join("remote.redb")).unwrap();
        let mut rec = record();
        rec.version = 3;
        store.push(&rec).await.unwrap();

        rec.version = 2;
        assert_eq!(
            store.push(&rec).await,
            Err(RemoteError::WriteConflict {
                record_id: rec.id.0,
                stored_version: 3
            })
        );

        // Newer, but derived from a version the store no longer holds
        rec.version = 5;
        rec.base_version = 2;
        assert_eq!(
            store.push(&rec).await,
            Err(RemoteError::WriteConflict {
                record_id: rec.id.0,
                stored_version: 3
            })
        );

        rec.base_version = 3;
        assert!(store.push(&rec).await.is_ok());
    }

    #[tokio::test]
    async fn test_sequence_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("remote.redb");
        let kind = RecordType::preference_profile();
        let first = record();

        let cursor = {
            let store = FileRemoteStore::open(&path).unwrap();
            store.push(&first).await.unwrap();
            store.pull_since(&kind, 0).await.unwrap().cursor
        };

        let store = FileRemoteStore::open(&path).unwrap();
        let second = record();
        store.push(&second).await.unwrap();
        let changes = store.pull_since(&kind, cursor).await.unwrap();
        assert_eq!(changes.records, vec![second]);
        assert_eq!(changes.cursor, cursor + 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = FileRemoteStore::open(dir.path().join("remote.redb")).unwrap();
        let rec = record();
        store.push(&rec).await.unwrap();

        store.delete(&rec.id).await.unwrap();
        assert_eq!(
            store.delete(&rec.id).await,
            Err(RemoteError::NotFound(rec.id.0))
        );
    }
}
