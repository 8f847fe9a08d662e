use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::{check_write, RemoteChanges, RemoteStore};
use crate::envelope::EncryptedRecord;
use crate::error::RemoteError;
use crate::types::{RecordId, RecordType};

/// In-memory remote store with fault injection.
///
/// `set_offline(true)` makes every call fail with `Unavailable`; queued
/// failures from [`inject_failure`](Self::inject_failure) are returned by the
/// next calls in order, before the store is consulted.
#[derive(Default)]
pub struct MemoryRemoteStore {
    shelf: RwLock<Shelf>,
    offline: AtomicBool,
    failures: Mutex<VecDeque<RemoteError>>,
    push_attempts: AtomicUsize,
    pull_attempts: AtomicUsize,
}

/// Stored records, each with the sequence of the write that stored it
#[derive(Default)]
struct Shelf {
    sequence: u64,
    records: HashMap<RecordId, (u64, EncryptedRecord)>,
}

impl Shelf {
    fn store(&mut self, record: EncryptedRecord) {
        self.sequence += 1;
        self.records.insert(record.id, (self.sequence, record));
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Queue a failure for the next call.
    pub fn inject_failure(&self, error: RemoteError) {
        self.failures.lock().push_back(error);
    }

    /// Stored copy of one record.
    pub fn get(&self, id: &RecordId) -> Option<EncryptedRecord> {
        self.shelf.read().records.get(id).map(|(_, r)| r.clone())
    }

    /// Overwrite a record without the version check (another device's write
    /// or on-store tampering).
    pub fn put_raw(&self, record: EncryptedRecord) {
        self.shelf.write().store(record);
    }

    pub fn len(&self) -> usize {
        self.shelf.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shelf.read().records.is_empty()
    }

    pub fn push_attempts(&self) -> usize {
        self.push_attempts.load(Ordering::SeqCst)
    }

    pub fn pull_attempts(&self) -> usize {
        self.pull_attempts.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<(), RemoteError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("remote store offline".into()));
        }
        match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn push(&self, record: &EncryptedRecord) -> Result<(), RemoteError> {
        self.push_attempts.fetch_add(1, Ordering::SeqCst);
        self.gate()?;

        let mut shelf = self.shelf.write();
        check_write(shelf.records.get(&record.id).map(|(_, r)| r), record)?;
        shelf.store(record.clone());
        Ok(())
    }

    async fn pull_since(
        &self,
        record_type: &RecordType,
        after: u64,
    ) -> Result<RemoteChanges, RemoteError> {
        self.pull_attempts.fetch_add(1, Ordering::SeqCst);
        self.gate()?;

        let shelf = self.shelf.read();
        let mut records: Vec<EncryptedRecord> = shelf
            .records
            .values()
            .filter(|(seq, r)| *seq > after && &r.record_type == record_type)
            .map(|(_, r)| r.clone())
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(RemoteChanges {
            records,
            cursor: shelf.sequence,
        })
    }

    async fn delete(&self, id: &RecordId) -> Result<(), RemoteError> {
        self.gate()?;
        match self.shelf.write().records.remove(id) {
            Some(_) => Ok(()),
            None => Err(RemoteError::NotFound(id.0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn record(record_type: RecordType) -> EncryptedRecord {
        EncryptedRecord {
            id: RecordId::new(),
            record_type,
            encrypted_data: vec![9; 40],
            encrypted_metadata: vec![8; 40],
            authentication_tag: vec![0; 32],
            version: 1,
            base_version: 0,
            last_modified: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_pull_filters_by_type() {
        let store = MemoryRemoteStore::new();
        store.push(&record(RecordType::collection_item())).await.unwrap();
        store.push(&record(RecordType::vault_item())).await.unwrap();

        let items = store.pull(&RecordType::collection_item()).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_pull_since_ignores_timestamps() {
        let store = MemoryRemoteStore::new();
        let kind = RecordType::collection_item();
        let mut old = record(kind.clone());
        old.last_modified = Utc::now() - Duration::days(3);
        store.push(&old).await.unwrap();
        let cursor = store.pull_since(&kind, 0).await.unwrap().cursor;

        // Written after the cursor even though its timestamp is older
        let mut late = record(kind.clone());
        late.last_modified = old.last_modified - Duration::days(1);
        store.put_raw(late.clone());

        let changes = store.pull_since(&kind, cursor).await.unwrap();
        assert_eq!(changes.records, vec![late]);
        assert_eq!(changes.cursor, 2);
    }

    #[tokio::test]
    async fn test_offline_and_injected_failures() {
        let store = MemoryRemoteStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.pull(&RecordType::vault_item()).await,
            Err(RemoteError::Unavailable(_))
        ));
        store.set_offline(false);

        store.inject_failure(RemoteError::Other("503".into()));
        assert!(store.pull(&RecordType::vault_item()).await.is_err());
        assert!(store.pull(&RecordType::vault_item()).await.is_ok());
        assert_eq!(store.pull_attempts(), 3);
    }

    #[tokio::test]
    async fn test_delete_missing() {
        let store = MemoryRemoteStore::new();
        let id = RecordId::new();
        assert_eq!(store.delete(&id).await, Err(RemoteError::NotFound(id.0)));
    }
}
