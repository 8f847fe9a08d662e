//! Remote object store seam
//!
//! The remote store only ever sees [`EncryptedRecord`]s: ciphertext plus the
//! routing fields `id`, `record_type`, `version`, `base_version` and
//! `last_modified`.
//!
//! - [`RemoteStore`] is the collaborator trait a backend implements.
//! - [`RemoteAdapter`] wraps a store, reports per-item progress for batches
//!   and lifts failures into [`SyncError::Remote`] unchanged. It never
//!   retries; retry policy belongs to the orchestrator.
//!
//! Writes are compare-and-swap on the stored version, and every accepted
//! write takes the next value of a store-wide sequence. Incremental pulls
//! follow that sequence rather than record timestamps, so a resolution
//! that keeps an older `last_modified` still reaches every device.

mod file;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::envelope::EncryptedRecord;
use crate::error::{RemoteError, SyncResult};
use crate::types::{Progress, RecordId, RecordType};

pub use file::FileRemoteStore;
pub use memory::MemoryRemoteStore;

/// Records the store accepted after a cursor, and the cursor to resume from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteChanges {
    pub records: Vec<EncryptedRecord>,
    /// Store sequence at the time of the read
    pub cursor: u64,
}

/// Opaque CRUD over encrypted records keyed by id and type.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Store a record. Fails with `WriteConflict` when a stored copy exists
    /// whose version is not `record.base_version`, or is not older than
    /// `record.version`.
    async fn push(&self, record: &EncryptedRecord) -> Result<(), RemoteError>;

    /// Records of one type written after sequence `after`. Cursor 0 reads
    /// every record of the type.
    async fn pull_since(
        &self,
        record_type: &RecordType,
        after: u64,
    ) -> Result<RemoteChanges, RemoteError>;

    /// Every record of one type.
    async fn pull(&self, record_type: &RecordType) -> Result<Vec<EncryptedRecord>, RemoteError> {
        Ok(self.pull_since(record_type, 0).await?.records)
    }

    async fn delete(&self, id: &RecordId) -> Result<(), RemoteError>;
}

/// Version rule shared by the bundled stores. A record with no stored copy
/// is always accepted.
pub(crate) fn check_write(
    stored: Option<&EncryptedRecord>,
    incoming: &EncryptedRecord,
) -> Result<(), RemoteError> {
    match stored {
        Some(existing)
            if existing.version != incoming.base_version
                || existing.version >= incoming.version =>
        {
            Err(RemoteError::WriteConflict {
                record_id: incoming.id.0,
                stored_version: existing.version,
            })
        }
        _ => Ok(()),
    }
}

/// Result of pushing a batch.
#[derive(Debug, Default)]
pub struct PushReport {
    /// Records the store accepted
    pub pushed: Vec<RecordId>,
    /// Records the store rejected, with the store's reason
    pub failed: Vec<(RecordId, RemoteError)>,
    /// Records not attempted because the store became unreachable
    pub skipped: Vec<RecordId>,
}

impl PushReport {
    /// The unavailability that cut the batch short, if any.
    pub fn unavailable(&self) -> Option<&RemoteError> {
        self.failed
            .iter()
            .map(|(_, e)| e)
            .find(|e| matches!(e, RemoteError::Unavailable(_)))
    }
}

/// Progress-reporting wrapper over a [`RemoteStore`].
#[derive(Clone)]
pub struct RemoteAdapter {
    store: Arc<dyn RemoteStore>,
}

impl RemoteAdapter {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }

    pub async fn push(&self, record: &EncryptedRecord) -> SyncResult<()> {
        Ok(self.store.push(record).await?)
    }

    pub async fn pull(&self, record_type: &RecordType) -> SyncResult<Vec<EncryptedRecord>> {
        Ok(self.store.pull(record_type).await?)
    }

    pub async fn pull_since(
        &self,
        record_type: &RecordType,
        after: u64,
    ) -> SyncResult<RemoteChanges> {
        Ok(self.store.pull_since(record_type, after).await?)
    }

    pub async fn delete(&self, id: &RecordId) -> SyncResult<()> {
        Ok(self.store.delete(id).await?)
    }

    /// Push records one by one, reporting progress after each.
    ///
    /// Rejections are collected and the batch continues; an `Unavailable`
    /// failure stops the batch and the rest are reported as skipped.
    pub async fn push_batch<F>(&self, records: &[EncryptedRecord], mut on_progress: F) -> PushReport
    where
        F: FnMut(Progress) + Send,
    {
        let total = records.len();
        let mut report = PushReport::default();

        for (index, record) in records.iter().enumerate() {
            match self.store.push(record).await {
                Ok(()) => report.pushed.push(record.id),
                Err(err) => {
                    debug!(record_id = %record.id, error = %err, "Remote rejected record");
                    let stop = matches!(err, RemoteError::Unavailable(_));
                    report.failed.push((record.id, err));
                    if stop {
                        report
                            .skipped
                            .extend(records[index + 1..].iter().map(|r| r.id));
                        break;
                    }
                }
            }
            on_progress(Progress::new(index + 1, total));
        }

        report
    }

    /// Pull one type from `after` (0 for everything). Progress starts at
    /// zero of the received count; the caller advances it as records are
    /// opened.
    pub async fn pull_batch<F>(
        &self,
        record_type: &RecordType,
        after: u64,
        mut on_progress: F,
    ) -> SyncResult<RemoteChanges>
    where
        F: FnMut(Progress) + Send,
    {
        let changes = self.store.pull_since(record_type, after).await?;
        debug!(%record_type, after, received = changes.records.len(), cursor = changes.cursor, "Pulled records");
        on_progress(Progress::new(0, changes.records.len()));
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use chrono::Utc;

    fn record(version: u64) -> EncryptedRecord {
        EncryptedRecord {
            id: RecordId::new(),
            record_type: RecordType::collection_item(),
            encrypted_data: vec![1, 2, 3],
            encrypted_metadata: vec![4, 5],
            authentication_tag: vec![0; 32],
            version,
            base_version: version - 1,
            last_modified: Utc::now(),
        }
    }

    #[test]
    fn test_check_write() {
        let stored = record(2);
        let mut newer = stored.clone();
        newer.version = 3;
        newer.base_version = 2;
        let mut same = newer.clone();
        same.version = 2;

        assert!(check_write(None, &stored).is_ok());
        assert!(check_write(Some(&stored), &newer).is_ok());
        assert_eq!(
            check_write(Some(&stored), &same),
            Err(RemoteError::WriteConflict {
                record_id: stored.id.0,
                stored_version: 2
            })
        );
    }

    #[test]
    fn test_check_write_rejects_stale_base() {
        // Two edits on a copy of v1 while another device stored v2
        let stored = record(2);
        let mut ahead = stored.clone();
        ahead.version = 3;
        ahead.base_version = 1;

        assert_eq!(
            check_write(Some(&stored), &ahead),
            Err(RemoteError::WriteConflict {
                record_id: stored.id.0,
                stored_version: 2
            })
        );
    }

    #[tokio::test]
    async fn test_push_batch_reports_each_item() {
        let store = Arc::new(MemoryRemoteStore::new());
        let adapter = RemoteAdapter::new(store.clone());
        let batch = vec![record(1), record(1), record(1)];

        let mut seen = Vec::new();
        let report = adapter.push_batch(&batch, |p| seen.push(p)).await;

        assert_eq!(report.pushed.len(), 3);
        assert!(report.failed.is_empty());
        assert_eq!(
            seen,
            vec![Progress::new(1, 3), Progress::new(2, 3), Progress::new(3, 3)]
        );
    }

    #[tokio::test]
    async fn test_push_batch_continues_past_conflict() {
        let store = Arc::new(MemoryRemoteStore::new());
        let adapter = RemoteAdapter::new(store.clone());
        let existing = record(5);
        adapter.push(&existing).await.unwrap();

        let mut stale = existing.clone();
        stale.version = 6;
        stale.base_version = 3;
        let fresh = record(1);

        let report = adapter.push_batch(&[stale, fresh.clone()], |_| {}).await;
        assert_eq!(report.pushed, vec![fresh.id]);
        assert!(matches!(
            report.failed[0].1,
            RemoteError::WriteConflict { stored_version: 5, .. }
        ));
        assert!(report.unavailable().is_none());
    }

    #[tokio::test]
    async fn test_push_batch_stops_when_unavailable() {
        let store = Arc::new(MemoryRemoteStore::new());
        let adapter = RemoteAdapter::new(store.clone());
        store.set_offline(true);

        let batch = vec![record(1), record(1), record(1)];
        let report = adapter.push_batch(&batch, |_| {}).await;

        assert!(report.pushed.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.skipped.len(), 2);
        assert!(report.unavailable().is_some());
    }

    #[tokio::test]
    async fn test_errors_surface_verbatim() {
        let store = Arc::new(MemoryRemoteStore::new());
        let adapter = RemoteAdapter::new(store.clone());
        store.inject_failure(RemoteError::Quota("100 MB".into()));

        let err = adapter.push(&record(1)).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::Quota(ref m)) if m == "100 MB"));
        assert_eq!(store.push_attempts(), 1);
    }

    #[tokio::test]
    async fn test_pull_batch_progress() {
        let store = Arc::new(MemoryRemoteStore::new());
        let adapter = RemoteAdapter::new(store.clone());
        adapter.push(&record(1)).await.unwrap();
        adapter.push(&record(1)).await.unwrap();

        let mut seen = Vec::new();
        let pulled = adapter
            .pull_batch(&RecordType::collection_item(), 0, |p| seen.push(p))
            .await
            .unwrap();
        assert_eq!(pulled.records.len(), 2);
        assert_eq!(pulled.cursor, 2);
        assert_eq!(seen, vec![Progress::new(0, 2)]);
    }

    #[tokio::test]
    async fn test_pull_since_follows_store_sequence() {
        let store = Arc::new(MemoryRemoteStore::new());
        let adapter = RemoteAdapter::new(store.clone());
        let kind = RecordType::collection_item();
        let first = record(1);
        adapter.push(&first).await.unwrap();
        let cursor = adapter.pull_since(&kind, 0).await.unwrap().cursor;

        // Rewritten later but carrying an older timestamp
        let mut resolved = first.clone();
        resolved.version = 2;
        resolved.base_version = 1;
        resolved.last_modified = first.last_modified - chrono::Duration::hours(1);
        adapter.push(&resolved).await.unwrap();

        let changes = adapter.pull_since(&kind, cursor).await.unwrap();
        assert_eq!(changes.records, vec![resolved]);
        assert!(changes.cursor > cursor);
        assert!(adapter
            .pull_since(&kind, changes.cursor)
            .await
            .unwrap()
            .records
            .is_empty());
    }
}
