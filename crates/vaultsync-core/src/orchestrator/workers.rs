//! Per-record sealing and opening, fanned out over blocking workers
//!
//! The envelope codec is stateless, so a batch is spread over
//! `spawn_blocking` tasks bounded by a semaphore and collected in order
//! before the batch counts as done. Cancellation is checked before each
//! record is handed out, never inside an envelope operation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::envelope::{EncryptedRecord, EnvelopeCodec, EnvelopeHeader, SyncMetadata};
use crate::error::{SyncError, SyncResult};
use crate::keys::KeyManager;
use crate::types::{DeviceId, Progress, Record};

pub(crate) fn join_error(e: JoinError) -> SyncError {
    SyncError::InvalidOperation(format!("worker task failed: {}", e))
}

/// Run `work` over every item on the blocking pool, bounded by the
/// `workers` semaphore. Results keep input order; `on_progress` hears
/// about each item as it finishes, in completion order.
pub(crate) async fn fan_out<T, R, F, P>(
    items: Vec<T>,
    workers: &Arc<Semaphore>,
    cancel: &CancellationToken,
    work: F,
    on_progress: P,
) -> SyncResult<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
    P: Fn(Progress) + Send + Sync,
{
    let work = Arc::new(work);
    let total = items.len();
    let completed = AtomicUsize::new(0);
    let (completed, on_progress) = (&completed, &on_progress);

    let tasks = items.into_iter().map(|item| {
        let work = work.clone();
        async move {
            let permit = workers
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| SyncError::InvalidOperation("worker pool closed".into()))?;
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let out = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                work(item)
            })
            .await
            .map_err(join_error)?;

            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            on_progress(Progress::new(done, total));
            Ok(out)
        }
    });

    futures::future::join_all(tasks).await.into_iter().collect()
}

/// Encrypt one record under its (possibly new) record keys, as a write
/// replacing stored version `base_version`.
pub(crate) fn seal_record(
    codec: &EnvelopeCodec,
    keys: &KeyManager,
    device_id: DeviceId,
    record: &Record,
    base_version: u64,
) -> SyncResult<EncryptedRecord> {
    let record_keys = keys.ensure_record_keys(&record.id)?;
    let body = record.encode_body()?;
    let metadata = SyncMetadata {
        record_type: record.record_type.clone(),
        version: record.version,
        size_bytes: body.len() as u64,
        timestamp: record.last_modified,
        device_id,
    };
    let header = EnvelopeHeader {
        id: record.id,
        record_type: record.record_type.clone(),
        version: record.version,
        base_version,
        last_modified: record.last_modified,
    };
    codec.encrypt(header, &body, &metadata, &record_keys)
}

/// Verify and decrypt one envelope, then let the key manager re-wrap its
/// keys if they are still under a retired device key.
pub(crate) fn open_record(
    codec: &EnvelopeCodec,
    keys: &KeyManager,
    envelope: &EncryptedRecord,
) -> SyncResult<Record> {
    let record_keys = keys.record_keys(&envelope.id)?;
    let (plaintext, metadata) = codec.decrypt(envelope, &record_keys)?;

    // Routing fields are plaintext on the store; the sealed copies are
    // authoritative.
    if metadata.record_type != envelope.record_type
        || metadata.version != envelope.version
        || metadata.timestamp != envelope.last_modified
    {
        return Err(SyncError::AuthenticationFailed(envelope.id.to_string()));
    }

    let record = Record::decode_body(
        envelope.id,
        envelope.record_type.clone(),
        envelope.version,
        envelope.last_modified,
        &plaintext,
    )?;

    if keys.confirm_decrypted(&envelope.id)? {
        debug!(record_id = %envelope.id, "Record keys migrated to current device key");
    }
    Ok(record)
}
