//! Sync orchestrator: the state machine composing codec, keys, remote store,
//! conflict resolver and network monitor.
//!
//! ## Cycle
//!
//! ```text
//! request_sync(type)
//!   │  reject if a cycle for `type` is in flight
//!   │  offline? ──▶ Offline, remembered for resume
//!   ▼
//! Syncing ── unlock key session (presence gate)
//!   ▼
//! Uploading(p) ── seal records changed since the checkpoint, push in batches
//!   ▼
//! Syncing ─▶ Downloading(p) ── pull, verify and open envelopes
//!   ▼
//! detect conflicts against local changes and diverged stored copies
//!   ├── data conflicts: newest wins, pushed and applied
//!   └── deletion / schema conflicts: queued
//!   ▼
//! checkpoint ─▶ Resolving (queue not empty) | Completed
//! ```
//!
//! Failures end the cycle in `Error(reason)`, except offline and presence
//! conditions, which pause it (`Offline`, or `Idle` plus a
//! `PresenceRequired` event). Cancellation returns to `Idle`.
//!
//! When the network monitor reports a return to `Online` after `Offline`,
//! the orchestrator moves to `Idle` and runs exactly one incremental cycle
//! per record type that was waiting.

mod events;
mod workers;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncSettings;
use crate::conflict::{ConflictResolver, ResolutionChoice, SyncConflict};
use crate::envelope::{EncryptedRecord, EnvelopeCodec};
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::keys::{DevicePublicKey, KeyManager};
use crate::local::{CheckpointStore, LocalStore, SyncCheckpoint};
use crate::network::{NetworkMonitor, Reachability};
use crate::remote::{RemoteAdapter, RemoteChanges, RemoteStore};
use crate::types::{DeviceId, Progress, Record, RecordId, RecordType};

pub use events::{SyncEvent, SyncStatus};
use workers::{fan_out, join_error, open_record, seal_record};

/// Capacity of the event broadcast channel
const EVENT_CAPACITY: usize = 256;

/// Which remote changes a cycle pulls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Every remote record of the type
    Full,
    /// Only records the store accepted since the last successful sync
    Incremental,
}

/// Summary of one finished cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub record_type: RecordType,
    pub mode: SyncMode,
    /// Records accepted by the remote store
    pub uploaded: usize,
    /// Remote records applied locally without conflict
    pub downloaded: usize,
    pub auto_resolved: usize,
    /// Conflicts waiting for a manual decision after this cycle
    pub queued: usize,
    /// Remote records without key material on this device
    pub skipped: usize,
}

impl SyncReport {
    fn new(record_type: RecordType, mode: SyncMode) -> Self {
        Self {
            record_type,
            mode,
            uploaded: 0,
            downloaded: 0,
            auto_resolved: 0,
            queued: 0,
            skipped: 0,
        }
    }
}

/// Builder for [`SyncOrchestrator`]
pub struct SyncOrchestratorBuilder {
    keys: Arc<KeyManager>,
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    settings: SyncSettings,
    resolver: ConflictResolver,
    device_id: DeviceId,
}

impl SyncOrchestratorBuilder {
    pub fn settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn resolver(mut self, resolver: ConflictResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn device_id(mut self, device_id: DeviceId) -> Self {
        self.device_id = device_id;
        self
    }

    pub fn build(self) -> SyncOrchestrator {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let workers = Arc::new(Semaphore::new(self.settings.worker_count.max(1)));
        SyncOrchestrator {
            inner: Arc::new(Inner {
                codec: EnvelopeCodec::new(),
                keys: self.keys,
                remote: RemoteAdapter::new(self.remote),
                resolver: self.resolver,
                local: self.local,
                checkpoints: self.checkpoints,
                device_id: self.device_id,
                settings: self.settings,
                status: RwLock::new(SyncStatus::Idle),
                events,
                conflicts: Mutex::new(Vec::new()),
                in_flight: Mutex::new(HashMap::new()),
                online: AtomicBool::new(true),
                known_types: Mutex::new(HashSet::new()),
                resume: Mutex::new(HashSet::new()),
                workers,
            }),
        }
    }
}

/// Public contract consumed by the presentation layer.
///
/// Cheap to clone; clones share one state machine.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl SyncOrchestrator {
    pub fn builder(
        keys: Arc<KeyManager>,
        remote: Arc<dyn RemoteStore>,
        local: Arc<dyn LocalStore>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> SyncOrchestratorBuilder {
        SyncOrchestratorBuilder {
            keys,
            remote,
            local,
            checkpoints,
            settings: SyncSettings::default(),
            resolver: ConflictResolver::default(),
            device_id: DeviceId::new(),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.inner.keys
    }

    pub fn device_id(&self) -> DeviceId {
        self.inner.device_id
    }

    /// Run a full sync cycle for one record type on the caller's task.
    pub async fn request_sync(&self, record_type: RecordType) -> SyncResult<SyncReport> {
        self.inner.run_cycle(record_type, SyncMode::Full).await
    }

    /// Run an incremental cycle (records the store accepted since the
    /// last successful sync).
    pub async fn request_incremental_sync(&self, record_type: RecordType) -> SyncResult<SyncReport> {
        self.inner.run_cycle(record_type, SyncMode::Incremental).await
    }

    /// Cancel every in-flight cycle at its next record boundary.
    pub fn cancel(&self) {
        let in_flight = self.inner.in_flight.lock();
        for (record_type, token) in in_flight.iter() {
            info!(%record_type, "Cancelling sync cycle");
            token.cancel();
        }
    }

    /// Conflicts waiting for a manual decision, oldest first.
    pub fn conflicts(&self) -> Vec<SyncConflict> {
        self.inner.conflicts.lock().clone()
    }

    /// Fails with `ConflictUnresolved` while any conflict is queued.
    pub fn ensure_settled(&self) -> SyncResult<()> {
        match self.inner.conflicts.lock().first() {
            Some(conflict) => Err(SyncError::ConflictUnresolved(conflict.id)),
            None => Ok(()),
        }
    }

    /// Settle a queued conflict, push the result and apply it locally.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        choice: ResolutionChoice,
    ) -> SyncResult<Record> {
        self.inner.resolve_queued(conflict_id, choice).await
    }

    /// Replace the device key pair; records migrate lazily.
    pub fn rotate_keys(&self) -> SyncResult<DevicePublicKey> {
        let next = self.inner.keys.rotate()?;
        self.inner.emit(SyncEvent::KeysRotated {
            key_id: next.key_id,
        });
        Ok(next)
    }

    /// Export record keys under a passphrase (prompts for presence).
    pub async fn export_backup(&self, passphrase: &str) -> SyncResult<String> {
        let keys = self.inner.keys.clone();
        let passphrase = passphrase.to_string();
        tokio::task::spawn_blocking(move || {
            keys.unlock()?;
            keys.export_backup(&passphrase)
        })
        .await
        .map_err(join_error)?
    }

    /// Restore record keys from a backup; returns how many were restored.
    pub async fn import_backup(&self, data: &str, passphrase: &str) -> SyncResult<usize> {
        let keys = self.inner.keys.clone();
        let data = data.to_string();
        let passphrase = passphrase.to_string();
        tokio::task::spawn_blocking(move || keys.import_backup(&data, &passphrase))
            .await
            .map_err(join_error)?
    }

    /// Remove a record from the remote store and drop its keys.
    ///
    /// The local tombstone is left in place.
    pub async fn purge_record(&self, id: &RecordId) -> SyncResult<()> {
        match self.inner.remote.delete(id).await {
            Ok(()) | Err(SyncError::Remote(RemoteError::NotFound(_))) => {}
            Err(e) => return Err(e),
        }
        self.inner.keys.forget_record(id)?;
        info!(record_id = %id, "Purged record");
        Ok(())
    }

    /// Follow a network monitor. Transitions are handled until the monitor
    /// or this orchestrator is dropped.
    pub fn attach_network(&self, monitor: &NetworkMonitor) -> JoinHandle<()> {
        let mut rx = monitor.subscribe();
        let initial = *rx.borrow_and_update();
        self.inner.on_reachability(initial);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = *rx.borrow_and_update();
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.on_reachability(state);
            }
            debug!("Network monitor detached");
        })
    }
}

struct Inner {
    codec: EnvelopeCodec,
    keys: Arc<KeyManager>,
    remote: RemoteAdapter,
    resolver: ConflictResolver,
    local: Arc<dyn LocalStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    device_id: DeviceId,
    settings: SyncSettings,
    status: RwLock<SyncStatus>,
    events: broadcast::Sender<SyncEvent>,
    conflicts: Mutex<Vec<SyncConflict>>,
    in_flight: Mutex<HashMap<RecordType, CancellationToken>>,
    online: AtomicBool,
    /// Types synced at least once; resumed after a network loss
    known_types: Mutex<HashSet<RecordType>>,
    /// Types waiting for reachability to come back
    resume: Mutex<HashSet<RecordType>>,
    workers: Arc<Semaphore>,
}

/// Removes the in-flight entry when the cycle ends.
struct InFlightGuard<'a> {
    inner: &'a Inner,
    record_type: RecordType,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.record_type);
    }
}

impl Inner {
    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn set_status(&self, status: SyncStatus) {
        {
            let mut current = self.status.write();
            if *current == status {
                return;
            }
            *current = status.clone();
        }
        debug!(%status, "Sync status changed");
        self.emit(SyncEvent::StatusChanged(status));
    }

    fn current_status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.settings.initial_backoff(),
            max_interval: self.settings.max_backoff(),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Run a remote call until it succeeds, fails permanently, or
    /// `max_remote_attempts` is used up. `prior` attempts already failed.
    async fn with_retry<T, F, Fut>(&self, what: &'static str, prior: u32, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let max = self.settings.max_remote_attempts;
        let mut backoff = self.backoff();
        let mut attempt = prior;
        loop {
            if attempt > 0 {
                let delay = backoff
                    .next_backoff()
                    .unwrap_or_else(|| self.settings.max_backoff());
                debug!(what, attempt, ?delay, "Waiting before retry");
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
            match op().await {
                Err(SyncError::Remote(err)) if err.is_transient() && attempt < max => {
                    warn!(what, attempt, error = %err, "Remote call failed, retrying");
                }
                other => return other,
            }
        }
    }

    /// Between record-level steps: stop on cancellation or network loss.
    fn ensure_continuing(&self, cancel: &CancellationToken) -> SyncResult<()> {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        if !self.online.load(Ordering::SeqCst) {
            return Err(SyncError::Offline);
        }
        Ok(())
    }

    async fn run_cycle(
        self: &Arc<Self>,
        record_type: RecordType,
        mode: SyncMode,
    ) -> SyncResult<SyncReport> {
        let cancel = CancellationToken::new();
        {
            let mut in_flight = self.in_flight.lock();
            if in_flight.contains_key(&record_type) {
                return Err(SyncError::SyncInProgress(record_type.to_string()));
            }
            in_flight.insert(record_type.clone(), cancel.clone());
        }
        let _guard = InFlightGuard {
            inner: self,
            record_type: record_type.clone(),
        };
        self.known_types.lock().insert(record_type.clone());

        if !self.online.load(Ordering::SeqCst) {
            info!(%record_type, "Sync requested while offline, waiting for network");
            self.resume.lock().insert(record_type.clone());
            self.set_status(SyncStatus::Offline);
            return Err(SyncError::Offline);
        }

        if self.current_status() != SyncStatus::Idle {
            self.set_status(SyncStatus::Idle);
        }
        self.set_status(SyncStatus::Syncing);
        info!(%record_type, ?mode, "Sync cycle started");

        match self.execute(&record_type, mode, &cancel).await {
            Ok(report) => {
                info!(
                    %record_type,
                    uploaded = report.uploaded,
                    downloaded = report.downloaded,
                    auto_resolved = report.auto_resolved,
                    queued = report.queued,
                    "Sync cycle finished"
                );
                Ok(report)
            }
            Err(err) => Err(self.pause_or_fail(&record_type, err)),
        }
    }

    /// Map a cycle failure onto the state machine.
    fn pause_or_fail(&self, record_type: &RecordType, err: SyncError) -> SyncError {
        match &err {
            SyncError::Cancelled => {
                info!(%record_type, "Sync cycle cancelled");
                self.set_status(SyncStatus::Idle);
            }
            SyncError::Offline | SyncError::Remote(RemoteError::Unavailable(_)) => {
                warn!(%record_type, error = %err, "Remote unreachable, pausing sync");
                self.resume.lock().insert(record_type.clone());
                self.set_status(SyncStatus::Offline);
            }
            SyncError::UserPresenceRequired => {
                info!(%record_type, "Sync paused for user presence");
                self.emit(SyncEvent::PresenceRequired {
                    record_type: record_type.clone(),
                });
                self.set_status(SyncStatus::Idle);
            }
            _ => {
                warn!(%record_type, error = %err, "Sync cycle failed");
                self.set_status(SyncStatus::Error(err.to_string()));
            }
        }
        err
    }

    async fn execute(
        &self,
        record_type: &RecordType,
        mode: SyncMode,
        cancel: &CancellationToken,
    ) -> SyncResult<SyncReport> {
        let keys = self.keys.clone();
        tokio::task::spawn_blocking(move || keys.unlock())
            .await
            .map_err(join_error)??;

        let checkpoint = self.checkpoints.load_checkpoint(record_type)?;
        let started = Utc::now();
        let mut report = SyncReport::new(record_type.clone(), mode);

        let held: HashSet<RecordId> = self
            .conflicts
            .lock()
            .iter()
            .filter(|c| &c.record_type == record_type)
            .map(|c| c.record_id)
            .collect();

        // Upload. A record still at the version it last matched on the store
        // came from there and has nothing new to send. Every other change is
        // pushed as a replacement of that stored version.
        let mut pending = Vec::new();
        let mut to_push = Vec::new();
        for record in self
            .local
            .changed_since(record_type, checkpoint.last_successful_sync)?
        {
            let base = self.checkpoints.synced_version(&record.id)?;
            if base == Some(record.version) {
                continue;
            }
            if !held.contains(&record.id) {
                to_push.push((record.clone(), base.unwrap_or(0)));
            }
            pending.push(record);
        }
        self.ensure_continuing(cancel)?;
        let rejected = self.upload(to_push, cancel, &mut report).await?;
        self.set_status(SyncStatus::Syncing);

        // Download
        let after = match mode {
            SyncMode::Incremental if rejected.is_empty() => checkpoint.remote_cursor,
            _ => 0,
        };
        let (remote_records, tampered, cursor) =
            self.download(record_type, after, cancel, &mut report).await?;
        self.ensure_continuing(cancel)?;

        // Reconcile. A stored copy that is not behind the remote yet differs
        // from it diverged in an earlier run; it is checked again so a queue
        // lost with the process is rebuilt.
        let mut candidates = pending;
        let changed_ids: HashSet<RecordId> = candidates.iter().map(|r| r.id).collect();
        for remote in &remote_records {
            if changed_ids.contains(&remote.id) {
                continue;
            }
            if let Some(local) = self.local.get(&remote.id)? {
                if local.version >= remote.version && !local.same_content(remote) {
                    candidates.push(local);
                }
            }
        }
        let conflicts = self.resolver.detect(&candidates, &remote_records);
        let conflicted: HashSet<RecordId> = conflicts.iter().map(|c| c.record_id).collect();

        for remote in &remote_records {
            if conflicted.contains(&remote.id) || held.contains(&remote.id) {
                continue;
            }
            match self.local.get(&remote.id)? {
                Some(local) if local.version > remote.version => {}
                Some(local) if local.version == remote.version => {
                    if local.same_content(remote) {
                        self.checkpoints
                            .set_synced_version(&remote.id, remote.version)?;
                    }
                }
                _ => {
                    self.local.apply(remote)?;
                    self.checkpoints
                        .set_synced_version(&remote.id, remote.version)?;
                    report.downloaded += 1;
                }
            }
        }

        for conflict in conflicts {
            self.ensure_continuing(cancel)?;
            match self.resolver.auto_resolve(&conflict) {
                Some(resolved) => {
                    debug!(record_id = %conflict.record_id, "Conflict settled by last-write-wins");
                    self.publish(&resolved, conflict.remote.version).await?;
                    report.auto_resolved += 1;
                    self.emit(SyncEvent::ConflictResolved {
                        conflict_id: conflict.id,
                        record_id: conflict.record_id,
                        choice: None,
                    });
                }
                None => self.enqueue(conflict),
            }
        }

        // The rest of the batch is applied, but the cycle does not count as
        // successful while any envelope failed authentication.
        if tampered > 0 {
            return Err(SyncError::AuthenticationFailed(format!(
                "{} record(s) of type {}",
                tampered, record_type
            )));
        }

        let record_count = self
            .local
            .all(record_type)?
            .iter()
            .filter(|r| !r.deleted)
            .count() as u64;
        self.checkpoints.save_checkpoint(
            record_type,
            &SyncCheckpoint {
                last_successful_sync: Some(started),
                record_count,
                remote_cursor: cursor,
            },
        )?;

        report.queued = self
            .conflicts
            .lock()
            .iter()
            .filter(|c| &c.record_type == record_type)
            .count();
        if self.conflicts.lock().is_empty() {
            self.set_status(SyncStatus::Completed);
        } else {
            self.set_status(SyncStatus::Resolving);
        }
        Ok(report)
    }

    /// Seal and push local changes, each paired with the stored version it
    /// replaces. Returns ids the store refused with a write conflict; they
    /// are reconciled in the download phase.
    async fn upload(
        &self,
        records: Vec<(Record, u64)>,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> SyncResult<HashSet<RecordId>> {
        let mut rejected = HashSet::new();
        if records.is_empty() {
            return Ok(rejected);
        }

        let total = records.len();
        self.set_status(SyncStatus::Uploading(Progress::new(0, total)));

        let codec = self.codec;
        let keys = self.keys.clone();
        let device_id = self.device_id;
        let sealed: Vec<EncryptedRecord> = fan_out(
            records,
            &self.workers,
            cancel,
            move |(record, base): (Record, u64)| {
                seal_record(&codec, &keys, device_id, &record, base)
            },
            |_| {},
        )
        .await?
        .into_iter()
        .collect::<SyncResult<_>>()?;

        let mut done = 0;
        for chunk in sealed.chunks(self.settings.batch_size.max(1)) {
            self.ensure_continuing(cancel)?;
            let offset = done;
            let batch = self
                .remote
                .push_batch(chunk, |p| {
                    self.set_status(SyncStatus::Uploading(Progress::new(offset + p.completed, total)))
                })
                .await;
            done += chunk.len();

            if let Some(err) = batch.unavailable() {
                return Err(err.clone().into());
            }
            for envelope in chunk.iter().filter(|r| batch.pushed.contains(&r.id)) {
                self.checkpoints
                    .set_synced_version(&envelope.id, envelope.version)?;
            }
            report.uploaded += batch.pushed.len();

            for (id, err) in batch.failed {
                match err {
                    RemoteError::WriteConflict { stored_version, .. } => {
                        debug!(record_id = %id, stored_version, "Push refused, stored copy moved on");
                        rejected.insert(id);
                    }
                    err if err.is_transient() && self.settings.max_remote_attempts > 1 => {
                        let Some(envelope) = chunk.iter().find(|r| r.id == id) else {
                            continue;
                        };
                        let remote = &self.remote;
                        match self.with_retry("push", 1, move || remote.push(envelope)).await {
                            Ok(()) => {
                                self.checkpoints.set_synced_version(&id, envelope.version)?;
                                report.uploaded += 1;
                            }
                            Err(SyncError::Remote(RemoteError::WriteConflict { .. })) => {
                                rejected.insert(id);
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    err => return Err(err.into()),
                }
            }
        }

        Ok(rejected)
    }

    /// Pull and open remote records from store sequence `after`. Envelopes
    /// that fail authentication are reported and left out; their count and
    /// the store cursor are returned alongside.
    async fn download(
        &self,
        record_type: &RecordType,
        after: u64,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> SyncResult<(Vec<Record>, usize, u64)> {
        self.set_status(SyncStatus::Downloading(Progress::default()));

        let remote = &self.remote;
        let inner: &Inner = self;
        let RemoteChanges {
            records: pulled,
            cursor,
        } = self
            .with_retry("pull", 0, move || {
                remote.pull_batch(record_type, after, move |p| {
                    inner.set_status(SyncStatus::Downloading(p))
                })
            })
            .await?;
        self.ensure_continuing(cancel)?;

        let codec = self.codec;
        let keys = self.keys.clone();
        let opened = fan_out(
            pulled,
            &self.workers,
            cancel,
            move |envelope: EncryptedRecord| (envelope.id, open_record(&codec, &keys, &envelope)),
            |p| self.set_status(SyncStatus::Downloading(p)),
        )
        .await?;

        let mut records = Vec::with_capacity(opened.len());
        let mut failed = 0usize;
        for (record_id, result) in opened {
            match result {
                Ok(record) => records.push(record),
                Err(SyncError::AuthenticationFailed(reason)) => {
                    warn!(%record_id, "Rejected record that failed authentication");
                    failed += 1;
                    self.emit(SyncEvent::RecordRejected { record_id, reason });
                }
                Err(SyncError::KeyNotFound(_)) => {
                    warn!(%record_id, "No key material for remote record, skipping");
                    report.skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok((records, failed, cursor))
    }

    /// Seal, push (with retry) and then apply a resolved record. The push
    /// only lands while the store still holds `base_version`.
    async fn publish(&self, record: &Record, base_version: u64) -> SyncResult<()> {
        let codec = self.codec;
        let keys = self.keys.clone();
        let device_id = self.device_id;
        let to_seal = record.clone();
        let envelope = tokio::task::spawn_blocking(move || {
            seal_record(&codec, &keys, device_id, &to_seal, base_version)
        })
        .await
        .map_err(join_error)??;

        let remote = &self.remote;
        let envelope = &envelope;
        self.with_retry("push", 0, move || remote.push(envelope)).await?;
        self.local.apply(record)?;
        self.checkpoints.set_synced_version(&record.id, record.version)?;
        Ok(())
    }

    /// Queue a conflict, replacing any older entry for the same record.
    fn enqueue(&self, conflict: SyncConflict) {
        let mut queue = self.conflicts.lock();
        if let Some(existing) = queue.iter_mut().find(|c| c.record_id == conflict.record_id) {
            if existing.local == conflict.local && existing.remote == conflict.remote {
                return;
            }
            *existing = conflict.clone();
        } else {
            queue.push(conflict.clone());
        }
        drop(queue);

        info!(
            record_id = %conflict.record_id,
            kind = %conflict.kind,
            "Conflict queued for manual resolution"
        );
        self.emit(SyncEvent::ConflictQueued {
            conflict_id: conflict.id,
            record_id: conflict.record_id,
            record_type: conflict.record_type,
            kind: conflict.kind,
        });
    }

    async fn resolve_queued(
        &self,
        conflict_id: Uuid,
        choice: ResolutionChoice,
    ) -> SyncResult<Record> {
        let conflict = self
            .conflicts
            .lock()
            .iter()
            .find(|c| c.id == conflict_id)
            .cloned()
            .ok_or_else(|| SyncError::InvalidOperation(format!("No queued conflict {}", conflict_id)))?;

        let keys = self.keys.clone();
        tokio::task::spawn_blocking(move || keys.unlock())
            .await
            .map_err(join_error)??;

        let resolved = self.resolver.resolve(&conflict, choice)?;
        if let Err(err) = self.publish(&resolved, conflict.remote.version).await {
            if matches!(err, SyncError::Remote(RemoteError::Unavailable(_))) {
                self.set_status(SyncStatus::Offline);
            }
            return Err(err);
        }

        let remaining = {
            let mut queue = self.conflicts.lock();
            queue.retain(|c| c.id != conflict_id);
            queue.len()
        };
        info!(record_id = %conflict.record_id, ?choice, remaining, "Conflict resolved");
        self.emit(SyncEvent::ConflictResolved {
            conflict_id,
            record_id: conflict.record_id,
            choice: Some(choice),
        });

        if remaining == 0 && self.current_status() == SyncStatus::Resolving {
            self.set_status(SyncStatus::Completed);
        }
        Ok(resolved)
    }

    fn on_reachability(self: &Arc<Self>, state: Reachability) {
        match state {
            Reachability::Offline => {
                if self.online.swap(false, Ordering::SeqCst) {
                    let known: Vec<RecordType> = self.known_types.lock().iter().cloned().collect();
                    self.resume.lock().extend(known);
                    self.set_status(SyncStatus::Offline);
                }
            }
            Reachability::Online => {
                if self.online.swap(true, Ordering::SeqCst) {
                    return;
                }
                let pending: Vec<RecordType> = self.resume.lock().drain().collect();
                if self.current_status() == SyncStatus::Offline {
                    self.set_status(SyncStatus::Idle);
                }
                for record_type in pending {
                    info!(%record_type, "Network restored, running incremental sync");
                    let inner = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = inner.run_cycle(record_type.clone(), SyncMode::Incremental).await {
                            warn!(%record_type, error = %e, "Resumed sync did not complete");
                        }
                    });
                }
            }
        }
    }
}
