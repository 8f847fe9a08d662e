//! Key hierarchy manager
//!
//! Owns the unlocked session: the only mutable state shared between the
//! orchestrator's worker tasks and user-initiated lock/rotate calls.
//!
//! ## Locking
//!
//! Unwraps hold the session's read side for the duration of the key
//! agreement. `lock`, `enter_background` and `rotate` take the write side,
//! so they wait for in-flight unwraps and no unwrap starts while they run.
//! Each lock bumps the session epoch; an unwrap that finishes after a lock
//! does not repopulate the cleared cache.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};
use x25519_dalek::PublicKey as X25519PublicKey;

use super::backup::{open_backup, seal_backup};
use super::device::{DeviceKeyId, DevicePublicKey, PresenceOutcome, SecureKeyStore};
use super::wrap::{WrappedKey, WrappedRecordKeys};
use super::WrappedKeyStore;
use crate::config::{BackupSettings, KeySettings};
use crate::crypto::SymmetricKey;
use crate::envelope::RecordKeys;
use crate::error::{SyncError, SyncResult};
use crate::types::RecordId;

#[derive(Default)]
struct Session {
    unlocked: bool,
    epoch: u64,
    cache: HashMap<RecordId, RecordKeys>,
}

/// Resets the rotation flag when dropped.
struct RotationGuard<'a>(&'a AtomicBool);

impl Drop for RotationGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Wraps, unwraps and rotates record keys on behalf of the orchestrator.
pub struct KeyManager {
    store: Arc<dyn SecureKeyStore>,
    wrapped: Arc<dyn WrappedKeyStore>,
    settings: KeySettings,
    backup: BackupSettings,
    session: RwLock<Session>,
    last_activity: Mutex<Instant>,
    rotating: AtomicBool,
}

impl KeyManager {
    pub fn new(
        store: Arc<dyn SecureKeyStore>,
        wrapped: Arc<dyn WrappedKeyStore>,
        settings: KeySettings,
        backup: BackupSettings,
    ) -> Self {
        Self {
            store,
            wrapped,
            settings,
            backup,
            session: RwLock::new(Session::default()),
            last_activity: Mutex::new(Instant::now()),
            rotating: AtomicBool::new(false),
        }
    }

    /// Current device public key, generating the first pair on demand.
    pub fn device_public_key(&self) -> SyncResult<DevicePublicKey> {
        match self.store.current()? {
            Some(pk) => Ok(pk),
            None => self.store.generate(),
        }
    }

    /// Pass the presence gate and open a session.
    ///
    /// A still-valid session is reused without prompting.
    pub fn unlock(&self) -> SyncResult<()> {
        if self.is_unlocked() {
            self.touch();
            return Ok(());
        }

        match self.store.check_presence(&self.settings.presence_reason) {
            PresenceOutcome::Granted => {
                self.device_public_key()?;
                let mut session = self.session.write();
                session.unlocked = true;
                session.epoch += 1;
                self.touch();
                info!(epoch = session.epoch, "Key session unlocked");
                Ok(())
            }
            outcome => {
                warn!(?outcome, "Presence check did not pass");
                Err(SyncError::UserPresenceRequired)
            }
        }
    }

    /// Drop the session and every cached record key.
    pub fn lock(&self) {
        let mut session = self.session.write();
        if session.unlocked || !session.cache.is_empty() {
            debug!(cached = session.cache.len(), "Key session locked");
        }
        session.unlocked = false;
        session.epoch += 1;
        session.cache.clear();
    }

    /// The app left the foreground.
    pub fn enter_background(&self) {
        info!("Entering background, locking key session");
        self.lock();
    }

    /// Whether unwraps currently succeed without a presence prompt.
    pub fn is_unlocked(&self) -> bool {
        self.expire_if_idle();
        self.session.read().unlocked
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn expire_if_idle(&self) {
        let Some(timeout) = self.settings.session_timeout() else {
            return;
        };
        let idle = self.last_activity.lock().elapsed();
        if idle > timeout && self.session.read().unlocked {
            info!(idle_secs = idle.as_secs(), "Key session idle timeout");
            self.lock();
        }
    }

    /// Seal a symmetric key to the current device key. No presence needed.
    pub fn wrap_key(&self, key: &SymmetricKey) -> SyncResult<WrappedKey> {
        WrappedKey::wrap(key, &self.device_public_key()?)
    }

    /// Open a wrapped key. Requires an unlocked session.
    pub fn unwrap_key(&self, wrapped: &WrappedKey) -> SyncResult<SymmetricKey> {
        self.expire_if_idle();
        let session = self.session.read();
        if !session.unlocked {
            return Err(SyncError::UserPresenceRequired);
        }
        let key = wrapped.unwrap_with(|id, peer| self.store.agree(id, peer))?;
        drop(session);
        self.touch();
        Ok(key)
    }

    /// Generate, wrap, persist and cache keys for a record seen for the first time.
    pub fn keys_for_new_record(&self, id: &RecordId) -> SyncResult<RecordKeys> {
        let keys = RecordKeys::generate();
        let wrapped = WrappedRecordKeys::wrap(&keys, &self.device_public_key()?)?;
        self.wrapped.save_wrapped(id, &wrapped)?;

        let mut session = self.session.write();
        if session.unlocked {
            session.cache.insert(*id, keys.clone());
        }
        debug!(record_id = %id, "Generated record keys");
        Ok(keys)
    }

    /// Keys for an existing record, from cache or by unwrapping.
    pub fn record_keys(&self, id: &RecordId) -> SyncResult<RecordKeys> {
        self.expire_if_idle();

        let (keys, epoch) = {
            let session = self.session.read();
            if !session.unlocked {
                return Err(SyncError::UserPresenceRequired);
            }
            if let Some(keys) = session.cache.get(id) {
                return Ok(keys.clone());
            }

            let wrapped = self
                .wrapped
                .load_wrapped(id)?
                .ok_or_else(|| SyncError::KeyNotFound(format!("record {}", id)))?;
            let agree =
                |key_id: &DeviceKeyId, peer: &X25519PublicKey| self.store.agree(key_id, peer);
            let keys = RecordKeys {
                data_key: wrapped.data.unwrap_with(agree)?,
                metadata_key: wrapped.metadata.unwrap_with(agree)?,
                auth_key: wrapped.auth.unwrap_with(agree)?,
            };
            (keys, session.epoch)
        };

        self.touch();
        let mut session = self.session.write();
        if session.unlocked && session.epoch == epoch {
            session.cache.insert(*id, keys.clone());
        }
        Ok(keys)
    }

    /// Keys for a record about to be uploaded, created if it has none yet.
    pub fn ensure_record_keys(&self, id: &RecordId) -> SyncResult<RecordKeys> {
        if self.wrapped.load_wrapped(id)?.is_none() {
            return self.keys_for_new_record(id);
        }
        self.record_keys(id)
    }

    /// Record a successful decrypt; re-wraps keys still under a retired device key.
    ///
    /// Returns whether the record was re-wrapped.
    pub fn confirm_decrypted(&self, id: &RecordId) -> SyncResult<bool> {
        let Some(stored) = self.wrapped.load_wrapped(id)? else {
            return Ok(false);
        };
        let current = self.device_public_key()?;
        if stored.key_id() == current.key_id {
            return Ok(false);
        }

        let keys = self.record_keys(id)?;
        let rewrapped = WrappedRecordKeys::wrap(&keys, &current)?;
        self.wrapped.save_wrapped(id, &rewrapped)?;
        info!(record_id = %id, from = %stored.key_id(), to = %current.key_id, "Re-wrapped record keys");
        Ok(true)
    }

    /// Replace the device key pair.
    ///
    /// Keys already in the session cache are re-wrapped at once. Every other
    /// record keeps its old wrapping until its next successful decrypt.
    pub fn rotate(&self) -> SyncResult<DevicePublicKey> {
        if self.rotating.swap(true, Ordering::AcqRel) {
            return Err(SyncError::RotationInProgress);
        }
        let _guard = RotationGuard(&self.rotating);

        let session = self.session.write();
        let previous = self.store.current()?;
        let next = self.store.generate()?;

        for (id, keys) in &session.cache {
            let rewrapped = WrappedRecordKeys::wrap(keys, &next)?;
            self.wrapped.save_wrapped(id, &rewrapped)?;
        }

        info!(
            from = ?previous.map(|pk| pk.key_id.to_string()),
            to = %next.key_id,
            rewrapped = session.cache.len(),
            "Rotated device key"
        );
        Ok(next)
    }

    /// Records still wrapped under a retired device key.
    pub fn pending_rewrap(&self) -> SyncResult<Vec<RecordId>> {
        let current = self.device_public_key()?;
        Ok(self
            .wrapped
            .list_wrapped()?
            .into_iter()
            .filter(|(_, wrapped)| wrapped.key_id() != current.key_id)
            .map(|(id, _)| id)
            .collect())
    }

    /// Destroy retired device key pairs that no stored record is wrapped under.
    ///
    /// Returns the retired ids.
    pub fn retire_unused_keys(&self) -> SyncResult<Vec<DeviceKeyId>> {
        let _session = self.session.write();
        let current = self.store.current()?.map(|pk| pk.key_id);
        let in_use: HashSet<DeviceKeyId> = self
            .wrapped
            .list_wrapped()?
            .iter()
            .map(|(_, wrapped)| wrapped.key_id())
            .collect();

        let mut retired = Vec::new();
        for key_id in self.store.key_ids()? {
            if Some(key_id) == current || in_use.contains(&key_id) {
                continue;
            }
            self.store.retire(&key_id)?;
            retired.push(key_id);
        }
        if !retired.is_empty() {
            info!(retired = retired.len(), "Retired unused device keys");
        }
        Ok(retired)
    }

    /// Drop key material for a purged record.
    pub fn forget_record(&self, id: &RecordId) -> SyncResult<()> {
        self.wrapped.remove_wrapped(id)?;
        self.session.write().cache.remove(id);
        Ok(())
    }

    /// Export every record key under `passphrase`. Requires an unlocked session.
    pub fn export_backup(&self, passphrase: &str) -> SyncResult<String> {
        if !self.is_unlocked() {
            return Err(SyncError::UserPresenceRequired);
        }

        let mut records = Vec::new();
        for (id, _) in self.wrapped.list_wrapped()? {
            records.push((id, self.record_keys(&id)?));
        }
        let exported = seal_backup(&records, passphrase, &self.backup)?;
        info!(records = records.len(), "Exported key backup");
        Ok(exported)
    }

    /// Restore record keys from a backup, wrapping them to this device.
    ///
    /// Returns the number of records restored.
    pub fn import_backup(&self, data: &str, passphrase: &str) -> SyncResult<usize> {
        let records = open_backup(data, passphrase)?;
        let current = self.device_public_key()?;

        let mut session = self.session.write();
        for (id, keys) in &records {
            let wrapped = WrappedRecordKeys::wrap(keys, &current)?;
            self.wrapped.save_wrapped(id, &wrapped)?;
            if session.unlocked {
                session.cache.insert(*id, keys.clone());
            }
        }
        info!(records = records.len(), "Imported key backup");
        Ok(records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{AlwaysPresent, MemoryWrappedKeys, SoftwareKeyStore};

    fn fast_backup() -> BackupSettings {
        BackupSettings {
            mem_cost_kib: 8 * 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    fn manager_with(store: SoftwareKeyStore, settings: KeySettings) -> KeyManager {
        KeyManager::new(
            Arc::new(store),
            Arc::new(MemoryWrappedKeys::new()),
            settings,
            fast_backup(),
        )
    }

    fn manager() -> KeyManager {
        manager_with(
            SoftwareKeyStore::ephemeral(AlwaysPresent),
            KeySettings::default(),
        )
    }

    #[test]
    fn test_unwrap_requires_session() {
        let keys = manager();
        let wrapped = keys.wrap_key(&SymmetricKey::generate()).unwrap();

        assert!(matches!(
            keys.unwrap_key(&wrapped),
            Err(SyncError::UserPresenceRequired)
        ));

        keys.unlock().unwrap();
        assert!(keys.unwrap_key(&wrapped).is_ok());
    }

    #[test]
    fn test_denied_presence() {
        let keys = manager_with(
            SoftwareKeyStore::ephemeral(|_: &str| PresenceOutcome::Denied),
            KeySettings::default(),
        );
        assert!(matches!(keys.unlock(), Err(SyncError::UserPresenceRequired)));
        assert!(!keys.is_unlocked());
    }

    #[test]
    fn test_unavailable_presence() {
        let keys = manager_with(
            SoftwareKeyStore::ephemeral(|_: &str| PresenceOutcome::Unavailable),
            KeySettings::default(),
        );
        assert!(matches!(keys.unlock(), Err(SyncError::UserPresenceRequired)));
    }

    #[test]
    fn test_record_keys_persist_across_lock() {
        let keys = manager();
        keys.unlock().unwrap();
        let id = RecordId::new();
        let created = keys.keys_for_new_record(&id).unwrap();

        keys.lock();
        assert!(matches!(
            keys.record_keys(&id),
            Err(SyncError::UserPresenceRequired)
        ));

        keys.unlock().unwrap();
        let loaded = keys.record_keys(&id).unwrap();
        assert_eq!(loaded.data_key, created.data_key);
        assert_eq!(loaded.auth_key, created.auth_key);
    }

    #[test]
    fn test_unknown_record_key() {
        let keys = manager();
        keys.unlock().unwrap();
        assert!(matches!(
            keys.record_keys(&RecordId::new()),
            Err(SyncError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_ensure_record_keys_is_stable() {
        let keys = manager();
        keys.unlock().unwrap();
        let id = RecordId::new();
        let first = keys.ensure_record_keys(&id).unwrap();
        let second = keys.ensure_record_keys(&id).unwrap();
        assert_eq!(first.data_key, second.data_key);
    }

    #[test]
    fn test_background_clears_session() {
        let keys = manager();
        keys.unlock().unwrap();
        keys.enter_background();
        assert!(!keys.is_unlocked());
    }

    #[test]
    fn test_idle_timeout_locks() {
        let keys = manager_with(
            SoftwareKeyStore::ephemeral(AlwaysPresent),
            KeySettings {
                session_timeout_secs: Some(0),
                ..KeySettings::default()
            },
        );
        keys.unlock().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(!keys.is_unlocked());
    }

    #[test]
    fn test_rotation_is_not_reentrant() {
        let keys = manager();
        keys.rotating.store(true, Ordering::Release);
        assert!(matches!(keys.rotate(), Err(SyncError::RotationInProgress)));

        keys.rotating.store(false, Ordering::Release);
        assert!(keys.rotate().is_ok());
        assert!(!keys.rotating.load(Ordering::Acquire));
    }

    #[test]
    fn test_rotation_rewraps_cached_immediately() {
        let keys = manager();
        keys.unlock().unwrap();
        let cached = RecordId::new();
        keys.keys_for_new_record(&cached).unwrap();

        let uncached = RecordId::new();
        keys.keys_for_new_record(&uncached).unwrap();
        keys.session.write().cache.remove(&uncached);

        keys.rotate().unwrap();
        assert_eq!(keys.pending_rewrap().unwrap(), vec![uncached]);

        keys.record_keys(&uncached).unwrap();
        assert!(keys.confirm_decrypted(&uncached).unwrap());
        assert!(keys.pending_rewrap().unwrap().is_empty());
        assert!(!keys.confirm_decrypted(&uncached).unwrap());
    }

    #[test]
    fn test_retire_waits_for_migration() {
        let keys = manager();
        keys.unlock().unwrap();
        let old = keys.device_public_key().unwrap();
        let id = RecordId::new();
        keys.keys_for_new_record(&id).unwrap();
        keys.session.write().cache.remove(&id);

        keys.rotate().unwrap();
        assert!(keys.retire_unused_keys().unwrap().is_empty());

        keys.record_keys(&id).unwrap();
        keys.confirm_decrypted(&id).unwrap();
        assert_eq!(keys.retire_unused_keys().unwrap(), vec![old.key_id]);
        assert!(keys.record_keys(&id).is_ok());
    }

    #[test]
    fn test_backup_restores_on_new_device() {
        let source = manager();
        source.unlock().unwrap();
        let id = RecordId::new();
        let original = source.keys_for_new_record(&id).unwrap();
        let exported = source.export_backup("hunter2").unwrap();

        let target = manager();
        assert_eq!(target.import_backup(&exported, "hunter2").unwrap(), 1);
        target.unlock().unwrap();
        assert_eq!(target.record_keys(&id).unwrap().data_key, original.data_key);
    }

    #[test]
    fn test_export_requires_session() {
        let keys = manager();
        assert!(matches!(
            keys.export_backup("pw"),
            Err(SyncError::UserPresenceRequired)
        ));
    }

    #[test]
    fn test_forget_record() {
        let keys = manager();
        keys.unlock().unwrap();
        let id = RecordId::new();
        keys.keys_for_new_record(&id).unwrap();
        keys.forget_record(&id).unwrap();
        assert!(matches!(
            keys.record_keys(&id),
            Err(SyncError::KeyNotFound(_))
        ));
    }
}
