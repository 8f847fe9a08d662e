//! Key hierarchy
//!
//! ```text
//! Device key pair (X25519, private half inside SecureKeyStore)
//!   └── wraps ──▶ RecordKeys per record (data, metadata, auth)
//!                   └── seal ──▶ EncryptedRecord
//! ```
//!
//! - [`device`]: device key pairs, the [`SecureKeyStore`] seam and presence gates
//! - [`wrap`]: sealed boxes addressed to a device public key
//! - [`backup`]: passphrase-protected export of record keys
//! - [`manager`]: the unlocked session, record key lifecycle and rotation

pub mod backup;
pub mod device;
pub mod manager;
pub mod wrap;

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::SyncResult;
use crate::types::RecordId;

pub use backup::{open_backup, seal_backup, KdfParams};
pub use device::{
    AlwaysPresent, DeviceKeyId, DevicePublicKey, PresenceGate, PresenceOutcome, SecureKeyStore,
    SoftwareKeyStore,
};
pub use manager::KeyManager;
pub use wrap::{WrappedKey, WrappedRecordKeys};

/// Persistence for wrapped record keys.
pub trait WrappedKeyStore: Send + Sync {
    fn load_wrapped(&self, id: &RecordId) -> SyncResult<Option<WrappedRecordKeys>>;
    fn save_wrapped(&self, id: &RecordId, keys: &WrappedRecordKeys) -> SyncResult<()>;
    fn remove_wrapped(&self, id: &RecordId) -> SyncResult<()>;
    fn list_wrapped(&self) -> SyncResult<Vec<(RecordId, WrappedRecordKeys)>>;
}

/// In-memory [`WrappedKeyStore`]
#[derive(Default)]
pub struct MemoryWrappedKeys {
    entries: RwLock<HashMap<RecordId, WrappedRecordKeys>>,
}

impl MemoryWrappedKeys {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WrappedKeyStore for MemoryWrappedKeys {
    fn load_wrapped(&self, id: &RecordId) -> SyncResult<Option<WrappedRecordKeys>> {
        Ok(self.entries.read().get(id).cloned())
    }

    fn save_wrapped(&self, id: &RecordId, keys: &WrappedRecordKeys) -> SyncResult<()> {
        self.entries.write().insert(*id, keys.clone());
        Ok(())
    }

    fn remove_wrapped(&self, id: &RecordId) -> SyncResult<()> {
        self.entries.write().remove(id);
        Ok(())
    }

    fn list_wrapped(&self) -> SyncResult<Vec<(RecordId, WrappedRecordKeys)>> {
        let mut all: Vec<_> = self
            .entries
            .read()
            .iter()
            .map(|(id, keys)| (*id, keys.clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        Ok(all)
    }
}
