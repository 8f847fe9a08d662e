//! Device key pairs and the platform secure key storage seam
//!
//! The private half of a device key pair never leaves a [`SecureKeyStore`].
//! Callers only ever see the [`DevicePublicKey`] and ask the store to run an
//! X25519 agreement on their behalf.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::Zeroizing;

use crate::error::{SyncError, SyncResult};
use crate::storage::Storage;

/// Fingerprint identifying a device key pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceKeyId(pub [u8; 16]);

impl DeviceKeyId {
    /// Derive the id from a public key
    pub fn for_public_key(public: &[u8; 32]) -> Self {
        let digest = blake3::derive_key("vaultsync-device-key-id-v1", public);
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        Self(id)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> SyncResult<Self> {
        let bytes = hex::decode(s).map_err(|e| SyncError::Serialization(e.to_string()))?;
        let id: [u8; 16] = bytes
            .try_into()
            .map_err(|_| SyncError::Serialization("device key id must be 16 bytes".into()))?;
        Ok(Self(id))
    }
}

impl std::fmt::Display for DeviceKeyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.to_hex()[..12])
    }
}

/// Exportable half of a device key pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevicePublicKey {
    pub key_id: DeviceKeyId,
    pub bytes: [u8; 32],
}

impl DevicePublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            key_id: DeviceKeyId::for_public_key(&bytes),
            bytes,
        }
    }

    pub fn x25519(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

/// Outcome of a user-presence check (biometric or passcode)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceOutcome {
    Granted,
    Denied,
    Unavailable,
}

/// Platform user-presence prompt.
pub trait PresenceGate: Send + Sync {
    fn check(&self, reason: &str) -> PresenceOutcome;
}

impl<F> PresenceGate for F
where
    F: Fn(&str) -> PresenceOutcome + Send + Sync,
{
    fn check(&self, reason: &str) -> PresenceOutcome {
        self(reason)
    }
}

/// Gate that always grants presence (headless tools and tests)
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysPresent;

impl PresenceGate for AlwaysPresent {
    fn check(&self, _reason: &str) -> PresenceOutcome {
        PresenceOutcome::Granted
    }
}

/// Hardware-backed (or emulated) key storage.
///
/// Implementations must never hand out private key bytes.
pub trait SecureKeyStore: Send + Sync {
    /// Generate a new key pair and make it the current one.
    fn generate(&self) -> SyncResult<DevicePublicKey>;

    /// Public half of the current key pair, if one exists.
    fn current(&self) -> SyncResult<Option<DevicePublicKey>>;

    /// Run the platform presence prompt.
    fn check_presence(&self, reason: &str) -> PresenceOutcome;

    /// X25519 agreement between the private key `key_id` and `peer`.
    fn agree(&self, key_id: &DeviceKeyId, peer: &X25519PublicKey)
        -> SyncResult<Zeroizing<[u8; 32]>>;

    /// Ids of every pair held, current and retired.
    fn key_ids(&self) -> SyncResult<Vec<DeviceKeyId>>;

    /// Destroy a retired pair. The current pair cannot be retired.
    fn retire(&self, key_id: &DeviceKeyId) -> SyncResult<()>;
}

/// In-process key store for platforms without secure hardware.
///
/// Keeps every generated pair (current and retired) so records wrapped under
/// a retired key stay readable until they are lazily re-wrapped. When opened
/// on a [`Storage`], secrets are persisted in the local database.
pub struct SoftwareKeyStore {
    secrets: RwLock<HashMap<DeviceKeyId, X25519StaticSecret>>,
    current: RwLock<Option<DevicePublicKey>>,
    gate: Box<dyn PresenceGate>,
    storage: Option<Storage>,
}

impl SoftwareKeyStore {
    /// Memory-only store; keys vanish with the process.
    pub fn ephemeral(gate: impl PresenceGate + 'static) -> Self {
        Self {
            secrets: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
            gate: Box::new(gate),
            storage: None,
        }
    }

    /// Store backed by the local database.
    pub fn open(storage: Storage, gate: impl PresenceGate + 'static) -> SyncResult<Self> {
        let mut secrets = HashMap::new();
        for (key_id, secret) in storage.load_device_secrets()? {
            secrets.insert(key_id, X25519StaticSecret::from(*secret));
        }

        let current = match storage.current_device_key()? {
            Some(key_id) => {
                let secret = secrets
                    .get(&key_id)
                    .ok_or_else(|| SyncError::KeyNotFound(key_id.to_string()))?;
                Some(DevicePublicKey::from_bytes(
                    X25519PublicKey::from(secret).to_bytes(),
                ))
            }
            None => None,
        };

        debug!(keys = secrets.len(), "Opened software key store");
        Ok(Self {
            secrets: RwLock::new(secrets),
            current: RwLock::new(current),
            gate: Box::new(gate),
            storage: Some(storage),
        })
    }

    /// Number of key pairs held, including retired ones
    pub fn key_count(&self) -> usize {
        self.secrets.read().len()
    }
}

impl SecureKeyStore for SoftwareKeyStore {
    fn generate(&self) -> SyncResult<DevicePublicKey> {
        let mut seed = Zeroizing::new([0u8; 32]);
        getrandom::getrandom(seed.as_mut())
            .map_err(|e| SyncError::Crypto(format!("Failed to generate device key: {}", e)))?;
        let secret = X25519StaticSecret::from(*seed);
        let public = DevicePublicKey::from_bytes(X25519PublicKey::from(&secret).to_bytes());

        if let Some(storage) = &self.storage {
            storage.save_device_secret(&public.key_id, &seed)?;
        }

        self.secrets.write().insert(public.key_id, secret);
        *self.current.write() = Some(public);
        info!(key_id = %public.key_id, "Generated device key pair");
        Ok(public)
    }

    fn current(&self) -> SyncResult<Option<DevicePublicKey>> {
        Ok(*self.current.read())
    }

    fn check_presence(&self, reason: &str) -> PresenceOutcome {
        self.gate.check(reason)
    }

    fn agree(
        &self,
        key_id: &DeviceKeyId,
        peer: &X25519PublicKey,
    ) -> SyncResult<Zeroizing<[u8; 32]>> {
        let secrets = self.secrets.read();
        let secret = secrets
            .get(key_id)
            .ok_or_else(|| SyncError::KeyNotFound(format!("device key {}", key_id)))?;
        Ok(Zeroizing::new(secret.diffie_hellman(peer).to_bytes()))
    }

    fn key_ids(&self) -> SyncResult<Vec<DeviceKeyId>> {
        let mut ids: Vec<DeviceKeyId> = self.secrets.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn retire(&self, key_id: &DeviceKeyId) -> SyncResult<()> {
        if self.current.read().map(|pk| pk.key_id) == Some(*key_id) {
            return Err(SyncError::InvalidOperation(
                "the current device key cannot be retired".into(),
            ));
        }
        if self.secrets.write().remove(key_id).is_none() {
            return Err(SyncError::KeyNotFound(format!("device key {}", key_id)));
        }
        if let Some(storage) = &self.storage {
            storage.remove_device_secret(key_id)?;
        }
        info!(%key_id, "Retired device key pair");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_id_is_stable() {
        let bytes = [9u8; 32];
        assert_eq!(
            DeviceKeyId::for_public_key(&bytes),
            DeviceKeyId::for_public_key(&bytes)
        );
        let id = DeviceKeyId::for_public_key(&bytes);
        assert_eq!(DeviceKeyId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn test_generate_sets_current() {
        let store = SoftwareKeyStore::ephemeral(AlwaysPresent);
        assert!(store.current().unwrap().is_none());

        let first = store.generate().unwrap();
        assert_eq!(store.current().unwrap(), Some(first));

        let second = store.generate().unwrap();
        assert_ne!(first.key_id, second.key_id);
        assert_eq!(store.current().unwrap(), Some(second));
        assert_eq!(store.key_count(), 2);
    }

    #[test]
    fn test_agreement_matches_peer_side() {
        let store = SoftwareKeyStore::ephemeral(AlwaysPresent);
        let device = store.generate().unwrap();

        let peer_secret = X25519StaticSecret::from([3u8; 32]);
        let peer_public = X25519PublicKey::from(&peer_secret);

        let ours = store.agree(&device.key_id, &peer_public).unwrap();
        let theirs = peer_secret.diffie_hellman(&device.x25519());
        assert_eq!(*ours, theirs.to_bytes());
    }

    #[test]
    fn test_agree_with_unknown_key_fails() {
        let store = SoftwareKeyStore::ephemeral(AlwaysPresent);
        let unknown = DeviceKeyId([0u8; 16]);
        let peer = X25519PublicKey::from([1u8; 32]);
        assert!(matches!(
            store.agree(&unknown, &peer),
            Err(SyncError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_closure_gate() {
        let store = SoftwareKeyStore::ephemeral(|reason: &str| {
            if reason.contains("sync") {
                PresenceOutcome::Granted
            } else {
                PresenceOutcome::Denied
            }
        });
        assert_eq!(store.check_presence("sync now"), PresenceOutcome::Granted);
        assert_eq!(store.check_presence("export"), PresenceOutcome::Denied);
    }

    #[test]
    fn test_persisted_store_reopens_with_same_keys() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("local.redb")).unwrap();

        let store = SoftwareKeyStore::open(storage.clone(), AlwaysPresent).unwrap();
        let old = store.generate().unwrap();
        let new = store.generate().unwrap();
        drop(store);

        let reopened = SoftwareKeyStore::open(storage, AlwaysPresent).unwrap();
        assert_eq!(reopened.current().unwrap(), Some(new));
        assert_eq!(reopened.key_count(), 2);

        let peer = X25519PublicKey::from(&X25519StaticSecret::from([5u8; 32]));
        assert!(reopened.agree(&old.key_id, &peer).is_ok());
    }

    #[test]
    fn test_retire_keeps_current() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().join("local.redb")).unwrap();
        let store = SoftwareKeyStore::open(storage.clone(), AlwaysPresent).unwrap();
        let old = store.generate().unwrap();
        let new = store.generate().unwrap();

        assert!(matches!(
            store.retire(&new.key_id),
            Err(SyncError::InvalidOperation(_))
        ));
        store.retire(&old.key_id).unwrap();
        assert_eq!(store.key_ids().unwrap(), vec![new.key_id]);
        assert!(matches!(
            store.retire(&old.key_id),
            Err(SyncError::KeyNotFound(_))
        ));

        let reopened = SoftwareKeyStore::open(storage, AlwaysPresent).unwrap();
        assert_eq!(reopened.key_count(), 1);
    }
}
