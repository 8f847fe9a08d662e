//! Sealed boxes addressed to a device public key
//!
//! ## Key Wrapping
//!
//! ```text
//! 1. shared   = x25519(ephemeral_sk, device_pk)
//! 2. wrap_key = HKDF-SHA256(shared, info = WRAP_INFO || ephemeral_pk || key_id)
//! 3. sealed   = ChaCha20-Poly1305(wrap_key, symmetric_key)
//! ```
//!
//! Wrapping needs only the public key. Unwrapping needs the matching private
//! key, which stays inside the [`SecureKeyStore`](super::SecureKeyStore); the
//! store performs the agreement and hands back the shared secret.

use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};
use zeroize::Zeroizing;

use super::device::{DeviceKeyId, DevicePublicKey};
use crate::crypto::{RecordCrypto, SymmetricKey};
use crate::envelope::RecordKeys;
use crate::error::{SyncError, SyncResult};

/// Domain separation string for HKDF
const WRAP_INFO: &[u8] = b"vaultsync-key-wrap-v1";

/// A symmetric key sealed to one device key pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKey {
    /// Device key pair able to open this box
    pub key_id: DeviceKeyId,
    /// X25519 ephemeral public key used for this box
    pub ephemeral_pk: [u8; 32],
    /// Encrypted key (nonce prepended)
    pub sealed: Vec<u8>,
}

impl WrappedKey {
    /// Seal `key` to `recipient`.
    pub fn wrap(key: &SymmetricKey, recipient: &DevicePublicKey) -> SyncResult<Self> {
        let mut ephemeral_seed = Zeroizing::new([0u8; 32]);
        getrandom::getrandom(ephemeral_seed.as_mut())
            .map_err(|e| SyncError::Crypto(format!("Failed to generate ephemeral key: {}", e)))?;
        let ephemeral_secret = X25519StaticSecret::from(*ephemeral_seed);
        let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);

        let shared = ephemeral_secret.diffie_hellman(&recipient.x25519());
        let wrap_key = derive_wrap_key(
            shared.as_bytes(),
            ephemeral_public.as_bytes(),
            &recipient.key_id,
        )?;

        let sealed = RecordCrypto::new(&wrap_key).seal(key.as_bytes())?;

        Ok(Self {
            key_id: recipient.key_id,
            ephemeral_pk: *ephemeral_public.as_bytes(),
            sealed,
        })
    }

    /// Open the box given the agreement computed by the key store.
    ///
    /// `agree` receives the device key id and the ephemeral public key.
    pub fn unwrap_with<F>(&self, agree: F) -> SyncResult<SymmetricKey>
    where
        F: FnOnce(&DeviceKeyId, &X25519PublicKey) -> SyncResult<Zeroizing<[u8; 32]>>,
    {
        let ephemeral = X25519PublicKey::from(self.ephemeral_pk);
        let shared = agree(&self.key_id, &ephemeral)?;
        let wrap_key = derive_wrap_key(&shared, &self.ephemeral_pk, &self.key_id)?;

        let opened = Zeroizing::new(RecordCrypto::new(&wrap_key).open(&self.sealed)?);
        SymmetricKey::from_slice(&opened)
    }
}

fn derive_wrap_key(
    shared: &[u8; 32],
    ephemeral_pk: &[u8; 32],
    key_id: &DeviceKeyId,
) -> SyncResult<SymmetricKey> {
    let mut info = Vec::with_capacity(WRAP_INFO.len() + 32 + 16);
    info.extend_from_slice(WRAP_INFO);
    info.extend_from_slice(ephemeral_pk);
    info.extend_from_slice(&key_id.0);

    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut okm = [0u8; 32];
    hk.expand(&info, &mut okm)
        .map_err(|e| SyncError::Crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(SymmetricKey::from_bytes(okm))
}

/// The wrapped form of a record's key triple, as persisted locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedRecordKeys {
    pub data: WrappedKey,
    pub metadata: WrappedKey,
    pub auth: WrappedKey,
}

impl WrappedRecordKeys {
    pub fn wrap(keys: &RecordKeys, recipient: &DevicePublicKey) -> SyncResult<Self> {
        Ok(Self {
            data: WrappedKey::wrap(&keys.data_key, recipient)?,
            metadata: WrappedKey::wrap(&keys.metadata_key, recipient)?,
            auth: WrappedKey::wrap(&keys.auth_key, recipient)?,
        })
    }

    /// Device key pair all three boxes are addressed to.
    pub fn key_id(&self) -> DeviceKeyId {
        self.data.key_id
    }

    pub fn to_bytes(&self) -> SyncResult<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> (X25519StaticSecret, DevicePublicKey) {
        let secret = X25519StaticSecret::from([11u8; 32]);
        let public = DevicePublicKey::from_bytes(X25519PublicKey::from(&secret).to_bytes());
        (secret, public)
    }

    fn agree_with(
        secret: &X25519StaticSecret,
    ) -> impl FnOnce(&DeviceKeyId, &X25519PublicKey) -> SyncResult<Zeroizing<[u8; 32]>> + '_ {
        move |_, peer| Ok(Zeroizing::new(secret.diffie_hellman(peer).to_bytes()))
    }

    #[test]
    fn test_wrap_unwrap() {
        let (secret, public) = device();
        let key = SymmetricKey::generate();

        let wrapped = WrappedKey::wrap(&key, &public).unwrap();
        assert_eq!(wrapped.key_id, public.key_id);

        let unwrapped = wrapped.unwrap_with(agree_with(&secret)).unwrap();
        assert_eq!(unwrapped, key);
    }

    #[test]
    fn test_wrong_device_cannot_unwrap() {
        let (_, public) = device();
        let other = X25519StaticSecret::from([12u8; 32]);
        let wrapped = WrappedKey::wrap(&SymmetricKey::generate(), &public).unwrap();

        assert!(matches!(
            wrapped.unwrap_with(agree_with(&other)),
            Err(SyncError::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_each_wrap_uses_fresh_ephemeral() {
        let (_, public) = device();
        let key = SymmetricKey::generate();
        let a = WrappedKey::wrap(&key, &public).unwrap();
        let b = WrappedKey::wrap(&key, &public).unwrap();
        assert_ne!(a.ephemeral_pk, b.ephemeral_pk);
        assert_ne!(a.sealed, b.sealed);
    }

    #[test]
    fn test_record_keys_bytes_roundtrip() {
        let (secret, public) = device();
        let keys = RecordKeys::generate();
        let wrapped = WrappedRecordKeys::wrap(&keys, &public).unwrap();

        let restored = WrappedRecordKeys::from_bytes(&wrapped.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, wrapped);
        assert_eq!(restored.key_id(), public.key_id);

        let auth = restored.auth.unwrap_with(agree_with(&secret)).unwrap();
        assert_eq!(auth, keys.auth_key);
    }
}
