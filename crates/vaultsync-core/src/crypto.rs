//! Symmetric encryption primitives using ChaCha20-Poly1305 AEAD
//!
//! Every record key, wrapping key and backup key in Vaultsync is a 32-byte
//! [`SymmetricKey`]. [`RecordCrypto`] seals bytes under such a key with a
//! fresh random nonce per call.
//!
//! # Wire Format
//!
//! Sealed data format: `[nonce (12 bytes)] + [ciphertext + auth_tag (16 bytes)]`

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::SyncError;

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size
pub const TAG_SIZE: usize = 16;

/// Key size shared by every symmetric key in the hierarchy
pub const KEY_SIZE: usize = 32;

/// A 32-byte symmetric key, wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_SIZE]);

impl SymmetricKey {
    /// Generate a new random key from the system CSPRNG.
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rng().fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice, rejecting anything but 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, SyncError> {
        let arr: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            SyncError::Crypto(format!(
                "Invalid key length: expected {}, got {}",
                KEY_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(arr))
    }

    /// Raw key bytes (use sparingly)
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Authenticated encryption under a single symmetric key.
///
/// # Example
///
/// ```
/// use vaultsync_core::crypto::{RecordCrypto, SymmetricKey};
///
/// let key = SymmetricKey::generate();
/// let crypto = RecordCrypto::new(&key);
///
/// let sealed = crypto.seal(b"navy shirt").unwrap();
/// assert_eq!(crypto.open(&sealed).unwrap(), b"navy shirt");
/// ```
pub struct RecordCrypto {
    cipher: ChaCha20Poly1305,
}

impl RecordCrypto {
    pub fn new(key: &SymmetricKey) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Encrypt with a freshly generated nonce.
    ///
    /// The output format is: `[nonce (12 bytes)] + [ciphertext + tag]`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SyncError> {
        let nonce_bytes = Self::generate_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| SyncError::Crypto(format!("Encryption failed: {}", e)))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Decrypt data produced by [`seal`](Self::seal).
    ///
    /// Wrong key, tampered bytes and truncated input all fail the same way.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, SyncError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(SyncError::AuthenticationFailed(
                "sealed data too short".to_string(),
            ));
        }

        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        self.cipher
            .decrypt(nonce, &sealed[NONCE_SIZE..])
            .map_err(|_| SyncError::AuthenticationFailed("AEAD tag mismatch".to_string()))
    }

    /// Generate a random 12-byte nonce.
    pub fn generate_nonce() -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }
}
