//! Record envelopes: the only form in which a record leaves the device
//!
//! ## Security Model
//!
//! Uses **Encrypt-then-MAC** over two independently sealed parts:
//! 1. Seal the payload with `data_key` (ChaCha20-Poly1305, random nonce)
//! 2. Serialize [`SyncMetadata`] with postcard and seal it with `metadata_key`
//! 3. Compute a BLAKE3 keyed hash under `auth_key` binding both ciphertexts
//!
//! Opening verifies the binding tag in constant time before either
//! ciphertext is touched, so a swapped, truncated or bit-flipped part is
//! rejected without partial decryption.
//!
//! ## Tag Input
//!
//! ```text
//! +--------------------------+----------------+--------------------+
//! | len(encrypted_data) u64  | encrypted_data | encrypted_metadata |
//! | (8 bytes, little-endian) | (variable)     | (variable)         |
//! +--------------------------+----------------+--------------------+
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{RecordCrypto, SymmetricKey};
use crate::error::SyncError;
use crate::types::{DeviceId, RecordId, RecordType};

/// Length of the BLAKE3 authentication tag
pub const AUTH_TAG_SIZE: usize = 32;

/// The three symmetric keys protecting one record.
#[derive(Clone, Debug)]
pub struct RecordKeys {
    pub data_key: SymmetricKey,
    pub metadata_key: SymmetricKey,
    pub auth_key: SymmetricKey,
}

impl RecordKeys {
    /// Generate a fresh, independent key triple.
    pub fn generate() -> Self {
        Self {
            data_key: SymmetricKey::generate(),
            metadata_key: SymmetricKey::generate(),
            auth_key: SymmetricKey::generate(),
        }
    }
}

/// Plaintext diagnostics that travel encrypted alongside the payload.
///
/// `version` and `timestamp` are sealed copies of the routing fields; a
/// reader compares them against the plaintext ones after opening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    pub record_type: RecordType,
    pub version: u64,
    pub size_bytes: u64,
    pub timestamp: DateTime<Utc>,
    pub device_id: DeviceId,
}

/// Opaque envelope as stored by the remote object store.
///
/// Only `id`, `record_type`, `version`, `base_version` and `last_modified`
/// are readable by the store; everything else is ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedRecord {
    pub id: RecordId,
    pub record_type: RecordType,
    pub encrypted_data: Vec<u8>,
    pub encrypted_metadata: Vec<u8>,
    pub authentication_tag: Vec<u8>,
    pub version: u64,
    /// Stored version this write replaces; 0 for a record never synced
    pub base_version: u64,
    pub last_modified: DateTime<Utc>,
}

impl EncryptedRecord {
    /// Total ciphertext size, as reported to the store for routing.
    pub fn size_bytes(&self) -> usize {
        self.encrypted_data.len() + self.encrypted_metadata.len() + self.authentication_tag.len()
    }
}

/// Routing fields the caller supplies when sealing a record.
#[derive(Debug, Clone)]
pub struct EnvelopeHeader {
    pub id: RecordId,
    pub record_type: RecordType,
    pub version: u64,
    pub base_version: u64,
    pub last_modified: DateTime<Utc>,
}

/// Stateless envelope codec.
///
/// Holds no key material; every call receives the [`RecordKeys`] it needs,
/// which makes it safe to share across worker tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self
    }

    /// Seal a payload and its metadata into an [`EncryptedRecord`].
    pub fn encrypt(
        &self,
        header: EnvelopeHeader,
        plaintext: &[u8],
        metadata: &SyncMetadata,
        keys: &RecordKeys,
    ) -> Result<EncryptedRecord, SyncError> {
        let encrypted_data = RecordCrypto::new(&keys.data_key).seal(plaintext)?;

        let metadata_bytes = postcard::to_allocvec(metadata)?;
        let encrypted_metadata = RecordCrypto::new(&keys.metadata_key).seal(&metadata_bytes)?;

        let tag = compute_tag(&keys.auth_key, &encrypted_data, &encrypted_metadata);

        Ok(EncryptedRecord {
            id: header.id,
            record_type: header.record_type,
            encrypted_data,
            encrypted_metadata,
            authentication_tag: tag.as_bytes().to_vec(),
            version: header.version,
            base_version: header.base_version,
            last_modified: header.last_modified,
        })
    }

    /// Verify and open an envelope.
    ///
    /// # Errors
    ///
    /// `SyncError::AuthenticationFailed` when the tag does not verify or
    /// either part fails to open. No plaintext is returned in that case.
    pub fn decrypt(
        &self,
        record: &EncryptedRecord,
        keys: &RecordKeys,
    ) -> Result<(Vec<u8>, SyncMetadata), SyncError> {
        let rejected = || SyncError::AuthenticationFailed(record.id.to_string());

        let stored: [u8; AUTH_TAG_SIZE] = record
            .authentication_tag
            .as_slice()
            .try_into()
            .map_err(|_| rejected())?;
        let expected = compute_tag(
            &keys.auth_key,
            &record.encrypted_data,
            &record.encrypted_metadata,
        );
        // blake3::Hash equality is constant-time
        if expected != blake3::Hash::from(stored) {
            return Err(rejected());
        }

        let plaintext = RecordCrypto::new(&keys.data_key)
            .open(&record.encrypted_data)
            .map_err(|_| rejected())?;
        let metadata_bytes = RecordCrypto::new(&keys.metadata_key)
            .open(&record.encrypted_metadata)
            .map_err(|_| rejected())?;
        let metadata: SyncMetadata =
            postcard::from_bytes(&metadata_bytes).map_err(|_| rejected())?;

        Ok((plaintext, metadata))
    }
}

fn compute_tag(auth_key: &SymmetricKey, data: &[u8], metadata: &[u8]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new_keyed(auth_key.as_bytes());
    hasher.update(&(data.len() as u64).to_le_bytes());
    hasher.update(data);
    hasher.update(metadata);
    hasher.finalize()
}
