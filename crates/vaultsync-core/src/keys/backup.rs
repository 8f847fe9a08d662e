//! Passphrase-protected export of record keys
//!
//! The only form in which key material leaves a device. Record keys are
//! serialized with postcard, sealed under a key derived from the passphrase
//! with Argon2id, and the result is rendered as base64 text.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, Zeroizing};

use crate::config::BackupSettings;
use crate::crypto::{RecordCrypto, SymmetricKey, KEY_SIZE};
use crate::envelope::RecordKeys;
use crate::error::{SyncError, SyncResult};
use crate::types::RecordId;

const BACKUP_FORMAT: &str = "vaultsync-backup";
const BACKUP_VERSION: u32 = 1;
const SALT_SIZE: usize = 16;

/// Argon2id parameters stored alongside the sealed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub salt: String,
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// Fresh random salt with the configured costs.
    pub fn generate(settings: &BackupSettings) -> Self {
        let mut salt = [0u8; SALT_SIZE];
        rand::rng().fill_bytes(&mut salt);
        Self {
            salt: hex::encode(salt),
            mem_cost_kib: settings.mem_cost_kib,
            time_cost: settings.time_cost,
            parallelism: settings.parallelism,
        }
    }

    /// Derive the backup key from a passphrase.
    pub fn derive_key(&self, passphrase: &str) -> SyncResult<SymmetricKey> {
        let salt = hex::decode(&self.salt)
            .map_err(|e| SyncError::Serialization(format!("Invalid backup salt: {}", e)))?;
        let params = Params::new(
            self.mem_cost_kib,
            self.time_cost,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| SyncError::Crypto(format!("Invalid Argon2 parameters: {}", e)))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut output = Zeroizing::new([0u8; KEY_SIZE]);
        argon2
            .hash_password_into(passphrase.as_bytes(), &salt, output.as_mut())
            .map_err(|e| SyncError::Crypto(format!("Key derivation failed: {}", e)))?;
        Ok(SymmetricKey::from_bytes(*output))
    }
}

/// Outer, human-transportable backup document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupFile {
    format: String,
    version: u32,
    kdf: KdfParams,
    /// base64 of the sealed postcard payload
    sealed: String,
}

#[derive(Serialize, Deserialize)]
struct BackupEntry {
    id: RecordId,
    data: [u8; KEY_SIZE],
    metadata: [u8; KEY_SIZE],
    auth: [u8; KEY_SIZE],
}

impl Drop for BackupEntry {
    fn drop(&mut self) {
        self.data.zeroize();
        self.metadata.zeroize();
        self.auth.zeroize();
    }
}

/// Seal record keys under `passphrase`.
pub fn seal_backup(
    records: &[(RecordId, RecordKeys)],
    passphrase: &str,
    settings: &BackupSettings,
) -> SyncResult<String> {
    if passphrase.is_empty() {
        return Err(SyncError::InvalidOperation(
            "Backup passphrase must not be empty".to_string(),
        ));
    }

    let entries: Vec<BackupEntry> = records
        .iter()
        .map(|(id, keys)| BackupEntry {
            id: *id,
            data: *keys.data_key.as_bytes(),
            metadata: *keys.metadata_key.as_bytes(),
            auth: *keys.auth_key.as_bytes(),
        })
        .collect();
    let payload = Zeroizing::new(postcard::to_allocvec(&entries)?);

    let kdf = KdfParams::generate(settings);
    let key = kdf.derive_key(passphrase)?;
    let sealed = RecordCrypto::new(&key).seal(&payload)?;

    let file = BackupFile {
        format: BACKUP_FORMAT.to_string(),
        version: BACKUP_VERSION,
        kdf,
        sealed: BASE64.encode(sealed),
    };
    Ok(BASE64.encode(serde_json::to_vec(&file)?))
}

/// Open a backup produced by [`seal_backup`].
///
/// A wrong passphrase fails with `AuthenticationFailed`.
pub fn open_backup(data: &str, passphrase: &str) -> SyncResult<Vec<(RecordId, RecordKeys)>> {
    let json = BASE64
        .decode(data.trim())
        .map_err(|e| SyncError::Serialization(format!("Backup is not valid base64: {}", e)))?;
    let file: BackupFile = serde_json::from_slice(&json)?;

    if file.format != BACKUP_FORMAT {
        return Err(SyncError::Serialization(format!(
            "Unknown backup format: {}",
            file.format
        )));
    }
    if file.version != BACKUP_VERSION {
        return Err(SyncError::Serialization(format!(
            "Unsupported backup version: {}",
            file.version
        )));
    }

    let sealed = BASE64
        .decode(&file.sealed)
        .map_err(|e| SyncError::Serialization(format!("Backup payload is not valid base64: {}", e)))?;
    let key = file.kdf.derive_key(passphrase)?;
    let payload = Zeroizing::new(
        RecordCrypto::new(&key)
            .open(&sealed)
            .map_err(|_| SyncError::AuthenticationFailed("backup".to_string()))?,
    );

    let entries: Vec<BackupEntry> = postcard::from_bytes(&payload)?;
    Ok(entries
        .iter()
        .map(|entry| {
            (
                entry.id,
                RecordKeys {
                    data_key: SymmetricKey::from_bytes(entry.data),
                    metadata_key: SymmetricKey::from_bytes(entry.metadata),
                    auth_key: SymmetricKey::from_bytes(entry.auth),
                },
            )
        })
        .collect())
}
