//! Error types for Vaultsync

use thiserror::Error;
use uuid::Uuid;

/// Failures reported by a remote object store.
///
/// These are surfaced verbatim by the remote adapter; interpreting them
/// (retry, go offline, give up) is the orchestrator's job.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The store refused the write because the account is out of space
    #[error("Quota exceeded: {0}")]
    Quota(String),

    /// A newer version of the record is already stored
    #[error("Write conflict on record {record_id} (stored version {stored_version})")]
    WriteConflict { record_id: Uuid, stored_version: u64 },

    /// The requested record does not exist
    #[error("Record not found: {0}")]
    NotFound(Uuid),

    /// The store could not be reached
    #[error("Remote unavailable: {0}")]
    Unavailable(String),

    /// Any other store-level failure
    #[error("Remote error: {0}")]
    Other(String),
}

impl RemoteError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Other(_))
    }
}

/// Main error type for Vaultsync operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// No network; recoverable by waiting for reachability
    #[error("Offline: the remote store is unreachable")]
    Offline,

    /// Envelope tag mismatch; the record is corrupted or tampered
    #[error("Authentication failed: record {0} was corrupted or tampered with")]
    AuthenticationFailed(String),

    /// Key unlock needs a fresh user-presence check
    #[error("User presence required to unlock device keys")]
    UserPresenceRequired,

    /// Store-level error from the remote adapter
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// A conflict is still waiting for a manual decision
    #[error("Conflict unresolved: {0}")]
    ConflictUnresolved(Uuid),

    /// Key rotation is not reentrant
    #[error("Key rotation already in progress")]
    RotationInProgress,

    /// No key material exists for the requested record or key id
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// A sync cycle for this record type is already running
    #[error("Sync already in progress for record type {0}")]
    SyncInProgress(String),

    /// The cycle was cancelled between record operations
    #[error("Sync cancelled")]
    Cancelled,

    /// Storage error (redb or local store collaborator)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed (other than tag verification)
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation for current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SyncError {
    /// Conditions that pause a sync cycle instead of failing it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::Offline
                | SyncError::UserPresenceRequired
                | SyncError::Remote(RemoteError::Unavailable(_))
        )
    }
}

impl From<postcard::Error> for SyncError {
    fn from(e: postcard::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::SyncInProgress("collection_item".to_string());
        assert_eq!(
            format!("{}", err),
            "Sync already in progress for record type collection_item"
        );
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let sync_err: SyncError = io_err.into();
        assert!(matches!(sync_err, SyncError::Io(_)));
    }

    #[test]
    fn test_remote_error_is_transparent() {
        let err: SyncError = RemoteError::Quota("5 GB".to_string()).into();
        assert_eq!(err.to_string(), "Quota exceeded: 5 GB");
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(SyncError::Offline.is_recoverable());
        assert!(SyncError::UserPresenceRequired.is_recoverable());
        assert!(SyncError::Remote(RemoteError::Unavailable("dns".into())).is_recoverable());
        assert!(!SyncError::AuthenticationFailed("x".into()).is_recoverable());
        assert!(!SyncError::RotationInProgress.is_recoverable());
    }

    #[test]
    fn test_only_generic_remote_errors_are_transient() {
        assert!(RemoteError::Other("500".into()).is_transient());
        assert!(!RemoteError::Quota("full".into()).is_transient());
        assert!(!RemoteError::NotFound(Uuid::nil()).is_transient());
    }
}
