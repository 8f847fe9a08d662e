//! Vaultsync Core Library
//!
//! Zero-knowledge sync of personal records to an untrusted object store.
//!
//! ## Overview
//!
//! Every record leaves the device as an [`EncryptedRecord`]: payload and
//! metadata sealed under per-record keys, bound together by a keyed BLAKE3
//! tag. The remote store sees ids, types, versions and timestamps, nothing
//! else. Per-record keys are wrapped to a device key pair that lives inside a
//! [`SecureKeyStore`]; unlocking them requires a user-presence check.
//!
//! ```text
//! ┌────────────────────────────── SyncOrchestrator ───────────────────────────┐
//! │  LocalStore ─▶ EnvelopeCodec ─▶ RemoteAdapter ─▶ RemoteStore (untrusted)  │
//! │                    ▲                  │                                   │
//! │               KeyManager        ConflictResolver                          │
//! │            (SecureKeyStore)    (LWW + merge rules)                        │
//! │                                                                           │
//! │  NetworkMonitor ── Online/Offline ──▶ pause / resume incremental sync    │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use vaultsync_core::*;
//!
//! let storage = Storage::new("~/.vaultsync/local.redb")?;
//! let store = SoftwareKeyStore::open(storage.clone(), AlwaysPresent)?;
//! let keys = Arc::new(KeyManager::new(
//!     Arc::new(store),
//!     Arc::new(storage.clone()),
//!     KeySettings::default(),
//!     BackupSettings::default(),
//! ));
//! let remote = Arc::new(FileRemoteStore::open("~/.vaultsync/remote.redb")?);
//! let orchestrator = SyncOrchestrator::builder(
//!     keys,
//!     remote,
//!     Arc::new(storage.clone()),
//!     Arc::new(storage),
//! )
//! .build();
//!
//! let report = orchestrator.request_sync(RecordType::collection_item()).await?;
//! println!("uploaded {} records", report.uploaded);
//! ```

pub mod config;
pub mod conflict;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod local;
pub mod logging;
pub mod network;
pub mod orchestrator;
pub mod remote;
pub mod storage;
pub mod types;

// Re-exports
pub use config::{BackupSettings, KeySettings, NetworkSettings, SyncConfig, SyncSettings};
pub use conflict::{
    ConflictKind, ConflictResolver, KeyUnionMerge, MergeRegistry, MergeRule, ResolutionChoice,
    SetUnionMerge, SyncConflict,
};
pub use crypto::SymmetricKey;
pub use envelope::{EncryptedRecord, EnvelopeCodec, EnvelopeHeader, RecordKeys, SyncMetadata};
pub use error::{RemoteError, SyncError, SyncResult};
pub use keys::{
    AlwaysPresent, DeviceKeyId, DevicePublicKey, KeyManager, MemoryWrappedKeys, PresenceGate,
    PresenceOutcome, SecureKeyStore, SoftwareKeyStore, WrappedKeyStore,
};
pub use local::{CheckpointStore, LocalStore, MemoryCheckpoints, MemoryLocalStore, SyncCheckpoint};
pub use network::{NetworkMonitor, Reachability, ReachabilityProbe, TcpProbe};
pub use orchestrator::{SyncEvent, SyncMode, SyncOrchestrator, SyncReport, SyncStatus};
pub use remote::{
    FileRemoteStore, MemoryRemoteStore, PushReport, RemoteAdapter, RemoteChanges, RemoteStore,
};
pub use storage::Storage;
pub use types::*;
