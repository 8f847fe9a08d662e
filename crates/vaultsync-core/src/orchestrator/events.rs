//! Sync status and the event stream consumers subscribe to
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  SyncStatus: the orchestrator's state machine                    │
//! │  Idle ─▶ Syncing ─▶ Uploading(p) ─▶ Syncing ─▶ Downloading(p)    │
//! │       ─▶ Resolving (conflicts queued) ─▶ Completed               │
//! │  any step ─▶ Error(reason) | Offline                             │
//! │                                                                  │
//! │  SyncEvent: notifications on the broadcast channel               │
//! │  ├── StatusChanged: every state transition                       │
//! │  ├── ConflictQueued / ConflictResolved                           │
//! │  ├── RecordRejected: envelope failed authentication              │
//! │  ├── PresenceRequired: the key session needs a presence check    │
//! │  └── KeysRotated: a new device key pair is current               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use uuid::Uuid;

use crate::conflict::{ConflictKind, ResolutionChoice};
use crate::keys::DeviceKeyId;
use crate::types::{Progress, RecordId, RecordType};

/// State of the sync orchestrator
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Uploading(Progress),
    Downloading(Progress),
    /// Conflicts are waiting for a manual decision
    Resolving,
    /// The last cycle finished with an empty conflict queue
    Completed,
    Error(String),
    /// Waiting for the network; resumes automatically
    Offline,
}

impl SyncStatus {
    /// Whether a cycle is between `Syncing` and its end state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncStatus::Syncing | SyncStatus::Uploading(_) | SyncStatus::Downloading(_)
        )
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Idle => write!(f, "Idle"),
            SyncStatus::Syncing => write!(f, "Syncing"),
            SyncStatus::Uploading(p) => write!(f, "Uploading ({})", p),
            SyncStatus::Downloading(p) => write!(f, "Downloading ({})", p),
            SyncStatus::Resolving => write!(f, "Resolving"),
            SyncStatus::Completed => write!(f, "Completed"),
            SyncStatus::Error(msg) => write!(f, "Error: {}", msg),
            SyncStatus::Offline => write!(f, "Offline"),
        }
    }
}

/// Events emitted by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StatusChanged(SyncStatus),
    ConflictQueued {
        conflict_id: Uuid,
        record_id: RecordId,
        record_type: RecordType,
        kind: ConflictKind,
    },
    ConflictResolved {
        conflict_id: Uuid,
        record_id: RecordId,
        /// `None` when settled automatically by last-write-wins
        choice: Option<ResolutionChoice>,
    },
    /// A pulled envelope failed authentication and was not applied
    RecordRejected { record_id: RecordId, reason: String },
    /// The cycle paused because the key session is locked
    PresenceRequired { record_type: RecordType },
    KeysRotated { key_id: DeviceKeyId },
}

impl SyncEvent {
    /// Get the record ID associated with this event, if any
    pub fn record_id(&self) -> Option<&RecordId> {
        match self {
            SyncEvent::ConflictQueued { record_id, .. } => Some(record_id),
            SyncEvent::ConflictResolved { record_id, .. } => Some(record_id),
            SyncEvent::RecordRejected { record_id, .. } => Some(record_id),
            SyncEvent::StatusChanged(_)
            | SyncEvent::PresenceRequired { .. }
            | SyncEvent::KeysRotated { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_default_is_idle() {
        let status: SyncStatus = Default::default();
        assert_eq!(status, SyncStatus::Idle);
    }

    #[test]
    fn test_sync_status_display() {
        assert_eq!(format!("{}", SyncStatus::Idle), "Idle");
        assert_eq!(
            format!("{}", SyncStatus::Uploading(Progress::new(2, 5))),
            "Uploading (2/5)"
        );
        assert_eq!(
            format!("{}", SyncStatus::Error("quota exceeded".to_string())),
            "Error: quota exceeded"
        );
        assert_eq!(format!("{}", SyncStatus::Offline), "Offline");
    }

    #[test]
    fn test_is_active() {
        assert!(SyncStatus::Syncing.is_active());
        assert!(SyncStatus::Downloading(Progress::default()).is_active());
        assert!(!SyncStatus::Resolving.is_active());
        assert!(!SyncStatus::Offline.is_active());
    }

    #[test]
    fn test_sync_event_record_id() {
        let record_id = RecordId::new();
        let event = SyncEvent::RecordRejected {
            record_id,
            reason: "tag mismatch".into(),
        };
        assert_eq!(event.record_id(), Some(&record_id));
        assert_eq!(SyncEvent::StatusChanged(SyncStatus::Idle).record_id(), None);
    }
}
