//! Property-based tests for the envelope codec and conflict resolver
//!
//! Uses proptest to check the invariants every sync cycle relies on.

use std::collections::BTreeSet;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::{json, Value};
use vaultsync_core::{
    ConflictResolver, DeviceId, EncryptedRecord, EnvelopeCodec, EnvelopeHeader, Record,
    RecordId, RecordKeys, RecordType, ResolutionChoice, SyncError, SyncMetadata,
};

// ============================================================================
// Strategy Generators
// ============================================================================

fn record_type_strategy() -> impl Strategy<Value = RecordType> {
    prop_oneof![
        Just(RecordType::collection_item()),
        Just(RecordType::preference_profile()),
        Just(RecordType::vault_item()),
    ]
}

/// Small JSON bodies: objects of short strings and tag arrays
fn body_strategy() -> impl Strategy<Value = Value> {
    (
        "[a-z]{1,12}",
        prop::collection::vec("[a-z]{1,8}", 0..4),
        any::<u16>(),
    )
        .prop_map(|(name, tags, size)| json!({ "name": name, "tags": tags, "size": size }))
}

fn record_strategy() -> impl Strategy<Value = Record> {
    (record_type_strategy(), body_strategy(), 1u64..50, 0i64..1_000_000).prop_map(
        |(record_type, body, version, secs)| {
            let mut record = Record::new(record_type, body);
            record.version = version;
            record.last_modified = Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap();
            record
        },
    )
}

/// How one side of a synced record has moved on from the shared base
#[derive(Debug, Clone)]
enum Edit {
    Untouched,
    Update(Value),
    Delete,
    Migrate(Value),
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        2 => Just(Edit::Untouched),
        4 => body_strategy().prop_map(Edit::Update),
        1 => Just(Edit::Delete),
        1 => body_strategy().prop_map(Edit::Migrate),
    ]
}

fn apply_edit(base: &Record, edit: &Edit, offset_secs: i64) -> Record {
    let mut next = match edit {
        Edit::Untouched => return base.clone(),
        Edit::Update(body) => base.updated(body.clone()),
        Edit::Delete => base.tombstone(),
        Edit::Migrate(body) => {
            let mut migrated = base.updated(body.clone());
            migrated.schema_version += 1;
            migrated
        }
    };
    next.last_modified = base.last_modified + Duration::seconds(offset_secs);
    next
}

/// Local and remote record sets that share some ids and diverge on some.
fn divergent_sets_strategy() -> impl Strategy<Value = (Vec<Record>, Vec<Record>)> {
    prop::collection::vec(
        (record_strategy(), edit_strategy(), edit_strategy(), 1i64..100, 1i64..100),
        0..12,
    )
    .prop_map(|entries| {
        let mut local = Vec::new();
        let mut remote = Vec::new();
        for (base, local_edit, remote_edit, local_offset, remote_offset) in entries {
            local.push(apply_edit(&base, &local_edit, local_offset));
            remote.push(apply_edit(&base, &remote_edit, remote_offset));
        }
        (local, remote)
    })
}

// ============================================================================
// Helpers
// ============================================================================

fn seal(record: &Record, keys: &RecordKeys) -> EncryptedRecord {
    let body = record.encode_body().unwrap();
    let metadata = SyncMetadata {
        record_type: record.record_type.clone(),
        version: record.version,
        size_bytes: body.len() as u64,
        timestamp: record.last_modified,
        device_id: DeviceId::new(),
    };
    let header = EnvelopeHeader {
        id: record.id,
        record_type: record.record_type.clone(),
        version: record.version,
        base_version: 0,
        last_modified: record.last_modified,
    };
    EnvelopeCodec::new()
        .encrypt(header, &body, &metadata, keys)
        .unwrap()
}

fn open(envelope: &EncryptedRecord, keys: &RecordKeys) -> Result<Record, SyncError> {
    let (plaintext, _) = EnvelopeCodec::new().decrypt(envelope, keys)?;
    Ok(Record::decode_body(
        envelope.id,
        envelope.record_type.clone(),
        envelope.version,
        envelope.last_modified,
        &plaintext,
    )?)
}

fn ids(conflicts: &[vaultsync_core::SyncConflict]) -> BTreeSet<RecordId> {
    conflicts.iter().map(|c| c.record_id).collect()
}

// ============================================================================
// Envelope Properties
// ============================================================================

proptest! {
    /// Any record survives encrypt then decrypt under the same keys
    #[test]
    fn envelope_roundtrip(record in record_strategy()) {
        let keys = RecordKeys::generate();
        let envelope = seal(&record, &keys);
        prop_assert_eq!(open(&envelope, &keys).unwrap(), record);
    }

    /// Flipping any single bit of any sealed part is detected
    #[test]
    fn any_bit_flip_is_rejected(
        record in record_strategy(),
        part in 0usize..3,
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let keys = RecordKeys::generate();
        let mut envelope = seal(&record, &keys);

        let target = match part {
            0 => &mut envelope.encrypted_data,
            1 => &mut envelope.encrypted_metadata,
            _ => &mut envelope.authentication_tag,
        };
        let index = position.index(target.len());
        target[index] ^= 1 << bit;

        let result = EnvelopeCodec::new().decrypt(&envelope, &keys);
        prop_assert!(matches!(result, Err(SyncError::AuthenticationFailed(_))));
    }

    /// Sealing the same record twice never repeats ciphertext
    #[test]
    fn fresh_nonce_per_encryption(record in record_strategy()) {
        let keys = RecordKeys::generate();
        let first = seal(&record, &keys);
        let second = seal(&record, &keys);
        prop_assert_ne!(&first.encrypted_data, &second.encrypted_data);
        prop_assert_ne!(&first.encrypted_metadata, &second.encrypted_metadata);
        prop_assert_ne!(&first.authentication_tag, &second.authentication_tag);
    }

    /// Keys of another record never open an envelope
    #[test]
    fn foreign_keys_are_rejected(record in record_strategy()) {
        let envelope = seal(&record, &RecordKeys::generate());
        let result = open(&envelope, &RecordKeys::generate());
        prop_assert!(matches!(result, Err(SyncError::AuthenticationFailed(_))));
    }
}

// ============================================================================
// Conflict Properties
// ============================================================================

proptest! {
    /// Detection reports the same ids and kinds in either direction
    #[test]
    fn detection_is_symmetric((local, remote) in divergent_sets_strategy()) {
        let resolver = ConflictResolver::default();
        let forward = resolver.detect(&local, &remote);
        let backward = resolver.detect(&remote, &local);

        prop_assert_eq!(ids(&forward), ids(&backward));
        for (f, b) in forward.iter().zip(backward.iter()) {
            prop_assert_eq!(f.record_id, b.record_id);
            prop_assert_eq!(f.kind, b.kind);
        }
    }

    /// Resolving one conflict twice with one choice gives one record
    #[test]
    fn resolution_is_idempotent(
        (local, remote) in divergent_sets_strategy(),
        choice in prop_oneof![
            Just(ResolutionChoice::UseLocal),
            Just(ResolutionChoice::UseRemote),
            Just(ResolutionChoice::Merge),
        ],
    ) {
        let resolver = ConflictResolver::default();
        for conflict in resolver.detect(&local, &remote) {
            let first = resolver.resolve(&conflict, choice).unwrap();
            let second = resolver.resolve(&conflict, choice).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(
                first.version,
                conflict.local.version.max(conflict.remote.version) + 1
            );
        }
    }

    /// Automatic resolution only settles data conflicts, and picks the later edit
    #[test]
    fn auto_resolution_prefers_later_edit((local, remote) in divergent_sets_strategy()) {
        let resolver = ConflictResolver::default();
        for conflict in resolver.detect(&local, &remote) {
            match resolver.auto_resolve(&conflict) {
                Some(resolved) => {
                    prop_assert!(conflict.auto_resolvable());
                    let winner = if conflict.remote.last_modified >= conflict.local.last_modified {
                        &conflict.remote
                    } else {
                        &conflict.local
                    };
                    if conflict.remote.last_modified != conflict.local.last_modified {
                        prop_assert_eq!(&resolved.body, &winner.body);
                    }
                }
                None => prop_assert!(!conflict.auto_resolvable()),
            }
        }
    }
}
