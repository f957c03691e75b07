use fieldsync_types::{LocalId, RecordId, RemoteId};
use proptest::prelude::*;
use std::collections::HashSet;
use std::str::FromStr;

// ── LocalId ───────────────────────────────────────────────────────

#[test]
fn local_id_new_is_unique() {
    let a = LocalId::new();
    let b = LocalId::new();
    assert_ne!(a, b);
}

#[test]
fn local_id_display_carries_prefix() {
    let id = LocalId::new();
    assert!(id.to_string().starts_with("local:"));
}

#[test]
fn local_id_parses_with_and_without_prefix() {
    let id = LocalId::new();
    let with_prefix: LocalId = id.to_string().parse().unwrap();
    let bare: LocalId = id.as_uuid().to_string().parse().unwrap();
    assert_eq!(with_prefix, id);
    assert_eq!(bare, id);
}

// ── RemoteId ──────────────────────────────────────────────────────

#[test]
fn remote_id_display_and_parse() {
    let id = RemoteId::generate();
    let parsed = RemoteId::parse(&id.to_string()).unwrap();
    assert_eq!(id, parsed);
}

#[test]
fn remote_id_parse_invalid() {
    assert!(RemoteId::parse("not-a-uuid").is_err());
    assert!(RemoteId::from_str("").is_err());
}

// ── RecordId ──────────────────────────────────────────────────────

#[test]
fn minted_record_id_is_local() {
    let id = RecordId::mint();
    assert!(id.is_local());
    assert!(!id.is_remote());
    assert!(id.as_local().is_some());
    assert!(id.as_remote().is_none());
}

#[test]
fn record_id_from_str_distinguishes_kinds() {
    let local = RecordId::mint();
    let remote = RecordId::from(RemoteId::generate());

    assert_eq!(RecordId::from_str(&local.to_string()).unwrap(), local);
    assert_eq!(RecordId::from_str(&remote.to_string()).unwrap(), remote);
    assert!(RecordId::from_str(&local.to_string()).unwrap().is_local());
    assert!(RecordId::from_str(&remote.to_string()).unwrap().is_remote());
}

#[test]
fn record_id_serializes_as_plain_string() {
    let local = RecordId::mint();
    let json = serde_json::to_value(local).unwrap();
    assert_eq!(json, serde_json::Value::String(local.to_string()));

    let back: RecordId = serde_json::from_value(json).unwrap();
    assert_eq!(back, local);
}

#[test]
fn record_id_rejects_garbage_json() {
    let result: Result<RecordId, _> = serde_json::from_str("\"local:garbage\"");
    assert!(result.is_err());
}

#[test]
fn promote_local_to_canonical() {
    let local = RecordId::mint();
    let canonical = RemoteId::generate();

    let promoted = local.promote(canonical).unwrap();
    assert_eq!(promoted, RecordId::Remote(canonical));
}

#[test]
fn promote_canonical_is_rejected() {
    let remote = RecordId::from(RemoteId::generate());
    assert!(remote.promote(RemoteId::generate()).is_err());
}

#[test]
fn is_local_key_checks_prefix() {
    assert!(RecordId::is_local_key(&RecordId::mint().to_string()));
    assert!(!RecordId::is_local_key(&RemoteId::generate().to_string()));
}

#[test]
fn record_id_hash_and_eq() {
    let id = RecordId::mint();
    let mut set = HashSet::new();
    set.insert(id);
    set.insert(id);
    assert_eq!(set.len(), 1);
}

proptest! {
    #[test]
    fn any_uuid_keeps_its_kind_through_a_string(bits in any::<u128>(), local in any::<bool>()) {
        let uuid = uuid::Uuid::from_u128(bits);
        let id = if local {
            RecordId::Local(LocalId::from_uuid(uuid))
        } else {
            RecordId::Remote(RemoteId::from_uuid(uuid))
        };
        let parsed: RecordId = id.to_string().parse().unwrap();
        prop_assert_eq!(parsed, id);
        prop_assert_eq!(parsed.is_local(), local);
    }
}
