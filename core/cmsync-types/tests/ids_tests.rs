use cmsync_types::{ExternalId, LocaleId, RemoteId, RunId};
use std::collections::HashSet;
use std::str::FromStr;

// ── String ids ────────────────────────────────────────────────────

#[test]
fn remote_id_display_matches_input() {
    let id = RemoteId::new("64f1c0ffee");
    assert_eq!(id.to_string(), "64f1c0ffee");
    assert_eq!(id.as_str(), "64f1c0ffee");
}

#[test]
fn parse_trims_whitespace() {
    let id = ExternalId::parse("  c1 ").unwrap();
    assert_eq!(id.as_str(), "c1");
}

#[test]
fn parse_rejects_blank() {
    assert!(ExternalId::parse("").is_err());
    assert!(LocaleId::parse("   ").is_err());
}

#[test]
fn from_str_uses_parse() {
    let id = RemoteId::from_str("abc").unwrap();
    assert_eq!(id, RemoteId::new("abc"));
    assert!(RemoteId::from_str("").is_err());
}

#[test]
fn new_does_not_validate() {
    let id = ExternalId::new("");
    assert!(id.is_blank());
}

#[test]
fn serde_is_transparent() {
    let id = LocaleId::new("loc-en");
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, "\"loc-en\"");
    let back: LocaleId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn string_ids_hash_and_eq() {
    let mut set = HashSet::new();
    set.insert(RemoteId::new("a"));
    set.insert(RemoteId::from("a"));
    set.insert(RemoteId::from("b".to_string()));
    assert_eq!(set.len(), 2);
}

#[test]
fn string_ids_order_lexically() {
    let mut ids = vec![ExternalId::new("c2"), ExternalId::new("a1"), ExternalId::new("b9")];
    ids.sort();
    assert_eq!(ids, vec![ExternalId::new("a1"), ExternalId::new("b9"), ExternalId::new("c2")]);
}

// ── RunId ─────────────────────────────────────────────────────────

#[test]
fn run_id_new_is_unique() {
    let a = RunId::new();
    let b = RunId::new();
    assert_ne!(a, b);
}

#[test]
fn run_id_display_and_parse() {
    let id = RunId::new();
    let parsed: RunId = id.to_string().parse().unwrap();
    assert_eq!(id, parsed);
}

#[test]
fn run_id_parse_invalid() {
    assert!(RunId::from_str("not-a-uuid").is_err());
}

#[test]
fn run_ids_are_time_ordered() {
    let a = RunId::new();
    std::thread::sleep(std::time::Duration::from_millis(2));
    let b = RunId::new();
    assert!(a.as_uuid() < b.as_uuid());
}
