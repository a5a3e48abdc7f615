#![forbid(unsafe_code)]

use mnemo_kernel_contracts::envelope::{
    EncryptedEnvelope, AUTH_TAG_LEN, ENCRYPTION_VERSION_V1, IV_LEN,
};
use mnemo_kernel_contracts::memory::{Attributes, MemoryKind, MemoryRecord, RecordFilter, RecordId};
use mnemo_kernel_contracts::tier::{DisclosureTier, SubjectPseudonym};
use mnemo_kernel_contracts::MonotonicTimeNs;
use mnemo_storage::memory_store::InMemoryMemoryStore;
use mnemo_storage::repo::MemoryStoreRepo;
use serde_json::json;

fn subject(c: char) -> SubjectPseudonym {
    SubjectPseudonym::from_hex(c.to_string().repeat(64)).unwrap()
}

fn envelope() -> EncryptedEnvelope {
    EncryptedEnvelope {
        ciphertext: vec![9; 8],
        auth_tag: vec![0; AUTH_TAG_LEN],
        iv: vec![0; IV_LEN],
        wrapped_data_key: vec![1; 60],
        master_key_id: "mk-1".to_string(),
        encryption_version: ENCRYPTION_VERSION_V1,
    }
}

fn record(id: &str, who: char, tier: DisclosureTier, mood: &str, at: u64) -> MemoryRecord {
    let mut attributes = Attributes::new();
    attributes.insert("mood".to_string(), json!(mood));
    MemoryRecord {
        record_id: RecordId::new(id).unwrap(),
        subject: subject(who),
        tier,
        kind: MemoryKind::new("check_in").unwrap(),
        envelope: envelope(),
        attributes,
        created_at: MonotonicTimeNs(at),
    }
}

fn seeded() -> InMemoryMemoryStore {
    let s = InMemoryMemoryStore::new();
    s.store(record("rec_1", 'a', DisclosureTier::Personal, "calm", 1)).unwrap();
    s.store(record("rec_2", 'a', DisclosureTier::Cohort, "tense", 2)).unwrap();
    s.store(record("rec_3", 'b', DisclosureTier::Cohort, "calm", 3)).unwrap();
    s.store(record("rec_4", 'c', DisclosureTier::Population, "calm", 4)).unwrap();
    s
}

#[test]
fn at_store_db_01_recall_by_subject_spans_tiers() {
    let s = seeded();
    let rows = s.recall(&RecordFilter::for_subject(subject('a'))).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.subject == subject('a')));
}

#[test]
fn at_store_db_02_count_respects_tier_and_attributes() {
    let s = seeded();
    let mut f = RecordFilter::for_tier(DisclosureTier::Cohort);
    assert_eq!(s.count(&f).unwrap(), 2);
    f.attributes.insert("mood".to_string(), json!("calm"));
    assert_eq!(s.count(&f).unwrap(), 1);
}

#[test]
fn at_store_db_03_delete_removes_only_the_subjects_rows() {
    let s = seeded();
    let deleted = s.delete(&RecordFilter::for_subject(subject('a'))).unwrap();
    assert_eq!(deleted.len(), 2);
    assert_eq!(s.len(), 2);
    assert!(s
        .recall(&RecordFilter::for_subject(subject('a')))
        .unwrap()
        .is_empty());
    assert_eq!(s.count(&RecordFilter::default()).unwrap(), 2);
}

#[test]
fn at_store_db_04_invalid_filter_is_rejected() {
    let s = seeded();
    let f = RecordFilter {
        created_after: Some(MonotonicTimeNs(10)),
        created_before: Some(MonotonicTimeNs(5)),
        ..RecordFilter::default()
    };
    assert!(s.recall(&f).is_err());
}

#[test]
fn at_store_db_05_delete_by_ids_is_idempotent() {
    let s = seeded();
    let f = RecordFilter {
        record_ids: Some(vec![RecordId::new("rec_3").unwrap()]),
        ..RecordFilter::default()
    };
    assert_eq!(s.delete(&f).unwrap().len(), 1);
    assert!(s.delete(&f).unwrap().is_empty());
}
