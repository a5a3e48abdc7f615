#![forbid(unsafe_code)]

use std::sync::Arc;

use mnemo_engines::consent::{CredentialDirectory, Pseudonymizer};
use mnemo_engines::ledger::verify_chain;
use mnemo_kernel_contracts::aggregation::{AggregateValue, AggregationKind, AggregationSpec};
use mnemo_kernel_contracts::audit::AuditEventType;
use mnemo_kernel_contracts::memory::{Attributes, MemoryKind, RecordFilter};
use mnemo_kernel_contracts::operations::{DistillRequest, FilterRequest, StoreRequest};
use mnemo_kernel_contracts::tier::DisclosureTier;
use mnemo_kernel_contracts::{ForbiddenReason, GovernanceError, PublicErrorCode};
use mnemo_os::config::GovernanceConfig;
use mnemo_os::governance::{GovernanceRuntime, RequestEnvelope};
use mnemo_storage::memory_store::InMemoryMemoryStore;
use serde_json::json;

const SALT: &[u8] = b"scenario-salt-0123456789";
const ALICE: &str = "tok-alice";
const BOB: &str = "tok-bob";
const ADMIN: &str = "tok-admin";

fn runtime() -> GovernanceRuntime {
    let p = Pseudonymizer::new(SALT);
    let mut dir = CredentialDirectory::default();
    dir.insert_token(
        ALICE,
        p.pseudonym("alice"),
        &[DisclosureTier::Personal, DisclosureTier::Cohort],
    );
    dir.insert_token(BOB, p.pseudonym("bob"), &[DisclosureTier::Cohort]);
    let config = GovernanceConfig::mvp_v1()
        .with_pseudonym_salt(SALT)
        .with_admin_token(ADMIN);
    GovernanceRuntime::new(config, dir, Arc::new(InMemoryMemoryStore::new())).unwrap()
}

fn cohort(token: &str) -> RequestEnvelope {
    RequestEnvelope::new("cohort")
        .with_bearer(token)
        .with_trace_id("scenario-trace")
}

fn check_in(mood: &str, sleep_hours: f64) -> StoreRequest {
    let mut attributes = Attributes::new();
    attributes.insert("mood".to_string(), json!(mood));
    attributes.insert("sleep_hours".to_string(), json!(sleep_hours));
    StoreRequest {
        kind: MemoryKind::new("check_in").unwrap(),
        content: format!("feeling {mood}"),
        attributes,
    }
}

fn count_over(filter: RecordFilter) -> DistillRequest {
    DistillRequest {
        aggregation: AggregationSpec::count(),
        filter,
        min_records: 5,
    }
}

#[tokio::test]
async fn at_scenario_01_cohort_count_passes_then_small_subject_slice_is_refused() {
    let rt = runtime();
    for i in 0..6 {
        rt.store(&cohort(ALICE), check_in("calm", 6.0 + i as f64))
            .await
            .unwrap();
    }
    let disclosed = rt
        .distill(&cohort(ALICE), count_over(RecordFilter::default()))
        .await
        .unwrap();
    assert_eq!(disclosed.result.value, AggregateValue::Count(6));
    assert!(disclosed.result.privacy_threshold_met);

    rt.store(&cohort(BOB), check_in("tense", 4.0)).await.unwrap();
    rt.store(&cohort(BOB), check_in("tense", 5.0)).await.unwrap();
    let bob = Pseudonymizer::new(SALT).pseudonym("bob");
    let err = rt
        .distill(&cohort(ALICE), count_over(RecordFilter::for_subject(bob)))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GovernanceError::forbidden(ForbiddenReason::ThresholdNotMet { required: 5 })
    );
    // The refusal is chained, and it carries no count.
    let export = rt.export_ledger(Some(ADMIN)).unwrap();
    let refusal = export.events.last().unwrap();
    assert_eq!(refusal.event_type, AuditEventType::AggregationRefused);
    assert!(refusal.payload.get("record_count").is_none());
    assert!(verify_chain(&export.events, &rt.public_key_set()).valid);
}

#[tokio::test]
async fn at_scenario_02_missing_credential_on_personal_is_unauthorized_first() {
    let rt = runtime();
    let err = rt
        .recall(&RequestEnvelope::new("personal"), FilterRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.public_code(), PublicErrorCode::Unauthorized);
    // Even a bad tier does not outrank the missing credential.
    let err = rt
        .recall(&RequestEnvelope::new("galaxy"), FilterRequest::default())
        .await
        .unwrap_err();
    assert_eq!(err.public_code(), PublicErrorCode::Unauthorized);

    let export = rt.export_ledger(Some(ADMIN)).unwrap();
    assert_eq!(export.events.len(), 2);
    assert!(export
        .events
        .iter()
        .all(|e| e.event_type == AuditEventType::ConsentDenial && e.subject.is_none()));
}

#[tokio::test]
async fn at_scenario_03_numeric_and_distribution_aggregates_over_cohort() {
    let rt = runtime();
    for (i, mood) in ["calm", "calm", "calm", "calm", "calm", "tense"].iter().enumerate() {
        rt.store(&cohort(ALICE), check_in(mood, 5.0 + i as f64))
            .await
            .unwrap();
    }
    let avg = rt
        .distill(
            &cohort(BOB),
            DistillRequest {
                aggregation: AggregationSpec::over(AggregationKind::Average, "sleep_hours"),
                filter: RecordFilter::default(),
                min_records: 5,
            },
        )
        .await
        .unwrap();
    assert_eq!(avg.result.value, AggregateValue::Number(7.5));

    let dist = rt
        .distill(
            &cohort(BOB),
            DistillRequest {
                aggregation: AggregationSpec::over(AggregationKind::Distribution, "mood"),
                filter: RecordFilter::default(),
                min_records: 5,
            },
        )
        .await
        .unwrap();
    let AggregateValue::Distribution(buckets) = dist.result.value else {
        panic!("expected distribution");
    };
    assert_eq!(buckets.get("calm"), Some(&5));
    assert!(!buckets.contains_key("tense"));
}

#[tokio::test]
async fn at_scenario_04_personal_tier_cannot_distill() {
    let rt = runtime();
    let err = rt
        .distill(
            &RequestEnvelope::new("personal").with_bearer(ALICE),
            count_over(RecordFilter::default()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.public_code(), PublicErrorCode::Forbidden);
}

#[tokio::test]
async fn at_scenario_05_unknown_tier_with_valid_credential_is_validation_failure() {
    let rt = runtime();
    let err = rt
        .recall(
            &RequestEnvelope::new("galaxy").with_bearer(ALICE),
            FilterRequest::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.public_code(), PublicErrorCode::ValidationFailure);
}
