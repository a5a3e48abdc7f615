#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use mnemo_kernel_contracts::aggregation::{
    AggregateValue, AggregationKind, AggregationResult, AggregationSpec,
};
use mnemo_kernel_contracts::memory::MemoryRecord;
use mnemo_kernel_contracts::tier::{ConsentScope, DisclosureTier};
use mnemo_kernel_contracts::{
    ContractViolation, ForbiddenReason, GovernanceError, InternalFailure, Validate,
};
use serde_json::Value;

use crate::consent::ConsentContext;

pub mod reason_codes {
    use mnemo_kernel_contracts::ReasonCodeId;

    pub const MNEMO_AGG_OK_DISCLOSED: ReasonCodeId = ReasonCodeId(0x4147_0001);
    pub const MNEMO_AGG_THRESHOLD_NOT_MET: ReasonCodeId = ReasonCodeId(0x4147_00F1);
    pub const MNEMO_AGG_PERSONAL_TIER: ReasonCodeId = ReasonCodeId(0x4147_00F2);
    pub const MNEMO_AGG_REQUEST_INVALID: ReasonCodeId = ReasonCodeId(0x4147_00F3);
    pub const MNEMO_AGG_OVERFLOW: ReasonCodeId = ReasonCodeId(0x4147_00F4);
}

/// Bucket key that absorbs distribution buckets smaller than the threshold.
pub const SUPPRESSED_BUCKET: &str = "__suppressed__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorConfig {
    pub k_anonymity_floor: u64,
}

impl AggregatorConfig {
    pub fn mvp_v1() -> Self {
        Self {
            k_anonymity_floor: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregationError {
    #[error("personal tier cannot be aggregated")]
    PersonalTier,
    #[error("consent context tier {granted} does not match requested tier {requested}")]
    TierMismatch {
        granted: DisclosureTier,
        requested: DisclosureTier,
    },
    #[error("aggregate read scope not granted")]
    ScopeMissing,
    #[error("min_records must be at least 1")]
    InvalidMinRecords,
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    /// Carries only the threshold, never the observed count.
    #[error("k-anonymity threshold of {required} records not met")]
    ThresholdNotMet { required: u64 },
    /// Stored values, not the request, pushed the result out of range.
    #[error("{kind} result exceeds the representable range")]
    Overflow { kind: &'static str },
}

impl AggregationError {
    pub fn reason_code(&self) -> mnemo_kernel_contracts::ReasonCodeId {
        match self {
            Self::ThresholdNotMet { .. } => reason_codes::MNEMO_AGG_THRESHOLD_NOT_MET,
            Self::PersonalTier => reason_codes::MNEMO_AGG_PERSONAL_TIER,
            Self::Overflow { .. } => reason_codes::MNEMO_AGG_OVERFLOW,
            _ => reason_codes::MNEMO_AGG_REQUEST_INVALID,
        }
    }
}

impl From<AggregationError> for GovernanceError {
    fn from(err: AggregationError) -> Self {
        match err {
            AggregationError::ThresholdNotMet { required } => {
                GovernanceError::forbidden(ForbiddenReason::ThresholdNotMet { required })
            }
            AggregationError::ScopeMissing => {
                GovernanceError::forbidden(ForbiddenReason::ScopeNotGranted {
                    scope: ConsentScope::AggregateRead.as_str().to_string(),
                })
            }
            AggregationError::Contract(v) => v.into(),
            AggregationError::Overflow { kind } => {
                GovernanceError::internal(InternalFailure::AggregateOverflow {
                    kind: kind.to_string(),
                })
            }
            other => GovernanceError::validation(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KAnonymityAggregator {
    config: AggregatorConfig,
}

impl KAnonymityAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    pub fn effective_threshold(&self, requested_min_records: u64) -> u64 {
        requested_min_records.max(self.config.k_anonymity_floor).max(1)
    }

    /// `records` is the already-filtered candidate set. The threshold applies to
    /// the records that actually contribute to the value, so a field present on
    /// only a few records cannot be singled out.
    pub fn distill(
        &self,
        context: &ConsentContext,
        tier: DisclosureTier,
        spec: &AggregationSpec,
        records: &[MemoryRecord],
        min_records: u64,
    ) -> Result<AggregationResult, AggregationError> {
        if tier == DisclosureTier::Personal {
            return Err(AggregationError::PersonalTier);
        }
        if context.disclosure_tier() != tier {
            return Err(AggregationError::TierMismatch {
                granted: context.disclosure_tier(),
                requested: tier,
            });
        }
        if !context.has_scope(ConsentScope::AggregateRead) {
            return Err(AggregationError::ScopeMissing);
        }
        if min_records == 0 {
            return Err(AggregationError::InvalidMinRecords);
        }
        spec.validate()?;
        let required = self.effective_threshold(min_records);

        let in_tier = records.iter().filter(|r| r.tier == tier);
        let result = match (spec.kind, spec.field.as_deref()) {
            (AggregationKind::Count, _) => {
                let count = in_tier.count() as u64;
                check_threshold(count, required)?;
                AggregationResult {
                    kind: AggregationKind::Count,
                    value: AggregateValue::Count(count),
                    record_count: count,
                    privacy_threshold_met: true,
                }
            }
            (AggregationKind::Distribution, Some(field)) => {
                let labels: Vec<String> = in_tier
                    .filter_map(|r| r.attributes.get(field).and_then(bucket_label))
                    .collect();
                let count = labels.len() as u64;
                check_threshold(count, required)?;
                let mut buckets: BTreeMap<String, u64> = BTreeMap::new();
                for label in labels {
                    *buckets.entry(label).or_insert(0) += 1;
                }
                AggregationResult {
                    kind: AggregationKind::Distribution,
                    value: AggregateValue::Distribution(suppress_small_buckets(buckets, required)),
                    record_count: count,
                    privacy_threshold_met: true,
                }
            }
            (kind, Some(field)) => {
                let values: Vec<f64> = in_tier
                    .filter_map(|r| r.attributes.get(field).and_then(Value::as_f64))
                    .filter(|v| v.is_finite())
                    .collect();
                let count = values.len() as u64;
                check_threshold(count, required)?;
                AggregationResult {
                    kind,
                    value: AggregateValue::Number(numeric(kind, &values)?),
                    record_count: count,
                    privacy_threshold_met: true,
                }
            }
            (_, None) => {
                return Err(ContractViolation::InvalidValue {
                    field: "aggregation.field",
                    reason: "required for this aggregation type",
                }
                .into())
            }
        };
        result.validate()?;
        Ok(result)
    }
}

fn check_threshold(count: u64, required: u64) -> Result<(), AggregationError> {
    if count < required {
        return Err(AggregationError::ThresholdNotMet { required });
    }
    Ok(())
}

fn bucket_label(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn suppress_small_buckets(buckets: BTreeMap<String, u64>, required: u64) -> BTreeMap<String, u64> {
    let mut out = BTreeMap::new();
    let mut suppressed = 0u64;
    for (label, count) in buckets {
        if count < required {
            suppressed += count;
        } else {
            out.insert(label, count);
        }
    }
    if suppressed > 0 {
        out.insert(SUPPRESSED_BUCKET.to_string(), suppressed);
    }
    out
}

/// Average falls back to summing pre-divided values when the plain sum leaves
/// the f64 range, so only a sum can overflow.
fn numeric(kind: AggregationKind, values: &[f64]) -> Result<f64, AggregationError> {
    let value = match kind {
        AggregationKind::Sum => values.iter().sum(),
        AggregationKind::Average => {
            let n = values.len() as f64;
            let total: f64 = values.iter().sum();
            if total.is_finite() {
                total / n
            } else {
                values.iter().map(|v| v / n).sum()
            }
        }
        AggregationKind::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggregationKind::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregationKind::Count | AggregationKind::Distribution => values.len() as f64,
    };
    if !value.is_finite() {
        return Err(AggregationError::Overflow {
            kind: kind.as_str(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_kernel_contracts::envelope::{
        EncryptedEnvelope, AUTH_TAG_LEN, ENCRYPTION_VERSION_V1, IV_LEN,
    };
    use mnemo_kernel_contracts::memory::{Attributes, MemoryKind, RecordId};
    use mnemo_kernel_contracts::tier::{SubjectPseudonym, TraceId};
    use mnemo_kernel_contracts::MonotonicTimeNs;
    use serde_json::json;

    fn ctx(tier: DisclosureTier) -> ConsentContext {
        ConsentContext::resolved(
            tier,
            SubjectPseudonym::from_digest(&[1; 32]),
            TraceId::new("t-1").unwrap(),
        )
    }

    fn record(i: u64, tier: DisclosureTier, attrs: Value) -> MemoryRecord {
        let attributes: Attributes = serde_json::from_value(attrs).unwrap();
        MemoryRecord {
            record_id: RecordId::new(format!("rec_{i}")).unwrap(),
            subject: SubjectPseudonym::from_digest(&[i as u8; 32]),
            tier,
            kind: MemoryKind::new("check_in").unwrap(),
            envelope: EncryptedEnvelope {
                ciphertext: vec![1],
                auth_tag: vec![0; AUTH_TAG_LEN],
                iv: vec![0; IV_LEN],
                wrapped_data_key: vec![1; 60],
                master_key_id: "mk-1".to_string(),
                encryption_version: ENCRYPTION_VERSION_V1,
            },
            attributes,
            created_at: MonotonicTimeNs(i + 1),
        }
    }

    fn cohort(n: u64) -> Vec<MemoryRecord> {
        (0..n)
            .map(|i| {
                record(
                    i,
                    DisclosureTier::Cohort,
                    json!({"sleep_hours": 5 + i, "mood": if i % 2 == 0 { "calm" } else { "tense" }}),
                )
            })
            .collect()
    }

    fn aggregator() -> KAnonymityAggregator {
        KAnonymityAggregator::new(AggregatorConfig::mvp_v1())
    }

    #[test]
    fn at_agg_01_count_meets_threshold() {
        let r = aggregator()
            .distill(
                &ctx(DisclosureTier::Cohort),
                DisclosureTier::Cohort,
                &AggregationSpec::count(),
                &cohort(6),
                5,
            )
            .unwrap();
        assert_eq!(r.value, AggregateValue::Count(6));
        assert_eq!(r.record_count, 6);
        assert!(r.privacy_threshold_met);
    }

    #[test]
    fn at_agg_02_below_threshold_fails_for_every_type_without_value() {
        let records = cohort(2);
        for kind in AggregationKind::ALL {
            let spec = match kind {
                AggregationKind::Count => AggregationSpec::count(),
                AggregationKind::Distribution => AggregationSpec::over(kind, "mood"),
                _ => AggregationSpec::over(kind, "sleep_hours"),
            };
            let err = aggregator()
                .distill(
                    &ctx(DisclosureTier::Cohort),
                    DisclosureTier::Cohort,
                    &spec,
                    &records,
                    5,
                )
                .unwrap_err();
            assert_eq!(err, AggregationError::ThresholdNotMet { required: 5 });
            let public: GovernanceError = err.into();
            assert!(!public.to_string().contains('2'));
        }
    }

    #[test]
    fn at_agg_03_floor_raises_requested_minimum() {
        let err = aggregator()
            .distill(
                &ctx(DisclosureTier::Population),
                DisclosureTier::Population,
                &AggregationSpec::count(),
                &(0..3)
                    .map(|i| record(i, DisclosureTier::Population, json!({})))
                    .collect::<Vec<_>>(),
                1,
            )
            .unwrap_err();
        assert_eq!(err, AggregationError::ThresholdNotMet { required: 5 });
    }

    #[test]
    fn at_agg_04_numeric_aggregations() {
        let records = cohort(6);
        let run = |kind| {
            aggregator()
                .distill(
                    &ctx(DisclosureTier::Cohort),
                    DisclosureTier::Cohort,
                    &AggregationSpec::over(kind, "sleep_hours"),
                    &records,
                    5,
                )
                .unwrap()
                .value
        };
        assert_eq!(run(AggregationKind::Sum), AggregateValue::Number(45.0));
        assert_eq!(run(AggregationKind::Average), AggregateValue::Number(7.5));
        assert_eq!(run(AggregationKind::Min), AggregateValue::Number(5.0));
        assert_eq!(run(AggregationKind::Max), AggregateValue::Number(10.0));
    }

    #[test]
    fn at_agg_05_threshold_counts_only_contributing_records() {
        let mut records = cohort(6);
        for r in records.iter_mut().skip(2) {
            r.attributes.remove("sleep_hours");
        }
        let err = aggregator()
            .distill(
                &ctx(DisclosureTier::Cohort),
                DisclosureTier::Cohort,
                &AggregationSpec::over(AggregationKind::Average, "sleep_hours"),
                &records,
                5,
            )
            .unwrap_err();
        assert_eq!(err, AggregationError::ThresholdNotMet { required: 5 });
    }

    #[test]
    fn at_agg_06_sum_past_f64_range_is_an_overflow_not_a_bad_request() {
        let records: Vec<MemoryRecord> = (0..5)
            .map(|i| record(i, DisclosureTier::Cohort, json!({"steps": 1.0e308})))
            .collect();
        let run = |kind| {
            aggregator().distill(
                &ctx(DisclosureTier::Cohort),
                DisclosureTier::Cohort,
                &AggregationSpec::over(kind, "steps"),
                &records,
                5,
            )
        };
        let err = run(AggregationKind::Sum).unwrap_err();
        assert_eq!(err, AggregationError::Overflow { kind: "sum" });
        assert_eq!(err.reason_code(), reason_codes::MNEMO_AGG_OVERFLOW);
        let public: GovernanceError = err.into();
        assert_eq!(
            public.public_code(),
            mnemo_kernel_contracts::PublicErrorCode::InternalError
        );
        let AggregateValue::Number(mean) = run(AggregationKind::Average).unwrap().value else {
            panic!("expected a number");
        };
        assert!((mean / 1.0e308 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn distribution_suppresses_small_buckets() {
        let mut records = cohort(10);
        records.push(record(
            99,
            DisclosureTier::Cohort,
            json!({"mood": "elated"}),
        ));
        let r = aggregator()
            .distill(
                &ctx(DisclosureTier::Cohort),
                DisclosureTier::Cohort,
                &AggregationSpec::over(AggregationKind::Distribution, "mood"),
                &records,
                5,
            )
            .unwrap();
        let AggregateValue::Distribution(buckets) = r.value else {
            panic!("expected distribution");
        };
        assert_eq!(buckets.get("calm"), Some(&5));
        assert_eq!(buckets.get("tense"), Some(&5));
        assert_eq!(buckets.get(SUPPRESSED_BUCKET), Some(&1));
        assert!(!buckets.contains_key("elated"));
    }

    #[test]
    fn personal_tier_and_mismatched_context_are_rejected() {
        let agg = aggregator();
        assert_eq!(
            agg.distill(
                &ctx(DisclosureTier::Personal),
                DisclosureTier::Personal,
                &AggregationSpec::count(),
                &[],
                5
            ),
            Err(AggregationError::PersonalTier)
        );
        assert!(matches!(
            agg.distill(
                &ctx(DisclosureTier::Population),
                DisclosureTier::Cohort,
                &AggregationSpec::count(),
                &cohort(6),
                5
            ),
            Err(AggregationError::TierMismatch { .. })
        ));
    }

    #[test]
    fn records_from_other_tiers_are_ignored() {
        let mut records = cohort(4);
        records.extend((10..14).map(|i| record(i, DisclosureTier::Population, json!({}))));
        let err = aggregator()
            .distill(
                &ctx(DisclosureTier::Cohort),
                DisclosureTier::Cohort,
                &AggregationSpec::count(),
                &records,
                5,
            )
            .unwrap_err();
        assert_eq!(err, AggregationError::ThresholdNotMet { required: 5 });
    }
}
