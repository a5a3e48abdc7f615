#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::is_ascii_lower_snake_key;
use crate::{ContractViolation, Validate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Count,
    Sum,
    Average,
    Min,
    Max,
    Distribution,
}

impl AggregationKind {
    pub const ALL: [AggregationKind; 6] = [
        AggregationKind::Count,
        AggregationKind::Sum,
        AggregationKind::Average,
        AggregationKind::Min,
        AggregationKind::Max,
        AggregationKind::Distribution,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Average => "average",
            Self::Min => "min",
            Self::Max => "max",
            Self::Distribution => "distribution",
        }
    }

    pub fn requires_field(self) -> bool {
        !matches!(self, Self::Count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationSpec {
    #[serde(rename = "type")]
    pub kind: AggregationKind,
    #[serde(default)]
    pub field: Option<String>,
}

impl AggregationSpec {
    pub fn count() -> Self {
        Self {
            kind: AggregationKind::Count,
            field: None,
        }
    }

    pub fn over(kind: AggregationKind, field: impl Into<String>) -> Self {
        Self {
            kind,
            field: Some(field.into()),
        }
    }
}

impl Validate for AggregationSpec {
    fn validate(&self) -> Result<(), ContractViolation> {
        match (&self.field, self.kind.requires_field()) {
            (None, true) => Err(ContractViolation::InvalidValue {
                field: "aggregation.field",
                reason: "required for this aggregation type",
            }),
            (Some(_), false) => Err(ContractViolation::InvalidValue {
                field: "aggregation.field",
                reason: "count does not take a field",
            }),
            (Some(f), true) if f.len() > 64 || !is_ascii_lower_snake_key(f) => {
                Err(ContractViolation::InvalidValue {
                    field: "aggregation.field",
                    reason: "must be lower_snake_case and <= 64 chars",
                })
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "value_type", content = "value", rename_all = "snake_case")]
pub enum AggregateValue {
    Count(u64),
    Number(f64),
    Distribution(BTreeMap<String, u64>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    #[serde(rename = "type")]
    pub kind: AggregationKind,
    pub value: AggregateValue,
    pub record_count: u64,
    pub privacy_threshold_met: bool,
}

impl Validate for AggregationResult {
    fn validate(&self) -> Result<(), ContractViolation> {
        if !self.privacy_threshold_met {
            return Err(ContractViolation::InvalidValue {
                field: "aggregation_result.privacy_threshold_met",
                reason: "results below threshold must never be constructed",
            });
        }
        if self.record_count == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "aggregation_result.record_count",
                reason: "must be > 0",
            });
        }
        if let AggregateValue::Number(v) = self.value {
            if !v.is_finite() {
                return Err(ContractViolation::NotFinite {
                    field: "aggregation_result.value",
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_rejects_field_and_others_require_it() {
        assert!(AggregationSpec::count().validate().is_ok());
        assert!(AggregationSpec::over(AggregationKind::Count, "x")
            .validate()
            .is_err());
        let missing = AggregationSpec {
            kind: AggregationKind::Sum,
            field: None,
        };
        assert!(missing.validate().is_err());
        assert!(AggregationSpec::over(AggregationKind::Average, "sleep_hours")
            .validate()
            .is_ok());
    }

    #[test]
    fn result_serializes_with_type_tag() {
        let r = AggregationResult {
            kind: AggregationKind::Count,
            value: AggregateValue::Count(6),
            record_count: 6,
            privacy_threshold_met: true,
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["type"], "count");
        assert_eq!(v["value"]["value_type"], "count");
        assert_eq!(v["value"]["value"], 6);
    }

    #[test]
    fn non_finite_result_fails_validation() {
        let r = AggregationResult {
            kind: AggregationKind::Average,
            value: AggregateValue::Number(f64::NAN),
            record_count: 3,
            privacy_threshold_met: true,
        };
        assert!(r.validate().is_err());
    }
}
