#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::aggregation::{AggregationResult, AggregationSpec};
use crate::audit::AuditReceipt;
use crate::memory::{
    validate_attributes, Attributes, MemoryKind, RecalledMemory, RecordFilter, RecordId,
    MAX_CONTENT_BYTES,
};
use crate::{ContractViolation, Validate};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRequest {
    pub kind: MemoryKind,
    pub content: String,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Validate for StoreRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.kind.validate()?;
        if self.content.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "content",
                reason: "must not be empty",
            });
        }
        if self.content.len() > MAX_CONTENT_BYTES {
            return Err(ContractViolation::InvalidValue {
                field: "content",
                reason: "exceeds max size",
            });
        }
        validate_attributes(&self.attributes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreResponse {
    pub record_id: RecordId,
    pub receipt: AuditReceipt,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FilterRequest {
    #[serde(default)]
    pub filter: RecordFilter,
}

/// Recall is audited through its consent grant, whose receipt is returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallResponse {
    pub memories: Vec<RecalledMemory>,
    pub receipt: AuditReceipt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForgetResponse {
    pub deleted_ids: Vec<RecordId>,
    pub receipt: AuditReceipt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportResponse {
    pub memories: Vec<RecalledMemory>,
    pub receipt: AuditReceipt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillRequest {
    pub aggregation: AggregationSpec,
    #[serde(default)]
    pub filter: RecordFilter,
    pub min_records: u64,
}

impl Validate for DistillRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.aggregation.validate()?;
        self.filter.validate()?;
        if self.min_records == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "min_records",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistillResponse {
    pub result: AggregationResult,
    pub receipt: AuditReceipt,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RotateSigningKeyRequest {
    #[serde(default)]
    pub key_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotateMasterKeyRequest {
    pub master_key_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRotationResponse {
    pub key_id: String,
    pub retired_key_id: Option<String>,
    pub receipt: AuditReceipt,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn store_request_rejects_empty_and_oversized_content() {
        let mut req: StoreRequest =
            serde_json::from_value(json!({"kind": "check_in", "content": ""})).unwrap();
        assert!(req.validate().is_err());
        req.content = "x".repeat(MAX_CONTENT_BYTES + 1);
        assert!(req.validate().is_err());
        req.content = "fine".to_string();
        assert!(req.validate().is_ok());
    }

    #[test]
    fn distill_request_defaults_to_an_empty_filter() {
        let req: DistillRequest = serde_json::from_value(json!({
            "aggregation": {"type": "count"},
            "min_records": 5
        }))
        .unwrap();
        assert_eq!(req.filter, RecordFilter::default());
        assert!(req.validate().is_ok());
    }

    #[test]
    fn distill_request_requires_positive_min_records() {
        let req: DistillRequest = serde_json::from_value(json!({
            "aggregation": {"type": "count"},
            "min_records": 0
        }))
        .unwrap();
        assert!(req.validate().is_err());
    }
}
