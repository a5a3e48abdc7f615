#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::ContractViolation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PublicErrorCode {
    ValidationFailure,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    ServiceUnavailable,
    InternalError,
}

impl PublicErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationFailure => "VALIDATION_FAILURE",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ForbiddenReason {
    #[error("tier {tier} is not granted to this caller")]
    TierNotGranted { tier: String },
    #[error("scope {scope} is not granted for this tier")]
    ScopeNotGranted { scope: String },
    #[error("individual-level access is not permitted on tier {tier}")]
    IndividualAccessDenied { tier: String },
    #[error("k-anonymity threshold of {required} records not met")]
    ThresholdNotMet { required: u64 },
    #[error("admin credential required")]
    AdminRequired,
}

/// Internal failures never carry plaintext or key material; key lookups carry
/// only the key id so operators can tell a missing key from corrupted data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InternalFailure {
    #[error("signing failed: {detail}")]
    Signing { detail: String },
    #[error("encryption failed: {detail}")]
    Encryption { detail: String },
    #[error("master key {key_id} not found; restore the key before retrying")]
    MasterKeyNotFound { key_id: String },
    #[error("audit chain integrity failure at index {index}")]
    ChainIntegrity { index: u64 },
    #[error("storage failure: {detail}")]
    Storage { detail: String },
    #[error("{dependency} did not respond within {timeout_ms} ms")]
    DependencyTimeout {
        dependency: String,
        timeout_ms: u64,
    },
    #[error("record {record_id} was written without an audit event and could not be removed")]
    UnauditedWrite { record_id: String },
    #[error("{kind} aggregate exceeds the representable range")]
    AggregateOverflow {
        #[serde(rename = "aggregation")]
        kind: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "error", rename_all = "snake_case")]
pub enum GovernanceError {
    #[error("validation failure: {reason}")]
    ValidationFailure { reason: String },
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },
    #[error("forbidden: {reason}")]
    Forbidden { reason: ForbiddenReason },
    #[error("not found: {resource}")]
    NotFound { resource: String },
    #[error("conflict: {reason}")]
    Conflict { reason: String },
    #[error("service unavailable: circuit open for {operation}")]
    ServiceUnavailable {
        operation: String,
        retry_after_ms: u64,
    },
    #[error("internal error: {failure}")]
    InternalError { failure: InternalFailure },
}

impl GovernanceError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationFailure {
            reason: reason.into(),
        }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn forbidden(reason: ForbiddenReason) -> Self {
        Self::Forbidden { reason }
    }

    pub fn internal(failure: InternalFailure) -> Self {
        Self::InternalError { failure }
    }

    pub fn public_code(&self) -> PublicErrorCode {
        match self {
            Self::ValidationFailure { .. } => PublicErrorCode::ValidationFailure,
            Self::Unauthorized { .. } => PublicErrorCode::Unauthorized,
            Self::Forbidden { .. } => PublicErrorCode::Forbidden,
            Self::NotFound { .. } => PublicErrorCode::NotFound,
            Self::Conflict { .. } => PublicErrorCode::Conflict,
            Self::ServiceUnavailable { .. } => PublicErrorCode::ServiceUnavailable,
            Self::InternalError { .. } => PublicErrorCode::InternalError,
        }
    }

    /// Validation and authorization outcomes are terminal; retrying cannot help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ServiceUnavailable { .. }
                | Self::InternalError {
                    failure: InternalFailure::DependencyTimeout { .. }
                }
        )
    }
}

impl From<ContractViolation> for GovernanceError {
    fn from(v: ContractViolation) -> Self {
        Self::ValidationFailure {
            reason: v.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_violation_maps_to_validation_failure() {
        let err: GovernanceError = ContractViolation::InvalidValue {
            field: "disclosure_tier",
            reason: "must be one of personal, cohort, population",
        }
        .into();
        assert_eq!(err.public_code(), PublicErrorCode::ValidationFailure);
        assert!(!err.is_retryable());
    }

    #[test]
    fn missing_master_key_names_the_key() {
        let err = GovernanceError::internal(InternalFailure::MasterKeyNotFound {
            key_id: "mk-2025-q4".to_string(),
        });
        assert!(err.to_string().contains("mk-2025-q4"));
        assert_eq!(err.public_code().as_str(), "INTERNAL_ERROR");
    }

    #[test]
    fn unaudited_write_is_terminal_and_names_only_the_record() {
        let err = GovernanceError::internal(InternalFailure::UnauditedWrite {
            record_id: "mem_0f3a".to_string(),
        });
        assert!(err.to_string().contains("mem_0f3a"));
        assert!(!err.is_retryable());
        assert_eq!(err.public_code(), PublicErrorCode::InternalError);
    }

    #[test]
    fn breaker_rejection_is_distinguishable_and_retryable() {
        let err = GovernanceError::ServiceUnavailable {
            operation: "distill".to_string(),
            retry_after_ms: 60_000,
        };
        assert!(err.is_retryable());
        assert_eq!(err.public_code(), PublicErrorCode::ServiceUnavailable);
    }
}
