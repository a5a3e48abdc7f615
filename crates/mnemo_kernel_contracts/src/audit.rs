#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{is_ascii_lower_snake_key, validate_token};
use crate::tier::{ConsentContextRecord, SubjectPseudonym};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

pub const AUDIT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);
pub const HASH_HEX_LEN: usize = 64;
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

fn validate_hash_hex(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.len() != HASH_HEX_LEN
        || !value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
    {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be 64 lowercase hex chars",
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AuditEventId(String);

impl AuditEventId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = Self(id.into());
        id.validate()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for AuditEventId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("audit_event_id", &self.0, 64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ConsentGrant,
    ConsentDenial,
    MemoryStored,
    MemoryForgotten,
    MemoryExported,
    AggregationDisclosed,
    AggregationRefused,
    SigningKeyRotated,
    MasterKeyRotated,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConsentGrant => "consent_grant",
            Self::ConsentDenial => "consent_denial",
            Self::MemoryStored => "memory_stored",
            Self::MemoryForgotten => "memory_forgotten",
            Self::MemoryExported => "memory_exported",
            Self::AggregationDisclosed => "aggregation_disclosed",
            Self::AggregationRefused => "aggregation_refused",
            Self::SigningKeyRotated => "signing_key_rotated",
            Self::MasterKeyRotated => "master_key_rotated",
        }
    }
}

/// Validated operation label carried by every audit event (`store`, `distill`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperationName(String);

impl OperationName {
    pub fn new(name: impl Into<String>) -> Result<Self, ContractViolation> {
        let name = Self(name.into());
        name.validate()?;
        Ok(name)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for OperationName {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("operation", &self.0, 64)?;
        if !is_ascii_lower_snake_key(&self.0) {
            return Err(ContractViolation::InvalidValue {
                field: "operation",
                reason: "must be lower_snake_case (a-z0-9_)",
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for OperationName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One appended ledger entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: AuditEventId,
    pub event_type: AuditEventType,
    pub timestamp: MonotonicTimeNs,
    pub operation: OperationName,
    pub subject: Option<SubjectPseudonym>,
    pub consent_context: Option<ConsentContextRecord>,
    pub payload: serde_json::Value,
    pub leaf_index: u64,
    pub previous_hash: String,
    pub current_hash: String,
    pub key_id: String,
    pub signature: String,
}

/// The fields covered by `current_hash`: everything except the hash itself and
/// the signature material.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEventBody<'a> {
    pub event_id: &'a AuditEventId,
    pub event_type: AuditEventType,
    pub timestamp: MonotonicTimeNs,
    pub operation: &'a OperationName,
    pub subject: Option<&'a SubjectPseudonym>,
    pub consent_context: Option<&'a ConsentContextRecord>,
    pub payload: &'a serde_json::Value,
    pub leaf_index: u64,
    pub previous_hash: &'a str,
}

impl AuditEvent {
    pub fn hashed_body(&self) -> AuditEventBody<'_> {
        AuditEventBody {
            event_id: &self.event_id,
            event_type: self.event_type,
            timestamp: self.timestamp,
            operation: &self.operation,
            subject: self.subject.as_ref(),
            consent_context: self.consent_context.as_ref(),
            payload: &self.payload,
            leaf_index: self.leaf_index,
            previous_hash: &self.previous_hash,
        }
    }
}

impl Validate for AuditEvent {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.event_id.validate()?;
        self.operation.validate()?;
        if let Some(subject) = &self.subject {
            subject.validate()?;
        }
        if let Some(ctx) = &self.consent_context {
            ctx.validate()?;
        }
        if !self.payload.is_object() {
            return Err(ContractViolation::InvalidValue {
                field: "audit_event.payload",
                reason: "must be a JSON object",
            });
        }
        validate_hash_hex("audit_event.previous_hash", &self.previous_hash)?;
        validate_hash_hex("audit_event.current_hash", &self.current_hash)?;
        validate_token("audit_event.key_id", &self.key_id, 128)?;
        validate_token("audit_event.signature", &self.signature, 256)?;
        Ok(())
    }
}

/// Exactly the fields a receipt signature covers, in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiptSigningPayload<'a> {
    pub event_id: &'a str,
    pub leaf_hash: &'a str,
    pub root_hash: &'a str,
    pub timestamp: MonotonicTimeNs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf_index: u64,
    pub leaf_hash: String,
    pub root_hash: String,
    pub audit_path: Vec<String>,
}

impl Validate for MerkleProof {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_hash_hex("merkle_proof.leaf_hash", &self.leaf_hash)?;
        validate_hash_hex("merkle_proof.root_hash", &self.root_hash)?;
        for node in &self.audit_path {
            validate_hash_hex("merkle_proof.audit_path", node)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReceipt {
    pub receipt_id: String,
    pub event_id: AuditEventId,
    pub timestamp: MonotonicTimeNs,
    pub signature: String,
    pub key_id: String,
    pub merkle_proof: MerkleProof,
    pub ledger_height: u64,
}

impl AuditReceipt {
    pub fn signing_payload(&self) -> ReceiptSigningPayload<'_> {
        ReceiptSigningPayload {
            event_id: self.event_id.as_str(),
            leaf_hash: &self.merkle_proof.leaf_hash,
            root_hash: &self.merkle_proof.root_hash,
            timestamp: self.timestamp,
        }
    }
}

impl Validate for AuditReceipt {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.event_id.validate()?;
        self.merkle_proof.validate()?;
        if self.ledger_height == 0 || self.merkle_proof.leaf_index >= self.ledger_height {
            return Err(ContractViolation::InvalidValue {
                field: "audit_receipt.ledger_height",
                reason: "must exceed merkle_proof.leaf_index",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFailureReason {
    MalformedEvent,
    LeafIndexMismatch,
    PreviousHashMismatch,
    CurrentHashMismatch,
    UnknownKeyId,
    SignatureInvalid,
}

impl ChainFailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedEvent => "malformed_event",
            Self::LeafIndexMismatch => "leaf_index_mismatch",
            Self::PreviousHashMismatch => "previous_hash_mismatch",
            Self::CurrentHashMismatch => "current_hash_mismatch",
            Self::UnknownKeyId => "unknown_key_id",
            Self::SignatureInvalid => "signature_invalid",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub checked_events: u64,
    pub failure_index: Option<u64>,
    pub failure_reason: Option<ChainFailureReason>,
}

impl ChainVerification {
    pub fn ok(checked_events: u64) -> Self {
        Self {
            valid: true,
            checked_events,
            failure_index: None,
            failure_reason: None,
        }
    }

    pub fn failed(index: u64, reason: ChainFailureReason) -> Self {
        Self {
            valid: false,
            checked_events: index,
            failure_index: Some(index),
            failure_reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHead {
    pub height: u64,
    pub root_hash: String,
    pub last_event_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerExport {
    pub schema_version: SchemaVersion,
    pub head: LedgerHead,
    pub events: Vec<AuditEvent>,
}
