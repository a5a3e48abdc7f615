#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::common::{is_ascii_lower_snake_key, validate_token};
use crate::envelope::EncryptedEnvelope;
use crate::tier::{DisclosureTier, SubjectPseudonym};
use crate::{ContractViolation, MonotonicTimeNs, Validate};

pub const MAX_ATTRIBUTES: usize = 32;
pub const MAX_ATTRIBUTE_STRING_LEN: usize = 256;
pub const MAX_CONTENT_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = Self(id.into());
        id.validate()?;
        Ok(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for RecordId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("record_id", &self.0, 64)
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemoryKind(String);

impl MemoryKind {
    pub fn new(kind: impl Into<String>) -> Result<Self, ContractViolation> {
        let kind = Self(kind.into());
        kind.validate()?;
        Ok(kind)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for MemoryKind {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("memory_kind", &self.0, 64)?;
        if !is_ascii_lower_snake_key(&self.0) {
            return Err(ContractViolation::InvalidValue {
                field: "memory_kind",
                reason: "must be lower_snake_case (a-z0-9_)",
            });
        }
        Ok(())
    }
}

pub type Attributes = BTreeMap<String, serde_json::Value>;

pub fn validate_attributes(attributes: &Attributes) -> Result<(), ContractViolation> {
    if attributes.len() > MAX_ATTRIBUTES {
        return Err(ContractViolation::InvalidValue {
            field: "attributes",
            reason: "too many attributes",
        });
    }
    for (key, value) in attributes {
        if key.len() > 64 || !is_ascii_lower_snake_key(key) {
            return Err(ContractViolation::InvalidValue {
                field: "attributes.key",
                reason: "must be lower_snake_case and <= 64 chars",
            });
        }
        match value {
            serde_json::Value::Bool(_) => {}
            serde_json::Value::Number(n) => {
                if n.as_f64().map(|f| !f.is_finite()).unwrap_or(true) {
                    return Err(ContractViolation::NotFinite {
                        field: "attributes.value",
                    });
                }
            }
            serde_json::Value::String(s) => {
                if s.len() > MAX_ATTRIBUTE_STRING_LEN {
                    return Err(ContractViolation::InvalidValue {
                        field: "attributes.value",
                        reason: "string exceeds max length",
                    });
                }
            }
            _ => {
                return Err(ContractViolation::InvalidValue {
                    field: "attributes.value",
                    reason: "must be a string, number, or bool",
                })
            }
        }
    }
    Ok(())
}

/// A persisted memory record. Content only exists here in encrypted form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub record_id: RecordId,
    pub subject: SubjectPseudonym,
    pub tier: DisclosureTier,
    pub kind: MemoryKind,
    pub envelope: EncryptedEnvelope,
    pub attributes: Attributes,
    pub created_at: MonotonicTimeNs,
}

impl Validate for MemoryRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.record_id.validate()?;
        self.subject.validate()?;
        self.kind.validate()?;
        self.envelope.validate()?;
        validate_attributes(&self.attributes)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub record_ids: Option<Vec<RecordId>>,
    #[serde(default)]
    pub subject: Option<SubjectPseudonym>,
    #[serde(default)]
    pub tier: Option<DisclosureTier>,
    #[serde(default)]
    pub kind: Option<MemoryKind>,
    #[serde(default)]
    pub attributes: Attributes,
    #[serde(default)]
    pub created_after: Option<MonotonicTimeNs>,
    #[serde(default)]
    pub created_before: Option<MonotonicTimeNs>,
}

impl RecordFilter {
    pub fn for_subject(subject: SubjectPseudonym) -> Self {
        Self {
            subject: Some(subject),
            ..Self::default()
        }
    }

    pub fn for_tier(tier: DisclosureTier) -> Self {
        Self {
            tier: Some(tier),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if let Some(ids) = &self.record_ids {
            if !ids.contains(&record.record_id) {
                return false;
            }
        }
        if self.subject.as_ref().is_some_and(|s| s != &record.subject) {
            return false;
        }
        if self.tier.is_some_and(|t| t != record.tier) {
            return false;
        }
        if self.kind.as_ref().is_some_and(|k| k != &record.kind) {
            return false;
        }
        if self.created_after.is_some_and(|t| record.created_at <= t) {
            return false;
        }
        if self.created_before.is_some_and(|t| record.created_at >= t) {
            return false;
        }
        self.attributes
            .iter()
            .all(|(key, want)| record.attributes.get(key) == Some(want))
    }
}

impl Validate for RecordFilter {
    fn validate(&self) -> Result<(), ContractViolation> {
        if let Some(ids) = &self.record_ids {
            if ids.is_empty() || ids.len() > 256 {
                return Err(ContractViolation::InvalidValue {
                    field: "filter.record_ids",
                    reason: "must hold 1..=256 ids when provided",
                });
            }
            for id in ids {
                id.validate()?;
            }
        }
        if let Some(subject) = &self.subject {
            subject.validate()?;
        }
        if let Some(kind) = &self.kind {
            kind.validate()?;
        }
        if let (Some(after), Some(before)) = (self.created_after, self.created_before) {
            if after >= before {
                return Err(ContractViolation::InvalidValue {
                    field: "filter.created_after",
                    reason: "must be earlier than created_before",
                });
            }
        }
        validate_attributes(&self.attributes)
    }
}

/// Decrypted view handed back to a personal-tier caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecalledMemory {
    pub record_id: RecordId,
    pub tier: DisclosureTier,
    pub kind: MemoryKind,
    pub content: String,
    pub attributes: Attributes,
    pub created_at: MonotonicTimeNs,
}
