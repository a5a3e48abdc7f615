#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_token;
use crate::{ContractViolation, Validate};

pub const SUBJECT_PSEUDONYM_HEX_LEN: usize = 64;
pub const TRACE_ID_MAX_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisclosureTier {
    Personal,
    Cohort,
    Population,
}

impl DisclosureTier {
    pub const ALL: [DisclosureTier; 3] = [
        DisclosureTier::Personal,
        DisclosureTier::Cohort,
        DisclosureTier::Population,
    ];

    /// Parses the path segment the router hands over. Anything but the three
    /// lowercase tier names is a validation failure, never an authorization one.
    pub fn parse(segment: &str) -> Result<Self, ContractViolation> {
        match segment {
            "personal" => Ok(Self::Personal),
            "cohort" => Ok(Self::Cohort),
            "population" => Ok(Self::Population),
            _ => Err(ContractViolation::InvalidValue {
                field: "disclosure_tier",
                reason: "must be one of personal, cohort, population",
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Cohort => "cohort",
            Self::Population => "population",
        }
    }

    pub fn allows_individual_reads(self) -> bool {
        matches!(self, Self::Personal)
    }

    pub fn granted_scopes(self) -> Vec<ConsentScope> {
        match self {
            Self::Personal => vec![
                ConsentScope::MemoryRead,
                ConsentScope::MemoryWrite,
                ConsentScope::MemoryForget,
                ConsentScope::MemoryExport,
            ],
            Self::Cohort | Self::Population => {
                vec![ConsentScope::MemoryContribute, ConsentScope::AggregateRead]
            }
        }
    }
}

impl std::fmt::Display for DisclosureTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ConsentScope {
    #[serde(rename = "memory:read")]
    MemoryRead,
    #[serde(rename = "memory:write")]
    MemoryWrite,
    #[serde(rename = "memory:forget")]
    MemoryForget,
    #[serde(rename = "memory:export")]
    MemoryExport,
    #[serde(rename = "memory:contribute")]
    MemoryContribute,
    #[serde(rename = "aggregate:read")]
    AggregateRead,
}

impl ConsentScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MemoryRead => "memory:read",
            Self::MemoryWrite => "memory:write",
            Self::MemoryForget => "memory:forget",
            Self::MemoryExport => "memory:export",
            Self::MemoryContribute => "memory:contribute",
            Self::AggregateRead => "aggregate:read",
        }
    }

    pub fn is_individual_level(self) -> bool {
        matches!(
            self,
            Self::MemoryRead | Self::MemoryWrite | Self::MemoryForget | Self::MemoryExport
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TraceId(String);

impl TraceId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        let trace = Self(id);
        trace.validate()?;
        Ok(trace)
    }

    /// 32 lowercase hex chars; used when minting ids for callers that sent none.
    pub fn from_u128(value: u128) -> Self {
        Self(format!("{value:032x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for TraceId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("trace_id", &self.0, TRACE_ID_MAX_LEN)?;
        if !self
            .0
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
        {
            return Err(ContractViolation::InvalidValue {
                field: "trace_id",
                reason: "must contain only [A-Za-z0-9-_.:]",
            });
        }
        Ok(())
    }
}

/// Salted digest of a raw subject id. Raw ids never cross into the core.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectPseudonym(String);

impl SubjectPseudonym {
    pub fn from_hex(hex_digest: impl Into<String>) -> Result<Self, ContractViolation> {
        let pseudonym = Self(hex_digest.into());
        pseudonym.validate()?;
        Ok(pseudonym)
    }

    pub fn from_digest(digest: &[u8; 32]) -> Self {
        Self(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for SubjectPseudonym {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.len() != SUBJECT_PSEUDONYM_HEX_LEN
            || !self
                .0
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(ContractViolation::InvalidValue {
                field: "subject_pseudonym",
                reason: "must be 64 lowercase hex chars",
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for SubjectPseudonym {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Plain-data snapshot of a resolved consent context, as carried inside audit
/// events. Holding one of these grants nothing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentContextRecord {
    pub disclosure_tier: DisclosureTier,
    pub subject_pseudonym: SubjectPseudonym,
    pub granted_scopes: Vec<ConsentScope>,
    pub trace_id: TraceId,
}

impl Validate for ConsentContextRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.subject_pseudonym.validate()?;
        self.trace_id.validate()?;
        if self.granted_scopes.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "consent_context.granted_scopes",
                reason: "must not be empty",
            });
        }
        if !self.disclosure_tier.allows_individual_reads()
            && self.granted_scopes.iter().any(|s| s.is_individual_level())
        {
            return Err(ContractViolation::InvalidValue {
                field: "consent_context.granted_scopes",
                reason: "aggregate tiers must not carry individual-level scopes",
            });
        }
        Ok(())
    }
}
