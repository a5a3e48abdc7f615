#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use mnemo_kernel_contracts::audit::{AuditEventType, AuditReceipt, OperationName};
use mnemo_kernel_contracts::tier::{
    ConsentContextRecord, ConsentScope, DisclosureTier, SubjectPseudonym, TraceId,
};
use mnemo_kernel_contracts::{
    ContractViolation, ForbiddenReason, GovernanceError, MonotonicTimeNs, ReasonCodeId,
};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::canonical::{sha256, Hash32};
use crate::ledger::{EmitRequest, HashChain};
use crate::telemetry::GovernanceTelemetry;

pub mod reason_codes {
    use mnemo_kernel_contracts::ReasonCodeId;

    pub const MNEMO_CONSENT_OK_GRANTED: ReasonCodeId = ReasonCodeId(0x434E_0001);
    pub const MNEMO_CONSENT_CREDENTIAL_MISSING: ReasonCodeId = ReasonCodeId(0x434E_00F1);
    pub const MNEMO_CONSENT_CREDENTIAL_UNKNOWN: ReasonCodeId = ReasonCodeId(0x434E_00F2);
    pub const MNEMO_CONSENT_TIER_INVALID: ReasonCodeId = ReasonCodeId(0x434E_00F3);
    pub const MNEMO_CONSENT_TIER_NOT_GRANTED: ReasonCodeId = ReasonCodeId(0x434E_00F4);
    pub const MNEMO_CONSENT_SCOPE_NOT_GRANTED: ReasonCodeId = ReasonCodeId(0x434E_00F5);
    pub const MNEMO_CONSENT_INDIVIDUAL_ACCESS_DENIED: ReasonCodeId = ReasonCodeId(0x434E_00F6);
    pub const MNEMO_CONSENT_AUDIT_FAILED: ReasonCodeId = ReasonCodeId(0x434E_00F7);
}

/// Proof that the resolver authenticated and authorized a request. There is no
/// public constructor and no `Deserialize`; holders can only read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentContext {
    record: ConsentContextRecord,
}

impl ConsentContext {
    pub(crate) fn resolved(
        disclosure_tier: DisclosureTier,
        subject_pseudonym: SubjectPseudonym,
        trace_id: TraceId,
    ) -> Self {
        Self {
            record: ConsentContextRecord {
                disclosure_tier,
                subject_pseudonym,
                granted_scopes: disclosure_tier.granted_scopes(),
                trace_id,
            },
        }
    }

    pub fn disclosure_tier(&self) -> DisclosureTier {
        self.record.disclosure_tier
    }

    pub fn subject(&self) -> &SubjectPseudonym {
        &self.record.subject_pseudonym
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.record.trace_id
    }

    pub fn granted_scopes(&self) -> &[ConsentScope] {
        &self.record.granted_scopes
    }

    pub fn has_scope(&self, scope: ConsentScope) -> bool {
        self.record.granted_scopes.contains(&scope)
    }

    pub fn require_scope(&self, scope: ConsentScope) -> Result<(), GovernanceError> {
        if self.has_scope(scope) {
            return Ok(());
        }
        Err(GovernanceError::forbidden(scope_denial(
            self.record.disclosure_tier,
            scope,
        )))
    }

    pub fn record(&self) -> &ConsentContextRecord {
        &self.record
    }
}

fn scope_denial(tier: DisclosureTier, scope: ConsentScope) -> ForbiddenReason {
    if scope.is_individual_level() && !tier.allows_individual_reads() {
        ForbiddenReason::IndividualAccessDenied {
            tier: tier.as_str().to_string(),
        }
    } else {
        ForbiddenReason::ScopeNotGranted {
            scope: scope.as_str().to_string(),
        }
    }
}

/// Salted SHA-256 of raw subject ids. The salt never leaves this type.
pub struct Pseudonymizer {
    salt: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for Pseudonymizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pseudonymizer").finish_non_exhaustive()
    }
}

impl Pseudonymizer {
    pub fn new(salt: &[u8]) -> Self {
        Self {
            salt: Zeroizing::new(salt.to_vec()),
        }
    }

    pub fn pseudonym(&self, raw_subject_id: &str) -> SubjectPseudonym {
        let mut h = Sha256::new();
        h.update((self.salt.len() as u64).to_be_bytes());
        h.update(self.salt.as_slice());
        h.update(raw_subject_id.as_bytes());
        let digest: Hash32 = h.finalize().into();
        SubjectPseudonym::from_digest(&digest)
    }
}

/// One configured bearer grant as loaded from the credentials file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CredentialGrant {
    pub token_sha256: String,
    pub subject_id: String,
    pub tiers: Vec<DisclosureTier>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone)]
struct DirectoryEntry {
    token_digest: Hash32,
    subject: SubjectPseudonym,
    tiers: BTreeSet<DisclosureTier>,
}

/// Bearer tokens are held only as SHA-256 digests and compared in constant time.
#[derive(Debug, Clone, Default)]
pub struct CredentialDirectory {
    entries: Vec<DirectoryEntry>,
}

impl CredentialDirectory {
    pub fn from_grants(
        grants: &[CredentialGrant],
        pseudonymizer: &Pseudonymizer,
    ) -> Result<Self, ContractViolation> {
        let mut directory = Self::default();
        for grant in grants {
            let digest: Hash32 = hex::decode(grant.token_sha256.trim())
                .ok()
                .and_then(|bytes| bytes.try_into().ok())
                .ok_or(ContractViolation::InvalidValue {
                    field: "credential.token_sha256",
                    reason: "must be 64 hex chars",
                })?;
            if grant.subject_id.trim().is_empty() {
                return Err(ContractViolation::InvalidValue {
                    field: "credential.subject_id",
                    reason: "must not be empty",
                });
            }
            if grant.tiers.is_empty() {
                return Err(ContractViolation::InvalidValue {
                    field: "credential.tiers",
                    reason: "must grant at least one tier",
                });
            }
            directory.push(digest, pseudonymizer.pseudonym(&grant.subject_id), &grant.tiers);
        }
        Ok(directory)
    }

    /// Registers a plaintext token; used by embedders that mint tokens in-process.
    pub fn insert_token(
        &mut self,
        token: &str,
        subject: SubjectPseudonym,
        tiers: &[DisclosureTier],
    ) {
        self.push(sha256(token.as_bytes()), subject, tiers);
    }

    fn push(&mut self, token_digest: Hash32, subject: SubjectPseudonym, tiers: &[DisclosureTier]) {
        self.entries.push(DirectoryEntry {
            token_digest,
            subject,
            tiers: tiers.iter().copied().collect(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn authenticate(&self, presented: &str) -> Option<&DirectoryEntry> {
        let digest = sha256(presented.as_bytes());
        let mut found = None;
        for entry in &self.entries {
            if bool::from(entry.token_digest[..].ct_eq(&digest[..])) && found.is_none() {
                found = Some(entry);
            }
        }
        found
    }
}

/// Compares an admin bearer against the configured admin token digest.
pub fn admin_token_matches(expected_digest: &Hash32, presented: Option<&str>) -> bool {
    match presented {
        Some(token) if !token.is_empty() => {
            bool::from(sha256(token.as_bytes())[..].ct_eq(&expected_digest[..]))
        }
        _ => false,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConsentRequest<'a> {
    pub bearer: Option<&'a str>,
    pub tier_segment: &'a str,
    pub required_scope: ConsentScope,
    pub operation: &'a OperationName,
    pub trace_id: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct ConsentGrant {
    pub context: ConsentContext,
    pub receipt: AuditReceipt,
}

struct Denial {
    error: GovernanceError,
    reason_code: ReasonCodeId,
    stage: &'static str,
    subject: Option<SubjectPseudonym>,
    tier: Option<DisclosureTier>,
}

pub struct ConsentResolver {
    directory: CredentialDirectory,
    ledger: Arc<dyn HashChain>,
    telemetry: GovernanceTelemetry,
}

impl std::fmt::Debug for ConsentResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentResolver")
            .field("credentials", &self.directory.len())
            .finish()
    }
}

/// Propagates a well-formed caller trace id, otherwise mints a UUID v4.
pub fn resolve_trace_id(presented: Option<&str>) -> TraceId {
    presented
        .and_then(|raw| TraceId::new(raw.trim()).ok())
        .unwrap_or_else(|| TraceId::from_u128(uuid::Uuid::new_v4().as_u128()))
}

impl ConsentResolver {
    pub fn new(
        directory: CredentialDirectory,
        ledger: Arc<dyn HashChain>,
        telemetry: GovernanceTelemetry,
    ) -> Self {
        Self {
            directory,
            ledger,
            telemetry,
        }
    }

    /// Authenticate, then parse the tier, then authorize. Every outcome is
    /// chained: `consent_grant` on success, `consent_denial` otherwise. A grant
    /// whose audit event cannot be appended is refused.
    pub fn resolve(
        &self,
        request: &ConsentRequest<'_>,
        now: MonotonicTimeNs,
    ) -> Result<ConsentGrant, GovernanceError> {
        let trace_id = resolve_trace_id(request.trace_id);
        let (tier, subject) = match self.authorize(request) {
            Ok(v) => v,
            Err(denial) => return Err(self.deny(request, &trace_id, denial, now)),
        };

        let context = ConsentContext::resolved(tier, subject, trace_id);
        let emit = EmitRequest::new(
            AuditEventType::ConsentGrant,
            request.operation.clone(),
            json!({
                "decision": "grant",
                "tier": tier.as_str(),
                "required_scope": request.required_scope.as_str(),
                "reason_code": reason_codes::MNEMO_CONSENT_OK_GRANTED.to_string(),
            }),
        )
        .with_consent(context.record().clone());
        let receipt = self.ledger.emit(emit, now).map_err(|err| {
            tracing::error!(
                target: "mnemo.consent",
                trace_id = context.trace_id().as_str(),
                reason_code = %reason_codes::MNEMO_CONSENT_AUDIT_FAILED,
                "consent grant could not be audited; refusing"
            );
            GovernanceError::from(err)
        })?;
        self.telemetry.record_consent_decision("grant", "granted");
        tracing::info!(
            target: "mnemo.consent",
            trace_id = context.trace_id().as_str(),
            subject = %context.subject(),
            tier = tier.as_str(),
            operation = %request.operation,
            event_id = receipt.event_id.as_str(),
            "consent granted"
        );
        Ok(ConsentGrant { context, receipt })
    }

    fn authorize(
        &self,
        request: &ConsentRequest<'_>,
    ) -> Result<(DisclosureTier, SubjectPseudonym), Denial> {
        let bearer = request.bearer.map(str::trim).filter(|b| !b.is_empty());
        let Some(bearer) = bearer else {
            return Err(Denial {
                error: GovernanceError::unauthorized("missing bearer credential"),
                reason_code: reason_codes::MNEMO_CONSENT_CREDENTIAL_MISSING,
                stage: "authenticate",
                subject: None,
                tier: None,
            });
        };
        let Some(entry) = self.directory.authenticate(bearer) else {
            return Err(Denial {
                error: GovernanceError::unauthorized("unrecognized bearer credential"),
                reason_code: reason_codes::MNEMO_CONSENT_CREDENTIAL_UNKNOWN,
                stage: "authenticate",
                subject: None,
                tier: None,
            });
        };

        let tier = DisclosureTier::parse(request.tier_segment).map_err(|v| Denial {
            error: v.into(),
            reason_code: reason_codes::MNEMO_CONSENT_TIER_INVALID,
            stage: "parse_tier",
            subject: Some(entry.subject.clone()),
            tier: None,
        })?;

        if !entry.tiers.contains(&tier) {
            return Err(Denial {
                error: GovernanceError::forbidden(ForbiddenReason::TierNotGranted {
                    tier: tier.as_str().to_string(),
                }),
                reason_code: reason_codes::MNEMO_CONSENT_TIER_NOT_GRANTED,
                stage: "authorize",
                subject: Some(entry.subject.clone()),
                tier: Some(tier),
            });
        }
        if !tier.granted_scopes().contains(&request.required_scope) {
            let reason = scope_denial(tier, request.required_scope);
            let reason_code = match reason {
                ForbiddenReason::IndividualAccessDenied { .. } => {
                    reason_codes::MNEMO_CONSENT_INDIVIDUAL_ACCESS_DENIED
                }
                _ => reason_codes::MNEMO_CONSENT_SCOPE_NOT_GRANTED,
            };
            return Err(Denial {
                error: GovernanceError::forbidden(reason),
                reason_code,
                stage: "authorize",
                subject: Some(entry.subject.clone()),
                tier: Some(tier),
            });
        }
        Ok((tier, entry.subject.clone()))
    }

    fn deny(
        &self,
        request: &ConsentRequest<'_>,
        trace_id: &TraceId,
        denial: Denial,
        now: MonotonicTimeNs,
    ) -> GovernanceError {
        let code = denial.error.public_code().as_str();
        let mut emit = EmitRequest::new(
            AuditEventType::ConsentDenial,
            request.operation.clone(),
            json!({
                "decision": "deny",
                "stage": denial.stage,
                "error": code,
                "reason": denial.error.to_string(),
                "reason_code": denial.reason_code.to_string(),
                "tier": denial.tier.map(DisclosureTier::as_str),
                "required_scope": request.required_scope.as_str(),
                "trace_id": trace_id.as_str(),
            }),
        );
        if let Some(subject) = denial.subject.clone() {
            emit = emit.with_subject(subject);
        }
        if self.ledger.emit(emit, now).is_err() {
            tracing::error!(
                target: "mnemo.consent",
                trace_id = trace_id.as_str(),
                reason_code = %reason_codes::MNEMO_CONSENT_AUDIT_FAILED,
                "consent denial could not be audited"
            );
        }
        self.telemetry.record_consent_decision("deny", denial.stage);
        tracing::warn!(
            target: "mnemo.consent",
            trace_id = trace_id.as_str(),
            stage = denial.stage,
            error = code,
            reason_code = %denial.reason_code,
            operation = %request.operation,
            "consent denied"
        );
        denial.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::InProcessKms;
    use crate::ledger::MerkleAuditLedger;
    use crate::signer::Ed25519KeyRegistry;
    use mnemo_kernel_contracts::audit::ChainVerification;
    use mnemo_kernel_contracts::PublicErrorCode;

    const PERSONAL_TOKEN: &str = "tok-personal-alice";
    const COHORT_TOKEN: &str = "tok-cohort-alice";

    fn ledger() -> Arc<MerkleAuditLedger> {
        let registry =
            Ed25519KeyRegistry::new(Arc::new(InProcessKms::new()), MonotonicTimeNs(1)).unwrap();
        Arc::new(MerkleAuditLedger::new(
            Arc::new(registry),
            GovernanceTelemetry::new(),
        ))
    }

    fn resolver(ledger: Arc<MerkleAuditLedger>) -> ConsentResolver {
        let p = Pseudonymizer::new(b"test-salt");
        let mut dir = CredentialDirectory::default();
        dir.insert_token(PERSONAL_TOKEN, p.pseudonym("alice"), &[DisclosureTier::Personal]);
        dir.insert_token(
            COHORT_TOKEN,
            p.pseudonym("alice"),
            &[DisclosureTier::Cohort, DisclosureTier::Population],
        );
        ConsentResolver::new(dir, ledger, GovernanceTelemetry::new())
    }

    fn request<'a>(
        bearer: Option<&'a str>,
        tier: &'a str,
        scope: ConsentScope,
        op: &'a OperationName,
    ) -> ConsentRequest<'a> {
        ConsentRequest {
            bearer,
            tier_segment: tier,
            required_scope: scope,
            operation: op,
            trace_id: Some("trace-abc"),
        }
    }

    #[test]
    fn at_consent_01_missing_credential_is_unauthorized_before_tier_logic() {
        let ledger = ledger();
        let r = resolver(ledger.clone());
        let op = OperationName::new("recall").unwrap();
        // An invalid tier would be a validation failure; authentication comes first.
        for tier in ["personal", "not-a-tier"] {
            let err = r
                .resolve(&request(None, tier, ConsentScope::MemoryRead, &op), MonotonicTimeNs(5))
                .unwrap_err();
            assert_eq!(err.public_code(), PublicErrorCode::Unauthorized);
        }
        let events = ledger.export().events;
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.event_type == AuditEventType::ConsentDenial && e.subject.is_none()));
        assert_eq!(events[0].payload["stage"], "authenticate");
    }

    #[test]
    fn at_consent_02_unknown_tier_is_validation_failure() {
        let r = resolver(ledger());
        let op = OperationName::new("recall").unwrap();
        let err = r
            .resolve(
                &request(Some(PERSONAL_TOKEN), "family", ConsentScope::MemoryRead, &op),
                MonotonicTimeNs(5),
            )
            .unwrap_err();
        assert_eq!(err.public_code(), PublicErrorCode::ValidationFailure);
    }

    #[test]
    fn at_consent_03_valid_credential_without_tier_is_forbidden() {
        let r = resolver(ledger());
        let op = OperationName::new("distill").unwrap();
        let err = r
            .resolve(
                &request(Some(PERSONAL_TOKEN), "cohort", ConsentScope::AggregateRead, &op),
                MonotonicTimeNs(5),
            )
            .unwrap_err();
        assert_eq!(
            err,
            GovernanceError::forbidden(ForbiddenReason::TierNotGranted {
                tier: "cohort".to_string()
            })
        );
    }

    #[test]
    fn at_consent_04_cohort_caller_can_never_read_individual_content() {
        let r = resolver(ledger());
        let op = OperationName::new("recall").unwrap();
        let err = r
            .resolve(
                &request(Some(COHORT_TOKEN), "cohort", ConsentScope::MemoryRead, &op),
                MonotonicTimeNs(5),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            GovernanceError::Forbidden {
                reason: ForbiddenReason::IndividualAccessDenied { .. }
            }
        ));
    }

    #[test]
    fn at_consent_05_grant_is_chained_and_carries_context() {
        let ledger = ledger();
        let r = resolver(ledger.clone());
        let op = OperationName::new("store").unwrap();
        let grant = r
            .resolve(
                &request(Some(PERSONAL_TOKEN), "personal", ConsentScope::MemoryWrite, &op),
                MonotonicTimeNs(5),
            )
            .unwrap();
        assert_eq!(grant.context.disclosure_tier(), DisclosureTier::Personal);
        assert_eq!(grant.context.trace_id().as_str(), "trace-abc");
        assert!(grant.context.has_scope(ConsentScope::MemoryExport));
        assert_eq!(
            grant.context.subject(),
            &Pseudonymizer::new(b"test-salt").pseudonym("alice")
        );
        let events = ledger.export().events;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::ConsentGrant);
        assert_eq!(events[0].consent_context.as_ref(), Some(grant.context.record()));
        assert_eq!(ledger.verify_chain_integrity(), ChainVerification::ok(1));
    }

    #[test]
    fn pseudonyms_depend_on_salt_and_hide_raw_ids() {
        let a = Pseudonymizer::new(b"salt-a").pseudonym("alice");
        let b = Pseudonymizer::new(b"salt-b").pseudonym("alice");
        assert_ne!(a, b);
        assert!(!a.as_str().contains("alice"));
    }

    #[test]
    fn malformed_trace_id_is_replaced() {
        let t = resolve_trace_id(Some("bad trace\n"));
        assert_eq!(t.as_str().len(), 32);
        assert_eq!(resolve_trace_id(Some("t-1")).as_str(), "t-1");
    }

    #[test]
    fn grants_require_hex_digest_and_tiers() {
        let p = Pseudonymizer::new(b"s");
        let good = CredentialGrant {
            token_sha256: hex::encode(sha256(b"tok")),
            subject_id: "bob".to_string(),
            tiers: vec![DisclosureTier::Personal],
            label: None,
        };
        let dir = CredentialDirectory::from_grants(&[good.clone()], &p).unwrap();
        assert!(dir.authenticate("tok").is_some());
        assert!(dir.authenticate("tok2").is_none());
        let bad = CredentialGrant {
            token_sha256: "nothex".to_string(),
            ..good.clone()
        };
        assert!(CredentialDirectory::from_grants(&[bad], &p).is_err());
        let no_tiers = CredentialGrant {
            tiers: vec![],
            ..good
        };
        assert!(CredentialDirectory::from_grants(&[no_tiers], &p).is_err());
    }

    #[test]
    fn admin_token_comparison() {
        let digest = sha256(b"admin-secret");
        assert!(admin_token_matches(&digest, Some("admin-secret")));
        assert!(!admin_token_matches(&digest, Some("admin-secreT")));
        assert!(!admin_token_matches(&digest, None));
        assert!(!admin_token_matches(&digest, Some("")));
    }
}
