#![forbid(unsafe_code)]

//! Append-only audit ledger: a SHA-256 hash chain over canonical event bodies,
//! with every event hash also folded into an RFC 6962 Merkle tree.
//!
//! Each emit signs `{event_id, leaf_hash, root_hash, timestamp}` at the height
//! the event produced and stores the signature on the event, so an exported
//! chain plus the published key set is enough to re-verify every receipt.

use std::sync::Arc;
use std::time::Instant;

use mnemo_kernel_contracts::audit::{
    AuditEvent, AuditEventId, AuditEventType, AuditReceipt, ChainFailureReason,
    ChainVerification, LedgerExport, LedgerHead, MerkleProof, OperationName,
    ReceiptSigningPayload, AUDIT_CONTRACT_VERSION, GENESIS_PREVIOUS_HASH,
};
use mnemo_kernel_contracts::keys::PublicKeySet;
use mnemo_kernel_contracts::tier::{ConsentContextRecord, SubjectPseudonym};
use mnemo_kernel_contracts::{
    ContractViolation, GovernanceError, InternalFailure, MonotonicTimeNs, Validate,
};
use parking_lot::Mutex;
use serde_json::Value;

use crate::canonical::{canonical_hash, CanonicalBytes, CanonicalError, Hash32};
use crate::merkle::{self, MerkleFrontier};
use crate::signer::{verify_detached, SignatureCheckError, Signer, SignerError};
use crate::telemetry::GovernanceTelemetry;

pub mod reason_codes {
    use mnemo_kernel_contracts::ReasonCodeId;

    pub const MNEMO_AUDIT_OK_APPENDED: ReasonCodeId = ReasonCodeId(0x4155_0001);
    pub const MNEMO_AUDIT_SIGNING_FAILED: ReasonCodeId = ReasonCodeId(0x4155_00F1);
    pub const MNEMO_AUDIT_CHAIN_BROKEN: ReasonCodeId = ReasonCodeId(0x4155_00F2);
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error("canonical encoding failed: {0}")]
    Canonical(#[from] CanonicalError),
    #[error("signing failed: {0}")]
    Signing(#[from] SignerError),
    #[error("audit event {0} not found")]
    EventNotFound(String),
}

impl From<LedgerError> for GovernanceError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Contract(v) => v.into(),
            LedgerError::Canonical(e) => GovernanceError::internal(InternalFailure::Signing {
                detail: e.to_string(),
            }),
            LedgerError::Signing(e) => GovernanceError::internal(InternalFailure::Signing {
                detail: e.to_string(),
            }),
            LedgerError::EventNotFound(id) => GovernanceError::NotFound {
                resource: format!("audit event {id}"),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmitRequest {
    pub event_type: AuditEventType,
    pub operation: OperationName,
    pub payload: Value,
    pub consent_context: Option<ConsentContextRecord>,
    pub subject: Option<SubjectPseudonym>,
}

impl EmitRequest {
    pub fn new(event_type: AuditEventType, operation: OperationName, payload: Value) -> Self {
        Self {
            event_type,
            operation,
            payload,
            consent_context: None,
            subject: None,
        }
    }

    pub fn with_consent(mut self, record: ConsentContextRecord) -> Self {
        self.subject = Some(record.subject_pseudonym.clone());
        self.consent_context = Some(record);
        self
    }

    pub fn with_subject(mut self, subject: SubjectPseudonym) -> Self {
        self.subject = Some(subject);
        self
    }
}

/// Ledger seam. One real implementation; the runtime lets callers wrap it.
pub trait HashChain: Send + Sync {
    fn emit(&self, request: EmitRequest, now: MonotonicTimeNs) -> Result<AuditReceipt, LedgerError>;
    fn verify_chain_integrity(&self) -> ChainVerification;
    fn ledger_height(&self) -> u64;
    fn head(&self) -> LedgerHead;
    fn export(&self) -> LedgerExport;
    fn receipt_for(&self, event_id: &str) -> Result<AuditReceipt, LedgerError>;
    fn public_key_set(&self) -> PublicKeySet;
}

#[derive(Debug, Default)]
struct LedgerState {
    events: Vec<AuditEvent>,
    leaves: Vec<Hash32>,
    frontier: MerkleFrontier,
}

impl LedgerState {
    fn last_hash(&self) -> &str {
        self.events
            .last()
            .map(|e| e.current_hash.as_str())
            .unwrap_or(GENESIS_PREVIOUS_HASH)
    }

    fn head(&self) -> LedgerHead {
        LedgerHead {
            height: self.frontier.size(),
            root_hash: hex::encode(self.frontier.root()),
            last_event_hash: self.last_hash().to_string(),
        }
    }
}

pub struct MerkleAuditLedger {
    signer: Arc<dyn Signer>,
    telemetry: GovernanceTelemetry,
    state: Mutex<LedgerState>,
}

impl std::fmt::Debug for MerkleAuditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MerkleAuditLedger")
            .field("height", &self.state.lock().frontier.size())
            .finish()
    }
}

fn decode_hash(value: &str) -> Option<Hash32> {
    hex::decode(value).ok()?.try_into().ok()
}

fn receipt_signing_bytes(
    event_id: &str,
    leaf: &Hash32,
    root: &Hash32,
    timestamp: MonotonicTimeNs,
) -> Result<CanonicalBytes, CanonicalError> {
    CanonicalBytes::encode(&ReceiptSigningPayload {
        event_id,
        leaf_hash: &hex::encode(leaf),
        root_hash: &hex::encode(root),
        timestamp,
    })
}

impl MerkleAuditLedger {
    pub fn new(signer: Arc<dyn Signer>, telemetry: GovernanceTelemetry) -> Self {
        Self {
            signer,
            telemetry,
            state: Mutex::new(LedgerState::default()),
        }
    }
}

fn receipt_for_event(
    event: &AuditEvent,
    leaf: &Hash32,
    root: &Hash32,
    audit_path: &[Hash32],
) -> AuditReceipt {
    AuditReceipt {
        receipt_id: format!("rcpt_{}", event.leaf_index),
        event_id: event.event_id.clone(),
        timestamp: event.timestamp,
        signature: event.signature.clone(),
        key_id: event.key_id.clone(),
        merkle_proof: MerkleProof {
            leaf_index: event.leaf_index,
            leaf_hash: hex::encode(leaf),
            root_hash: hex::encode(root),
            audit_path: audit_path.iter().map(hex::encode).collect(),
        },
        ledger_height: event.leaf_index + 1,
    }
}

impl HashChain for MerkleAuditLedger {
    /// All-or-nothing: state is only touched after the signature exists, and the
    /// whole append runs under one lock with no await points.
    fn emit(&self, request: EmitRequest, now: MonotonicTimeNs) -> Result<AuditReceipt, LedgerError> {
        let mut state = self.state.lock();
        let leaf_index = state.events.len() as u64;
        let mut event = AuditEvent {
            event_id: AuditEventId::new(format!("evt_{}", uuid::Uuid::new_v4().simple()))?,
            event_type: request.event_type,
            timestamp: now,
            operation: request.operation,
            subject: request.subject,
            consent_context: request.consent_context,
            payload: request.payload,
            leaf_index,
            previous_hash: state.last_hash().to_string(),
            current_hash: String::new(),
            key_id: String::new(),
            signature: String::new(),
        };
        if !event.payload.is_object() {
            return Err(ContractViolation::InvalidValue {
                field: "audit_event.payload",
                reason: "must be a JSON object",
            }
            .into());
        }

        let current = canonical_hash(&event.hashed_body())?;
        let leaf = merkle::leaf_hash(&current);
        let audit_path = state.frontier.append_path();
        let mut frontier = state.frontier.clone();
        frontier.push(leaf);
        let root = frontier.root();

        let signing_bytes = receipt_signing_bytes(event.event_id.as_str(), &leaf, &root, now)?;
        let started = Instant::now();
        let signed = self.signer.sign(&signing_bytes).map_err(|err| {
            tracing::error!(
                target: "mnemo.audit",
                event_type = event.event_type.as_str(),
                operation = %event.operation,
                reason_code = %reason_codes::MNEMO_AUDIT_SIGNING_FAILED,
                "audit append rolled back"
            );
            err
        })?;
        self.telemetry.record_signing_latency(started.elapsed());

        event.current_hash = hex::encode(current);
        event.key_id = signed.key_id;
        event.signature = signed.signature_hex;
        event.validate()?;

        state.events.push(event);
        state.leaves.push(leaf);
        state.frontier = frontier;

        let height = state.frontier.size();
        let appended = &state.events[state.events.len() - 1];
        let receipt = receipt_for_event(appended, &leaf, &root, &audit_path);
        self.telemetry
            .record_audit_event(appended.event_type.as_str(), appended.operation.as_str(), height);
        tracing::info!(
            target: "mnemo.audit",
            event_id = appended.event_id.as_str(),
            event_type = appended.event_type.as_str(),
            operation = %appended.operation,
            leaf_index = appended.leaf_index,
            key_id = %appended.key_id,
            reason_code = %reason_codes::MNEMO_AUDIT_OK_APPENDED,
            "audit event appended"
        );
        Ok(receipt)
    }

    fn verify_chain_integrity(&self) -> ChainVerification {
        let events = self.state.lock().events.clone();
        let outcome = verify_chain(&events, &self.signer.public_key_set());
        if !outcome.valid {
            self.telemetry.record_chain_verification_failure();
            tracing::error!(
                target: "mnemo.audit",
                failure_index = outcome.failure_index,
                failure_reason = outcome.failure_reason.map(ChainFailureReason::as_str),
                reason_code = %reason_codes::MNEMO_AUDIT_CHAIN_BROKEN,
                "audit chain verification failed"
            );
        }
        outcome
    }

    fn ledger_height(&self) -> u64 {
        self.state.lock().frontier.size()
    }

    fn head(&self) -> LedgerHead {
        self.state.lock().head()
    }

    fn export(&self) -> LedgerExport {
        let state = self.state.lock();
        LedgerExport {
            schema_version: AUDIT_CONTRACT_VERSION,
            head: state.head(),
            events: state.events.clone(),
        }
    }

    /// Historical receipts rebuild the proof at the event's own height. The
    /// leaves are copied out so the rehash runs without holding the append lock.
    fn receipt_for(&self, event_id: &str) -> Result<AuditReceipt, LedgerError> {
        let (event, leaves) = {
            let state = self.state.lock();
            let index = state
                .events
                .iter()
                .position(|e| e.event_id.as_str() == event_id)
                .ok_or_else(|| LedgerError::EventNotFound(event_id.to_string()))?;
            (state.events[index].clone(), state.leaves[..=index].to_vec())
        };
        let index = leaves.len() - 1;
        let path = merkle::inclusion_proof(&leaves, index, leaves.len())
            .ok_or_else(|| LedgerError::EventNotFound(event_id.to_string()))?;
        let root = merkle::merkle_root(&leaves);
        Ok(receipt_for_event(&event, &leaves[index], &root, &path))
    }

    fn public_key_set(&self) -> PublicKeySet {
        self.signer.public_key_set()
    }
}

/// Re-derives every link, leaf, per-height root and signature from the events
/// alone. The first failure stops the walk.
pub fn verify_chain(events: &[AuditEvent], keys: &PublicKeySet) -> ChainVerification {
    let mut frontier = MerkleFrontier::new();
    let mut previous = GENESIS_PREVIOUS_HASH;
    for (i, event) in events.iter().enumerate() {
        let index = i as u64;
        if event.validate().is_err() {
            return ChainVerification::failed(index, ChainFailureReason::MalformedEvent);
        }
        if event.leaf_index != index {
            return ChainVerification::failed(index, ChainFailureReason::LeafIndexMismatch);
        }
        if event.previous_hash != previous {
            return ChainVerification::failed(index, ChainFailureReason::PreviousHashMismatch);
        }
        let Ok(recomputed) = canonical_hash(&event.hashed_body()) else {
            return ChainVerification::failed(index, ChainFailureReason::MalformedEvent);
        };
        if decode_hash(&event.current_hash) != Some(recomputed) {
            return ChainVerification::failed(index, ChainFailureReason::CurrentHashMismatch);
        }
        let leaf = merkle::leaf_hash(&recomputed);
        frontier.push(leaf);
        let Ok(payload) =
            receipt_signing_bytes(event.event_id.as_str(), &leaf, &frontier.root(), event.timestamp)
        else {
            return ChainVerification::failed(index, ChainFailureReason::MalformedEvent);
        };
        match verify_detached(keys, &event.key_id, &payload, &event.signature) {
            Ok(()) => {}
            Err(SignatureCheckError::UnknownKeyId) => {
                return ChainVerification::failed(index, ChainFailureReason::UnknownKeyId)
            }
            Err(_) => return ChainVerification::failed(index, ChainFailureReason::SignatureInvalid),
        }
        previous = event.current_hash.as_str();
    }
    ChainVerification::ok(events.len() as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReceiptError {
    #[error("receipt is malformed")]
    Malformed,
    #[error("inclusion proof does not reproduce the root")]
    InclusionProofInvalid,
    #[error("receipt signature check failed: {0}")]
    Signature(SignatureCheckError),
}

/// Checks a receipt using only the published key set: the audit path must
/// rebuild `root_hash` and the signature must cover the canonical payload.
pub fn verify_receipt(receipt: &AuditReceipt, keys: &PublicKeySet) -> Result<(), ReceiptError> {
    receipt.validate().map_err(|_| ReceiptError::Malformed)?;
    let proof = &receipt.merkle_proof;
    let leaf = decode_hash(&proof.leaf_hash).ok_or(ReceiptError::Malformed)?;
    let root = decode_hash(&proof.root_hash).ok_or(ReceiptError::Malformed)?;
    let path = proof
        .audit_path
        .iter()
        .map(|node| decode_hash(node))
        .collect::<Option<Vec<_>>>()
        .ok_or(ReceiptError::Malformed)?;
    if !merkle::verify_inclusion(&leaf, proof.leaf_index, receipt.ledger_height, &path, &root) {
        return Err(ReceiptError::InclusionProofInvalid);
    }
    let payload =
        CanonicalBytes::encode(&receipt.signing_payload()).map_err(|_| ReceiptError::Malformed)?;
    verify_detached(keys, &receipt.key_id, &payload, &receipt.signature)
        .map_err(ReceiptError::Signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::InProcessKms;
    use crate::signer::{DetachedSignature, Ed25519KeyRegistry};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn registry() -> Arc<Ed25519KeyRegistry> {
        Arc::new(
            Ed25519KeyRegistry::new(Arc::new(InProcessKms::new()), MonotonicTimeNs(1)).unwrap(),
        )
    }

    fn ledger_with(registry: Arc<Ed25519KeyRegistry>) -> MerkleAuditLedger {
        MerkleAuditLedger::new(registry, GovernanceTelemetry::new())
    }

    fn stored(n: u64) -> EmitRequest {
        EmitRequest::new(
            AuditEventType::MemoryStored,
            OperationName::new("store").unwrap(),
            json!({"record_id": format!("rec_{n}"), "tier": "personal"}),
        )
    }

    #[test]
    fn at_audit_01_chain_links_and_height_increments() {
        let ledger = ledger_with(registry());
        for n in 0..5 {
            let receipt = ledger.emit(stored(n), MonotonicTimeNs(10 + n)).unwrap();
            assert_eq!(receipt.ledger_height, n + 1);
            assert_eq!(receipt.merkle_proof.leaf_index, n);
        }
        assert_eq!(ledger.ledger_height(), 5);
        let export = ledger.export();
        assert_eq!(export.events[0].previous_hash, GENESIS_PREVIOUS_HASH);
        for pair in export.events.windows(2) {
            assert_eq!(pair[1].previous_hash, pair[0].current_hash);
        }
        assert_eq!(ledger.verify_chain_integrity(), ChainVerification::ok(5));
    }

    #[test]
    fn at_audit_02_mutated_and_rehashed_event_is_detected() {
        let ledger = ledger_with(registry());
        for n in 0..4 {
            ledger.emit(stored(n), MonotonicTimeNs(10 + n)).unwrap();
        }
        let keys = ledger.public_key_set();
        let mut events = ledger.export().events;
        events[2].payload = json!({"record_id": "rec_forged", "tier": "personal"});
        events[2].current_hash = hex::encode(canonical_hash(&events[2].hashed_body()).unwrap());
        let outcome = verify_chain(&events, &keys);
        assert!(!outcome.valid);
        assert_eq!(outcome.failure_index, Some(2));
        assert_eq!(outcome.failure_reason, Some(ChainFailureReason::SignatureInvalid));

        let mut events = ledger.export().events;
        events[1].payload = json!({"record_id": "rec_forged", "tier": "personal"});
        let outcome = verify_chain(&events, &keys);
        assert_eq!(outcome.failure_index, Some(1));
        assert_eq!(outcome.failure_reason, Some(ChainFailureReason::CurrentHashMismatch));
    }

    #[test]
    fn at_audit_03_receipts_verify_offline_across_rotation() {
        let reg = registry();
        let ledger = ledger_with(reg.clone());
        let early = ledger.emit(stored(0), MonotonicTimeNs(10)).unwrap();
        reg.rotate(None, MonotonicTimeNs(11)).unwrap();
        let late = ledger.emit(stored(1), MonotonicTimeNs(12)).unwrap();
        assert_ne!(early.key_id, late.key_id);
        let keys = reg.public_key_set();
        assert_eq!(verify_receipt(&early, &keys), Ok(()));
        assert_eq!(verify_receipt(&late, &keys), Ok(()));
        assert_eq!(ledger.verify_chain_integrity(), ChainVerification::ok(2));
        assert_eq!(ledger.receipt_for(early.event_id.as_str()).unwrap(), early);
    }

    #[test]
    fn at_audit_04_signing_failure_leaves_no_trace() {
        struct FlakySigner {
            inner: Option<Arc<Ed25519KeyRegistry>>,
            fail: AtomicBool,
        }
        impl Signer for FlakySigner {
            fn sign(&self, payload: &CanonicalBytes) -> Result<DetachedSignature, SignerError> {
                if self.fail.load(Ordering::SeqCst) {
                    return Err(SignerError::NoActiveKey);
                }
                self.inner.as_ref().unwrap().sign(payload)
            }
            fn public_key_set(&self) -> PublicKeySet {
                self.inner.as_ref().unwrap().public_key_set()
            }
            fn active_key_id(&self) -> Option<String> {
                self.inner.as_ref().unwrap().active_key_id()
            }
        }

        let signer = Arc::new(FlakySigner {
            inner: Some(registry()),
            fail: AtomicBool::new(false),
        });
        let ledger = MerkleAuditLedger::new(signer.clone(), GovernanceTelemetry::new());
        ledger.emit(stored(0), MonotonicTimeNs(10)).unwrap();
        let head_before = ledger.head();
        signer.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            ledger.emit(stored(1), MonotonicTimeNs(11)),
            Err(LedgerError::Signing(_))
        ));
        assert_eq!(ledger.head(), head_before);
        signer.fail.store(false, Ordering::SeqCst);
        ledger.emit(stored(2), MonotonicTimeNs(12)).unwrap();
        assert_eq!(ledger.verify_chain_integrity(), ChainVerification::ok(2));
    }

    #[test]
    fn non_object_payload_is_rejected_before_append() {
        let ledger = ledger_with(registry());
        let req = EmitRequest::new(
            AuditEventType::MemoryStored,
            OperationName::new("store").unwrap(),
            json!(["not", "an", "object"]),
        );
        assert!(matches!(
            ledger.emit(req, MonotonicTimeNs(1)),
            Err(LedgerError::Contract(_))
        ));
        assert_eq!(ledger.ledger_height(), 0);
    }

    #[test]
    fn unknown_key_is_reported_as_such() {
        let ledger = ledger_with(registry());
        ledger.emit(stored(0), MonotonicTimeNs(10)).unwrap();
        let events = ledger.export().events;
        let outcome = verify_chain(&events, &PublicKeySet::default());
        assert_eq!(outcome.failure_reason, Some(ChainFailureReason::UnknownKeyId));
    }

    #[test]
    fn head_root_matches_last_receipt_root() {
        let ledger = ledger_with(registry());
        let mut last = None;
        for n in 0..7 {
            last = Some(ledger.emit(stored(n), MonotonicTimeNs(10 + n)).unwrap());
        }
        let last = last.unwrap();
        assert_eq!(ledger.head().root_hash, last.merkle_proof.root_hash);
    }

    #[test]
    fn at_audit_05_emit_receipt_equals_rebuilt_historical_receipt() {
        let ledger = ledger_with(registry());
        let receipts: Vec<AuditReceipt> = (0..33)
            .map(|n| ledger.emit(stored(n), MonotonicTimeNs(10 + n)).unwrap())
            .collect();
        let keys = ledger.public_key_set();
        for receipt in &receipts {
            assert_eq!(&ledger.receipt_for(receipt.event_id.as_str()).unwrap(), receipt);
            assert_eq!(verify_receipt(receipt, &keys), Ok(()));
        }
    }

    #[test]
    fn at_audit_06_emit_cost_does_not_grow_with_height() {
        const BATCH: u64 = 200;
        let ledger = ledger_with(registry());
        let timed_batch = |from: u64| {
            let started = Instant::now();
            for n in from..from + BATCH {
                ledger.emit(stored(n), MonotonicTimeNs(n)).unwrap();
            }
            started.elapsed()
        };
        for n in 0..10 {
            ledger.emit(stored(n), MonotonicTimeNs(n)).unwrap();
        }
        let early = timed_batch(10);
        while ledger.ledger_height() < 10_000 {
            let n = ledger.ledger_height();
            ledger.emit(stored(n), MonotonicTimeNs(n)).unwrap();
        }
        let late = timed_batch(10_000);
        assert!(
            late < early * 4,
            "emit at height 10k took {late:?} per {BATCH}, at height 10 took {early:?}"
        );
        assert_eq!(ledger.ledger_height(), 10_000 + BATCH);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn at_audit_07_concurrent_emits_form_one_linked_chain() {
        let ledger = Arc::new(ledger_with(registry()));
        let mut tasks = Vec::new();
        for worker in 0..8u64 {
            let ledger = ledger.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                (0..25u64)
                    .map(|n| {
                        let id = worker * 100 + n;
                        ledger.emit(stored(id), MonotonicTimeNs(id)).unwrap()
                    })
                    .collect::<Vec<_>>()
            }));
        }
        let mut heights = Vec::new();
        for task in tasks {
            heights.extend(task.await.unwrap().into_iter().map(|r| r.ledger_height));
        }
        heights.sort_unstable();
        assert_eq!(heights, (1..=200).collect::<Vec<u64>>());

        let export = ledger.export();
        assert_eq!(export.events[0].previous_hash, GENESIS_PREVIOUS_HASH);
        for pair in export.events.windows(2) {
            assert_eq!(pair[1].previous_hash, pair[0].current_hash);
            assert_eq!(pair[1].leaf_index, pair[0].leaf_index + 1);
        }
        assert_eq!(ledger.verify_chain_integrity(), ChainVerification::ok(200));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]
        #[test]
        fn any_single_field_tamper_is_detected(len in 2u64..8, target_seed in any::<u64>(), field in 0u8..4) {
            let ledger = ledger_with(registry());
            for n in 0..len {
                ledger.emit(stored(n), MonotonicTimeNs(100 + n)).unwrap();
            }
            let keys = ledger.public_key_set();
            let mut events = ledger.export().events;
            let target = (target_seed % len) as usize;
            match field {
                0 => events[target].timestamp = MonotonicTimeNs(events[target].timestamp.0 + 1),
                1 => events[target].payload = json!({"record_id": "rec_x"}),
                2 => events[target].previous_hash = "f".repeat(64),
                _ => events[target].event_type = AuditEventType::MemoryForgotten,
            }
            let outcome = verify_chain(&events, &keys);
            prop_assert!(!outcome.valid);
            prop_assert_eq!(outcome.failure_index, Some(target as u64));
        }
    }
}
