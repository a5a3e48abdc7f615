#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mnemo_engines::aggregator::KAnonymityAggregator;
use mnemo_engines::consent::{
    admin_token_matches, ConsentContext, ConsentGrant, ConsentRequest, ConsentResolver,
    CredentialDirectory,
};
use mnemo_engines::envelope::{EnvelopeEncryptionService, EnvelopeError};
use mnemo_engines::ledger::{verify_receipt, EmitRequest, HashChain, MerkleAuditLedger};
use mnemo_engines::signer::{Ed25519KeyRegistry, Signer, SignerError};
use mnemo_engines::slo::{BreakerSnapshot, SloMonitor};
use mnemo_engines::telemetry::GovernanceTelemetry;
use mnemo_kernel_contracts::audit::{
    AuditEventType, AuditReceipt, ChainFailureReason, ChainVerification, LedgerExport, LedgerHead,
    OperationName,
};
use mnemo_kernel_contracts::keys::{JwkSet, PublicKeySet};
use mnemo_kernel_contracts::memory::{MemoryRecord, RecalledMemory, RecordFilter, RecordId};
use mnemo_kernel_contracts::operations::{
    DistillRequest, DistillResponse, ExportResponse, FilterRequest, ForgetResponse,
    KeyRotationResponse, RecallResponse, RotateMasterKeyRequest, RotateSigningKeyRequest,
    StoreRequest, StoreResponse,
};
use mnemo_kernel_contracts::tier::{ConsentScope, DisclosureTier};
use mnemo_kernel_contracts::{
    ContractViolation, ForbiddenReason, GovernanceError, InternalFailure, MonotonicTimeNs,
    Validate,
};
use mnemo_storage::memory_store::InMemoryMemoryStore;
use mnemo_storage::repo::MemoryStoreRepo;
use parking_lot::Mutex;
use serde_json::{json, Value};
use zeroize::Zeroizing;

use crate::config::{ConfigError, GovernanceConfig};

pub mod reason_codes {
    use mnemo_kernel_contracts::ReasonCodeId;

    pub const MNEMO_OS_OK_STORED: ReasonCodeId = ReasonCodeId(0x4F53_0001);
    pub const MNEMO_OS_OK_FORGOTTEN: ReasonCodeId = ReasonCodeId(0x4F53_0002);
    pub const MNEMO_OS_OK_EXPORTED: ReasonCodeId = ReasonCodeId(0x4F53_0003);
    pub const MNEMO_OS_OK_KEY_ROTATED: ReasonCodeId = ReasonCodeId(0x4F53_0004);
    pub const MNEMO_OS_DEPENDENCY_TIMEOUT: ReasonCodeId = ReasonCodeId(0x4F53_00F1);
    pub const MNEMO_OS_ADMIN_DENIED: ReasonCodeId = ReasonCodeId(0x4F53_00F2);
    pub const MNEMO_OS_AUDIT_AFTER_WRITE_FAILED: ReasonCodeId = ReasonCodeId(0x4F53_00F3);
    pub const MNEMO_OS_RECEIPT_REJECTED: ReasonCodeId = ReasonCodeId(0x4F53_00F4);
    pub const MNEMO_OS_UNAUDITED_WRITE_KEPT: ReasonCodeId = ReasonCodeId(0x4F53_00F5);
    pub const MNEMO_OS_LATE_WRITE_REMOVED: ReasonCodeId = ReasonCodeId(0x4F53_00F6);
}

pub const OP_STORE: &str = "store";
pub const OP_RECALL: &str = "recall";
pub const OP_FORGET: &str = "forget";
pub const OP_EXPORT: &str = "export";
pub const OP_DISTILL: &str = "distill";
pub const OP_ROTATE_SIGNING_KEY: &str = "rotate_signing_key";
pub const OP_ROTATE_MASTER_KEY: &str = "rotate_master_key";

const DEP_STORAGE: &str = "storage";
const DEP_KEY_ACCESS: &str = "key_access";

const WRITE_PENDING: u8 = 0;
const WRITE_COMMITTED: u8 = 1;
const WRITE_ABANDONED: u8 = 2;

/// A request body as the boundary decoded it. Decode failures are carried in
/// and surface only after consent has resolved.
pub type DecodedBody<T> = Result<T, GovernanceError>;

/// The request fields the HTTP boundary hands over untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub bearer: Option<String>,
    pub tier: String,
    pub trace_id: Option<String>,
}

impl RequestEnvelope {
    pub fn new(tier: impl Into<String>) -> Self {
        Self {
            tier: tier.into(),
            ..Self::default()
        }
    }

    pub fn with_bearer(mut self, bearer: impl Into<String>) -> Self {
        self.bearer = Some(bearer.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GovernanceInitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid credential grant: {0}")]
    Credentials(#[from] ContractViolation),
    #[error("signing key registry: {0}")]
    Signer(#[from] SignerError),
    #[error("envelope encryption: {0}")]
    Envelope(#[from] EnvelopeError),
}

struct Admission {
    grant: ConsentGrant,
    operation: &'static str,
    started: Instant,
}

/// Runs blocking dependency work off the async workers, bounded by a timeout.
/// A timed-out task is abandoned; the caller gets `DependencyTimeout`.
async fn bounded<T, F>(
    dependency: &'static str,
    timeout_ms: u64,
    work: F,
) -> Result<T, GovernanceError>
where
    F: FnOnce() -> Result<T, GovernanceError> + Send + 'static,
    T: Send + 'static,
{
    let task = tokio::task::spawn_blocking(work);
    match tokio::time::timeout(Duration::from_millis(timeout_ms), task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(_)) => {
            let detail = format!("{dependency} task aborted");
            Err(GovernanceError::internal(if dependency == DEP_STORAGE {
                InternalFailure::Storage { detail }
            } else {
                InternalFailure::Encryption { detail }
            }))
        }
        Err(_) => {
            tracing::error!(
                dependency,
                timeout_ms,
                reason_code = %reason_codes::MNEMO_OS_DEPENDENCY_TIMEOUT,
                "dependency call timed out"
            );
            Err(GovernanceError::internal(InternalFailure::DependencyTimeout {
                dependency: dependency.to_string(),
                timeout_ms,
            }))
        }
    }
}

/// Personal-tier operations only ever see the caller's own records.
fn own_records_filter(context: &ConsentContext, mut filter: RecordFilter) -> RecordFilter {
    filter.subject = Some(context.subject().clone());
    filter
}

fn single_record(record_id: RecordId) -> RecordFilter {
    RecordFilter {
        record_ids: Some(vec![record_id]),
        ..RecordFilter::default()
    }
}

fn store_scope(tier_segment: &str) -> ConsentScope {
    match DisclosureTier::parse(tier_segment) {
        Ok(DisclosureTier::Cohort | DisclosureTier::Population) => ConsentScope::MemoryContribute,
        _ => ConsentScope::MemoryWrite,
    }
}

/// Process-wide application state. Every component is built here and injected
/// into the ones that depend on it; nothing is a module-level singleton.
pub struct GovernanceRuntime {
    config: GovernanceConfig,
    telemetry: GovernanceTelemetry,
    signer: Arc<Ed25519KeyRegistry>,
    ledger: Arc<dyn HashChain>,
    envelope: Arc<EnvelopeEncryptionService>,
    consent: ConsentResolver,
    slo: SloMonitor,
    aggregator: KAnonymityAggregator,
    store: Arc<dyn MemoryStoreRepo>,
    last_verification: Mutex<Option<(LedgerHead, ChainVerification)>>,
}

impl std::fmt::Debug for GovernanceRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceRuntime")
            .field("config", &self.config)
            .field("ledger", &self.ledger.head())
            .field("consent", &self.consent)
            .finish_non_exhaustive()
    }
}

impl GovernanceRuntime {
    pub fn new(
        config: GovernanceConfig,
        directory: CredentialDirectory,
        store: Arc<dyn MemoryStoreRepo>,
    ) -> Result<Self, GovernanceInitError> {
        Self::with_audit_chain(config, directory, store, |ledger| {
            ledger as Arc<dyn HashChain>
        })
    }

    /// Same as `new`, but the signed ledger passes through `wrap` before any
    /// component holds it, so every emit goes through the wrapper.
    pub fn with_audit_chain<F>(
        config: GovernanceConfig,
        directory: CredentialDirectory,
        store: Arc<dyn MemoryStoreRepo>,
        wrap: F,
    ) -> Result<Self, GovernanceInitError>
    where
        F: FnOnce(Arc<MerkleAuditLedger>) -> Arc<dyn HashChain>,
    {
        let now = MonotonicTimeNs::now();
        let telemetry = GovernanceTelemetry::new();
        let kms = config.kms_provider.build();
        let signer = Arc::new(Ed25519KeyRegistry::new(kms.clone(), now)?);
        let ledger = wrap(Arc::new(MerkleAuditLedger::new(
            signer.clone(),
            telemetry.clone(),
        )));
        let envelope = Arc::new(EnvelopeEncryptionService::new(
            kms,
            &config.initial_master_key_id,
            now,
        )?);
        let credentials = directory.len();
        let consent = ConsentResolver::new(directory, ledger.clone(), telemetry.clone());
        let slo = SloMonitor::new(config.slo.clone(), telemetry.clone());
        let aggregator = KAnonymityAggregator::new(config.aggregator);
        tracing::info!(
            kms_provider = config.kms_provider.as_str(),
            credentials,
            signing_key_id = signer.active_key_id().as_deref().unwrap_or("none"),
            master_key_id = %envelope.active_master_key_id(),
            k_anonymity_floor = config.aggregator.k_anonymity_floor,
            "governance runtime initialised"
        );
        Ok(Self {
            config,
            telemetry,
            signer,
            ledger,
            envelope,
            consent,
            slo,
            aggregator,
            store,
            last_verification: Mutex::new(None),
        })
    }

    /// Loads credential grants from the configured file and backs the runtime
    /// with the in-memory store.
    pub fn from_config(config: GovernanceConfig) -> Result<Self, GovernanceInitError> {
        let grants = config.load_credential_grants()?;
        let directory = CredentialDirectory::from_grants(&grants, &config.pseudonymizer())?;
        Self::new(config, directory, Arc::new(InMemoryMemoryStore::new()))
    }

    /// Nothing is buffered, so teardown only verifies and records the final head.
    pub fn shutdown(&self) -> ChainVerification {
        let head = self.ledger.head();
        let verification = self.ledger.verify_chain_integrity();
        tracing::info!(
            target: "mnemo.audit",
            height = head.height,
            root_hash = %head.root_hash,
            chain_valid = verification.valid,
            "governance runtime shut down"
        );
        verification
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &GovernanceTelemetry {
        &self.telemetry
    }

    fn admit(
        &self,
        operation: &'static str,
        envelope: &RequestEnvelope,
        required_scope: ConsentScope,
    ) -> Result<Admission, GovernanceError> {
        let op = OperationName::new(operation)?;
        let now = MonotonicTimeNs::now();
        let grant = self.consent.resolve(
            &ConsentRequest {
                bearer: envelope.bearer.as_deref(),
                tier_segment: &envelope.tier,
                required_scope,
                operation: &op,
                trace_id: envelope.trace_id.as_deref(),
            },
            now,
        )?;
        self.slo.check(operation, now)?;
        Ok(Admission {
            grant,
            operation,
            started: Instant::now(),
        })
    }

    fn complete(&self, admission: &Admission) {
        self.slo.record(
            admission.operation,
            admission.started.elapsed(),
            MonotonicTimeNs::now(),
        );
    }

    fn emit(
        &self,
        context: Option<&ConsentContext>,
        event_type: AuditEventType,
        operation: &'static str,
        payload: Value,
    ) -> Result<AuditReceipt, GovernanceError> {
        let mut request = EmitRequest::new(event_type, OperationName::new(operation)?, payload);
        if let Some(context) = context {
            request = request.with_consent(context.record().clone());
        }
        Ok(self.ledger.emit(request, MonotonicTimeNs::now())?)
    }

    async fn load_records(&self, filter: RecordFilter) -> Result<Vec<MemoryRecord>, GovernanceError> {
        filter.validate()?;
        let store = self.store.clone();
        bounded(DEP_STORAGE, self.config.storage_timeout_ms, move || {
            Ok(store.recall(&filter)?)
        })
        .await
    }

    async fn open_records(
        &self,
        records: Vec<MemoryRecord>,
    ) -> Result<Vec<RecalledMemory>, GovernanceError> {
        let envelope = self.envelope.clone();
        bounded(DEP_KEY_ACCESS, self.config.key_access_timeout_ms, move || {
            records
                .into_iter()
                .map(|record| -> Result<RecalledMemory, GovernanceError> {
                    let plaintext = envelope.decrypt(&record.envelope)?;
                    let content = std::str::from_utf8(plaintext.as_slice())
                        .map_err(|_| {
                            GovernanceError::internal(InternalFailure::Encryption {
                                detail: format!("record {} content is not utf-8", record.record_id),
                            })
                        })?
                        .to_string();
                    Ok(RecalledMemory {
                        record_id: record.record_id,
                        tier: record.tier,
                        kind: record.kind,
                        content,
                        attributes: record.attributes,
                        created_at: record.created_at,
                    })
                })
                .collect()
        })
        .await
    }

    pub async fn store(
        &self,
        envelope: &RequestEnvelope,
        request: StoreRequest,
    ) -> Result<StoreResponse, GovernanceError> {
        self.store_body(envelope, Ok(request)).await
    }

    pub async fn store_body(
        &self,
        envelope: &RequestEnvelope,
        body: DecodedBody<StoreRequest>,
    ) -> Result<StoreResponse, GovernanceError> {
        let admission = self.admit(OP_STORE, envelope, store_scope(&envelope.tier))?;
        let outcome = match body {
            Ok(request) => self.handle_store(&admission.grant.context, request).await,
            Err(err) => Err(err),
        };
        self.complete(&admission);
        outcome
    }

    async fn handle_store(
        &self,
        context: &ConsentContext,
        request: StoreRequest,
    ) -> Result<StoreResponse, GovernanceError> {
        request.validate()?;
        let StoreRequest {
            kind,
            content,
            attributes,
        } = request;
        let content = Zeroizing::new(content);
        let envelope_service = self.envelope.clone();
        let sealed = bounded(DEP_KEY_ACCESS, self.config.key_access_timeout_ms, move || {
            Ok(envelope_service.encrypt(content.as_bytes())?)
        })
        .await?;

        let record = MemoryRecord {
            record_id: RecordId::new(format!("mem_{}", uuid::Uuid::new_v4().simple()))?,
            subject: context.subject().clone(),
            tier: context.disclosure_tier(),
            kind,
            envelope: sealed,
            attributes,
            created_at: MonotonicTimeNs::now(),
        };
        let payload = json!({
            "record_id": record.record_id.as_str(),
            "kind": record.kind.as_str(),
            "tier": record.tier.as_str(),
            "master_key_id": record.envelope.master_key_id,
            "attribute_keys": record.attributes.keys().collect::<Vec<_>>(),
            "reason_code": reason_codes::MNEMO_OS_OK_STORED.to_string(),
        });
        let record_id = self.write_record(record).await?;

        match self.emit(Some(context), AuditEventType::MemoryStored, OP_STORE, payload) {
            Ok(receipt) => Ok(StoreResponse { record_id, receipt }),
            Err(err) => {
                // An unaudited write must not survive.
                tracing::error!(
                    target: "mnemo.audit",
                    record_id = record_id.as_str(),
                    reason_code = %reason_codes::MNEMO_OS_AUDIT_AFTER_WRITE_FAILED,
                    "store could not be audited; removing record"
                );
                self.remove_unaudited(record_id).await?;
                Err(err)
            }
        }
    }

    /// Writes one record under the storage deadline. If the deadline fires
    /// first, whichever side finishes second removes the record: the blocking
    /// task when it sees the request abandoned, or this call when the write
    /// committed between the deadline and the abandon flag.
    async fn write_record(&self, record: MemoryRecord) -> Result<RecordId, GovernanceError> {
        let record_id = record.record_id.clone();
        let state = Arc::new(AtomicU8::new(WRITE_PENDING));
        let task_state = state.clone();
        let store = self.store.clone();
        let outcome = bounded(DEP_STORAGE, self.config.storage_timeout_ms, move || {
            let id = store.store(record)?;
            if task_state
                .compare_exchange(
                    WRITE_PENDING,
                    WRITE_COMMITTED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                match store.delete(&single_record(id.clone())) {
                    Ok(_) => tracing::warn!(
                        target: "mnemo.audit",
                        record_id = id.as_str(),
                        reason_code = %reason_codes::MNEMO_OS_LATE_WRITE_REMOVED,
                        "write finished after its request timed out; record removed"
                    ),
                    Err(_) => tracing::error!(
                        target: "mnemo.audit",
                        record_id = id.as_str(),
                        reason_code = %reason_codes::MNEMO_OS_UNAUDITED_WRITE_KEPT,
                        "late write could not be removed; record is unaudited"
                    ),
                }
            }
            Ok(id)
        })
        .await;

        match outcome {
            Err(GovernanceError::InternalError {
                failure: failure @ InternalFailure::DependencyTimeout { .. },
            }) => {
                if state
                    .compare_exchange(
                        WRITE_PENDING,
                        WRITE_ABANDONED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    self.remove_unaudited(record_id).await?;
                }
                Err(GovernanceError::internal(failure))
            }
            other => other,
        }
    }

    /// Deletes a record that has no audit event. A failed delete is reported
    /// as `UnauditedWrite` so the caller can tell it from the original error.
    async fn remove_unaudited(&self, record_id: RecordId) -> Result<(), GovernanceError> {
        let store = self.store.clone();
        let filter = single_record(record_id.clone());
        match bounded(DEP_STORAGE, self.config.storage_timeout_ms, move || {
            Ok(store.delete(&filter)?)
        })
        .await
        {
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::error!(
                    target: "mnemo.audit",
                    record_id = record_id.as_str(),
                    error = %err.public_code().as_str(),
                    reason_code = %reason_codes::MNEMO_OS_UNAUDITED_WRITE_KEPT,
                    "unaudited record could not be removed"
                );
                Err(GovernanceError::internal(InternalFailure::UnauditedWrite {
                    record_id: record_id.to_string(),
                }))
            }
        }
    }

    pub async fn recall(
        &self,
        envelope: &RequestEnvelope,
        request: FilterRequest,
    ) -> Result<RecallResponse, GovernanceError> {
        self.recall_body(envelope, Ok(request)).await
    }

    pub async fn recall_body(
        &self,
        envelope: &RequestEnvelope,
        body: DecodedBody<FilterRequest>,
    ) -> Result<RecallResponse, GovernanceError> {
        let admission = self.admit(OP_RECALL, envelope, ConsentScope::MemoryRead)?;
        let outcome = match body {
            Ok(request) => self.handle_recall(&admission.grant, request).await,
            Err(err) => Err(err),
        };
        self.complete(&admission);
        outcome
    }

    async fn handle_recall(
        &self,
        grant: &ConsentGrant,
        request: FilterRequest,
    ) -> Result<RecallResponse, GovernanceError> {
        let records = self
            .load_records(own_records_filter(&grant.context, request.filter))
            .await?;
        let memories = self.open_records(records).await?;
        Ok(RecallResponse {
            memories,
            receipt: grant.receipt.clone(),
        })
    }

    pub async fn forget(
        &self,
        envelope: &RequestEnvelope,
        request: FilterRequest,
    ) -> Result<ForgetResponse, GovernanceError> {
        self.forget_body(envelope, Ok(request)).await
    }

    pub async fn forget_body(
        &self,
        envelope: &RequestEnvelope,
        body: DecodedBody<FilterRequest>,
    ) -> Result<ForgetResponse, GovernanceError> {
        let admission = self.admit(OP_FORGET, envelope, ConsentScope::MemoryForget)?;
        let outcome = match body {
            Ok(request) => self.handle_forget(&admission.grant.context, request).await,
            Err(err) => Err(err),
        };
        self.complete(&admission);
        outcome
    }

    async fn handle_forget(
        &self,
        context: &ConsentContext,
        request: FilterRequest,
    ) -> Result<ForgetResponse, GovernanceError> {
        let filter = own_records_filter(context, request.filter);
        filter.validate()?;
        let store = self.store.clone();
        let deleted_ids = bounded(DEP_STORAGE, self.config.storage_timeout_ms, move || {
            Ok(store.delete(&filter)?)
        })
        .await?;
        let payload = json!({
            "deleted_ids": deleted_ids.iter().map(RecordId::as_str).collect::<Vec<_>>(),
            "deleted_count": deleted_ids.len(),
            "reason_code": reason_codes::MNEMO_OS_OK_FORGOTTEN.to_string(),
        });
        let receipt = self
            .emit(Some(context), AuditEventType::MemoryForgotten, OP_FORGET, payload)
            .map_err(|err| {
                tracing::error!(
                    target: "mnemo.audit",
                    deleted = deleted_ids.len(),
                    reason_code = %reason_codes::MNEMO_OS_AUDIT_AFTER_WRITE_FAILED,
                    "forget completed but could not be audited"
                );
                err
            })?;
        Ok(ForgetResponse {
            deleted_ids,
            receipt,
        })
    }

    pub async fn export(&self, envelope: &RequestEnvelope) -> Result<ExportResponse, GovernanceError> {
        let admission = self.admit(OP_EXPORT, envelope, ConsentScope::MemoryExport)?;
        let outcome = self.handle_export(&admission.grant.context).await;
        self.complete(&admission);
        outcome
    }

    async fn handle_export(&self, context: &ConsentContext) -> Result<ExportResponse, GovernanceError> {
        let records = self
            .load_records(own_records_filter(context, RecordFilter::default()))
            .await?;
        let memories = self.open_records(records).await?;
        let payload = json!({
            "record_count": memories.len(),
            "record_ids": memories.iter().map(|m| m.record_id.as_str()).collect::<Vec<_>>(),
            "reason_code": reason_codes::MNEMO_OS_OK_EXPORTED.to_string(),
        });
        let receipt = self.emit(Some(context), AuditEventType::MemoryExported, OP_EXPORT, payload)?;
        Ok(ExportResponse { memories, receipt })
    }

    pub async fn distill(
        &self,
        envelope: &RequestEnvelope,
        request: DistillRequest,
    ) -> Result<DistillResponse, GovernanceError> {
        self.distill_body(envelope, Ok(request)).await
    }

    pub async fn distill_body(
        &self,
        envelope: &RequestEnvelope,
        body: DecodedBody<DistillRequest>,
    ) -> Result<DistillResponse, GovernanceError> {
        let admission = self.admit(OP_DISTILL, envelope, ConsentScope::AggregateRead)?;
        let outcome = match body {
            Ok(request) => self.handle_distill(&admission.grant.context, request).await,
            Err(err) => Err(err),
        };
        self.complete(&admission);
        outcome
    }

    async fn handle_distill(
        &self,
        context: &ConsentContext,
        request: DistillRequest,
    ) -> Result<DistillResponse, GovernanceError> {
        request.validate()?;
        let tier = context.disclosure_tier();
        let mut filter = request.filter.clone();
        filter.tier = Some(tier);
        let records = self.load_records(filter).await?;
        let required = self.aggregator.effective_threshold(request.min_records);
        let spec = &request.aggregation;

        match self
            .aggregator
            .distill(context, tier, spec, &records, request.min_records)
        {
            Ok(result) => {
                let payload = json!({
                    "type": spec.kind.as_str(),
                    "field": spec.field,
                    "tier": tier.as_str(),
                    "record_count": result.record_count,
                    "threshold": required,
                    "reason_code": mnemo_engines::aggregator::reason_codes::MNEMO_AGG_OK_DISCLOSED.to_string(),
                });
                let receipt =
                    self.emit(Some(context), AuditEventType::AggregationDisclosed, OP_DISTILL, payload)?;
                Ok(DistillResponse { result, receipt })
            }
            Err(refusal) => {
                self.telemetry.record_aggregation_refusal();
                // The observed count is never recorded for a refusal.
                let payload = json!({
                    "type": spec.kind.as_str(),
                    "field": spec.field,
                    "tier": tier.as_str(),
                    "threshold": required,
                    "reason_code": refusal.reason_code().to_string(),
                });
                if let Err(err) =
                    self.emit(Some(context), AuditEventType::AggregationRefused, OP_DISTILL, payload)
                {
                    tracing::error!(
                        target: "mnemo.audit",
                        error = %err.public_code().as_str(),
                        "aggregation refusal could not be audited"
                    );
                }
                tracing::warn!(
                    target: "mnemo.audit",
                    trace_id = context.trace_id().as_str(),
                    tier = tier.as_str(),
                    threshold = required,
                    reason_code = %refusal.reason_code(),
                    "aggregation refused"
                );
                Err(refusal.into())
            }
        }
    }

    /// Admin gate shared by key rotation, ledger export and chain verification.
    pub fn require_admin(&self, bearer: Option<&str>) -> Result<(), GovernanceError> {
        let Some(presented) = bearer.map(str::trim).filter(|b| !b.is_empty()) else {
            return Err(GovernanceError::unauthorized("missing admin credential"));
        };
        match self.config.admin_token_sha256.as_ref() {
            Some(digest) if admin_token_matches(digest, Some(presented)) => Ok(()),
            _ => {
                tracing::warn!(
                    target: "mnemo.keys",
                    reason_code = %reason_codes::MNEMO_OS_ADMIN_DENIED,
                    "admin request refused"
                );
                Err(GovernanceError::forbidden(ForbiddenReason::AdminRequired))
            }
        }
    }

    /// The rotation event is signed by the freshly activated key.
    pub async fn rotate_signing_key(
        &self,
        bearer: Option<&str>,
        request: RotateSigningKeyRequest,
    ) -> Result<KeyRotationResponse, GovernanceError> {
        self.require_admin(bearer)?;
        let retired_key_id = self.signer.active_key_id();
        let signer = self.signer.clone();
        let key_id = bounded(DEP_KEY_ACCESS, self.config.key_access_timeout_ms, move || {
            Ok(signer.rotate(request.key_id.as_deref(), MonotonicTimeNs::now())?)
        })
        .await?;
        self.telemetry.record_key_rotation("signing");
        let receipt = self.emit(
            None,
            AuditEventType::SigningKeyRotated,
            OP_ROTATE_SIGNING_KEY,
            json!({
                "key_id": key_id,
                "retired_key_id": retired_key_id,
                "published_keys": self.signer.key_count(),
                "reason_code": reason_codes::MNEMO_OS_OK_KEY_ROTATED.to_string(),
            }),
        )?;
        Ok(KeyRotationResponse {
            key_id,
            retired_key_id,
            receipt,
        })
    }

    pub async fn rotate_master_key(
        &self,
        bearer: Option<&str>,
        request: RotateMasterKeyRequest,
    ) -> Result<KeyRotationResponse, GovernanceError> {
        self.require_admin(bearer)?;
        let retired_key_id = self.envelope.active_master_key_id();
        let envelope = self.envelope.clone();
        let record = bounded(DEP_KEY_ACCESS, self.config.key_access_timeout_ms, move || {
            Ok(envelope.rotate_master_key(&request.master_key_id, MonotonicTimeNs::now())?)
        })
        .await?;
        self.telemetry.record_key_rotation("master");
        let receipt = self.emit(
            None,
            AuditEventType::MasterKeyRotated,
            OP_ROTATE_MASTER_KEY,
            json!({
                "master_key_id": record.master_key_id,
                "retired_master_key_id": retired_key_id,
                "retained_master_keys": self.envelope.master_keys().len(),
                "reason_code": reason_codes::MNEMO_OS_OK_KEY_ROTATED.to_string(),
            }),
        )?;
        Ok(KeyRotationResponse {
            key_id: record.master_key_id,
            retired_key_id: Some(retired_key_id),
            receipt,
        })
    }

    pub fn public_key_set(&self) -> PublicKeySet {
        self.signer.public_key_set()
    }

    pub fn jwks(&self) -> JwkSet {
        self.public_key_set().to_jwks()
    }

    pub fn ledger_head(&self) -> LedgerHead {
        self.ledger.head()
    }

    pub fn ledger_height(&self) -> u64 {
        self.ledger.ledger_height()
    }

    pub fn verify_ledger(&self) -> ChainVerification {
        self.ledger.verify_chain_integrity()
    }

    /// Admin-only full-chain check. Calls against an unchanged head reuse the
    /// last verdict instead of rehashing every event.
    pub fn verify_ledger_as_admin(
        &self,
        bearer: Option<&str>,
    ) -> Result<ChainVerification, GovernanceError> {
        self.require_admin(bearer)?;
        let head = self.ledger.head();
        let mut cached = self.last_verification.lock();
        if let Some((verified_head, verification)) = cached.as_ref() {
            if *verified_head == head {
                return Ok(verification.clone());
            }
        }
        let verification = self.ledger.verify_chain_integrity();
        *cached = Some((head, verification.clone()));
        Ok(verification)
    }

    /// Full export carries pseudonyms and payloads, so it is admin-only.
    pub fn export_ledger(&self, bearer: Option<&str>) -> Result<LedgerExport, GovernanceError> {
        self.require_admin(bearer)?;
        Ok(self.ledger.export())
    }

    pub fn receipt(&self, event_id: &str) -> Result<AuditReceipt, GovernanceError> {
        Ok(self.ledger.receipt_for(event_id)?)
    }

    /// Verifies a caller-held receipt against the published keys only.
    pub fn verify_receipt(&self, receipt: &AuditReceipt) -> Result<(), GovernanceError> {
        verify_receipt(receipt, &self.public_key_set()).map_err(|err| {
            self.telemetry.record_receipt_verification_failure();
            tracing::warn!(
                target: "mnemo.audit",
                event_id = receipt.event_id.as_str(),
                reason_code = %reason_codes::MNEMO_OS_RECEIPT_REJECTED,
                "receipt verification failed"
            );
            GovernanceError::validation(err.to_string())
        })
    }

    pub fn breaker(&self, operation: &str) -> BreakerSnapshot {
        self.slo.snapshot(operation, MonotonicTimeNs::now())
    }

    pub fn metrics(&self) -> String {
        self.telemetry.render()
    }

    pub fn master_key_ids(&self) -> Vec<String> {
        self.envelope
            .master_keys()
            .into_iter()
            .map(|k| k.master_key_id)
            .collect()
    }
}

/// Surfaces the first broken link as an internal chain-integrity failure.
pub fn chain_integrity_error(verification: &ChainVerification) -> Option<GovernanceError> {
    if verification.valid {
        return None;
    }
    let index = verification.failure_index.unwrap_or(0);
    tracing::error!(
        target: "mnemo.audit",
        index,
        reason = verification.failure_reason.map(ChainFailureReason::as_str),
        "audit chain integrity failure"
    );
    Some(GovernanceError::internal(InternalFailure::ChainIntegrity { index }))
}
