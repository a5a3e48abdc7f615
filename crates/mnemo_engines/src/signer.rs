#![forbid(unsafe_code)]

use std::sync::Arc;

use ed25519_dalek::{Signature, VerifyingKey};
use mnemo_kernel_contracts::keys::{
    validate_key_id, KeyAlgorithm, KeyStatus, PublicKeyEntry, PublicKeySet,
};
use mnemo_kernel_contracts::{
    ContractViolation, GovernanceError, InternalFailure, MonotonicTimeNs,
};
use parking_lot::RwLock;

use crate::canonical::{sha256, CanonicalBytes};
use crate::kms::{KeyManagementProvider, KmsError, PrivateKeyHandle};

pub mod reason_codes {
    use mnemo_kernel_contracts::ReasonCodeId;

    pub const MNEMO_KEYS_OK_SIGNING_ROTATED: ReasonCodeId = ReasonCodeId(0x4B45_0001);
    pub const MNEMO_KEYS_DUPLICATE_KEY_ID: ReasonCodeId = ReasonCodeId(0x4B45_00F1);
    pub const MNEMO_KEYS_KMS_FAILURE: ReasonCodeId = ReasonCodeId(0x4B45_00F2);
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SignerError {
    #[error("key management failure: {0}")]
    Kms(#[from] KmsError),
    #[error("signing key id {0} already exists")]
    DuplicateKeyId(String),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error("no active signing key")]
    NoActiveKey,
}

impl From<SignerError> for GovernanceError {
    fn from(err: SignerError) -> Self {
        match err {
            SignerError::DuplicateKeyId(key_id) => GovernanceError::Conflict {
                reason: format!("signing key id {key_id} already exists"),
            },
            SignerError::Contract(v) => v.into(),
            other => GovernanceError::internal(InternalFailure::Signing {
                detail: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachedSignature {
    pub key_id: String,
    pub signature_hex: String,
}

/// Signing seam used by the ledger. Implementations must sign with exactly one
/// active key and keep every retired public key available for verification.
pub trait Signer: Send + Sync {
    fn sign(&self, payload: &CanonicalBytes) -> Result<DetachedSignature, SignerError>;
    fn public_key_set(&self) -> PublicKeySet;
    fn active_key_id(&self) -> Option<String>;
}

#[derive(Debug, Clone)]
struct SigningKeyRecord {
    key_id: String,
    public_key: [u8; 32],
    private_handle: PrivateKeyHandle,
    created_at: MonotonicTimeNs,
    retired_at: Option<MonotonicTimeNs>,
}

impl SigningKeyRecord {
    fn to_public_entry(&self) -> PublicKeyEntry {
        PublicKeyEntry {
            key_id: self.key_id.clone(),
            algorithm: KeyAlgorithm::Ed25519,
            public_key_bytes: self.public_key.to_vec(),
            status: if self.retired_at.is_some() {
                KeyStatus::Retired
            } else {
                KeyStatus::Active
            },
            created_at: self.created_at,
            retired_at: self.retired_at,
        }
    }
}

/// Oldest first. The last record is the only one without `retired_at`.
#[derive(Debug, Default)]
struct RegistryState {
    keys: Vec<SigningKeyRecord>,
}

impl RegistryState {
    fn active(&self) -> Option<&SigningKeyRecord> {
        self.keys.iter().rev().find(|k| k.retired_at.is_none())
    }
}

#[derive(Debug)]
pub struct Ed25519KeyRegistry {
    kms: Arc<dyn KeyManagementProvider>,
    state: RwLock<RegistryState>,
}

/// `sig-` plus the first 16 hex chars of SHA-256 over the public key.
pub fn derive_key_id(public_key: &[u8; 32]) -> String {
    let digest = hex::encode(sha256(public_key));
    format!("sig-{}", &digest[..16])
}

impl Ed25519KeyRegistry {
    pub fn new(
        kms: Arc<dyn KeyManagementProvider>,
        now: MonotonicTimeNs,
    ) -> Result<Self, SignerError> {
        let registry = Self {
            kms,
            state: RwLock::new(RegistryState::default()),
        };
        registry.rotate(None, now)?;
        Ok(registry)
    }

    /// Retires the active key and activates a fresh one. Keys are never removed.
    /// Signers holding the read lock finish under the old key first.
    pub fn rotate(
        &self,
        new_key_id: Option<&str>,
        now: MonotonicTimeNs,
    ) -> Result<String, SignerError> {
        if let Some(requested) = new_key_id {
            validate_key_id("signing_key.key_id", requested)?;
        }
        let pair = self.kms.generate_key_pair()?;
        let key_id = new_key_id
            .map(str::to_string)
            .unwrap_or_else(|| derive_key_id(&pair.public_key));

        let mut state = self.state.write();
        if state.keys.iter().any(|k| k.key_id == key_id) {
            tracing::warn!(
                target: "mnemo.keys",
                key_id = %key_id,
                reason_code = %reason_codes::MNEMO_KEYS_DUPLICATE_KEY_ID,
                "signing key rotation refused"
            );
            return Err(SignerError::DuplicateKeyId(key_id));
        }
        let previous = state.keys.iter_mut().rev().find(|k| k.retired_at.is_none());
        let retired_key_id = previous.map(|k| {
            k.retired_at = Some(now);
            k.key_id.clone()
        });
        state.keys.push(SigningKeyRecord {
            key_id: key_id.clone(),
            public_key: pair.public_key,
            private_handle: pair.private_handle,
            created_at: now,
            retired_at: None,
        });
        tracing::info!(
            target: "mnemo.keys",
            key_id = %key_id,
            retired_key_id = retired_key_id.as_deref().unwrap_or("none"),
            reason_code = %reason_codes::MNEMO_KEYS_OK_SIGNING_ROTATED,
            "signing key activated"
        );
        Ok(key_id)
    }

    pub fn key_count(&self) -> usize {
        self.state.read().keys.len()
    }
}

impl Signer for Ed25519KeyRegistry {
    fn sign(&self, payload: &CanonicalBytes) -> Result<DetachedSignature, SignerError> {
        let state = self.state.read();
        let active = state.active().ok_or(SignerError::NoActiveKey)?;
        let signature = self
            .kms
            .sign(&active.private_handle, payload.as_bytes())
            .map_err(|err| {
                tracing::error!(
                    target: "mnemo.keys",
                    key_id = %active.key_id,
                    reason_code = %reason_codes::MNEMO_KEYS_KMS_FAILURE,
                    "kms signing failed"
                );
                SignerError::Kms(err)
            })?;
        Ok(DetachedSignature {
            key_id: active.key_id.clone(),
            signature_hex: hex::encode(signature),
        })
    }

    fn public_key_set(&self) -> PublicKeySet {
        let state = self.state.read();
        let mut keys: Vec<PublicKeyEntry> = state
            .keys
            .iter()
            .rev()
            .map(SigningKeyRecord::to_public_entry)
            .collect();
        keys.sort_by_key(|k| k.status != KeyStatus::Active);
        PublicKeySet { keys }
    }

    fn active_key_id(&self) -> Option<String> {
        self.state.read().active().map(|k| k.key_id.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureCheckError {
    #[error("key id not present in the published key set")]
    UnknownKeyId,
    #[error("published key is malformed")]
    MalformedKey,
    #[error("signature encoding is malformed")]
    MalformedSignature,
    #[error("signature does not verify")]
    Invalid,
}

/// Verifies a detached hex signature using only published keys. Retired keys
/// still verify what they signed while active.
pub fn verify_detached(
    keys: &PublicKeySet,
    key_id: &str,
    payload: &CanonicalBytes,
    signature_hex: &str,
) -> Result<(), SignatureCheckError> {
    let entry = keys.find(key_id).ok_or(SignatureCheckError::UnknownKeyId)?;
    let key_bytes: [u8; 32] = entry
        .public_key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| SignatureCheckError::MalformedKey)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| SignatureCheckError::MalformedKey)?;
    let raw = hex::decode(signature_hex).map_err(|_| SignatureCheckError::MalformedSignature)?;
    let signature =
        Signature::from_slice(&raw).map_err(|_| SignatureCheckError::MalformedSignature)?;
    verifying_key
        .verify_strict(payload.as_bytes(), &signature)
        .map_err(|_| SignatureCheckError::Invalid)
}
