#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use mnemo_kernel_contracts::envelope::{
    EncryptedEnvelope, AUTH_TAG_LEN, DATA_KEY_LEN, ENCRYPTION_VERSION_V1, IV_LEN,
};
use mnemo_kernel_contracts::keys::validate_key_id;
use mnemo_kernel_contracts::{
    ContractViolation, GovernanceError, InternalFailure, MonotonicTimeNs, Validate,
};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use zeroize::Zeroizing;

use crate::kms::{KeyManagementProvider, KmsError};

const ENVELOPE_AAD_PREFIX: &[u8] = b"mnemo:envelope:v";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("master key {key_id} not found; restore it before decrypting")]
    MasterKeyNotFound { key_id: String },
    #[error("master key {0} already exists")]
    DuplicateMasterKey(String),
    #[error("key management failure: {0}")]
    Kms(KmsError),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error("envelope authentication failed")]
    Authentication,
}

impl From<KmsError> for EnvelopeError {
    fn from(err: KmsError) -> Self {
        match err {
            KmsError::UnknownMasterKey(key_id) => Self::MasterKeyNotFound { key_id },
            KmsError::DuplicateMasterKey(key_id) => Self::DuplicateMasterKey(key_id),
            other => Self::Kms(other),
        }
    }
}

impl From<EnvelopeError> for GovernanceError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::MasterKeyNotFound { key_id } => {
                GovernanceError::internal(InternalFailure::MasterKeyNotFound { key_id })
            }
            EnvelopeError::DuplicateMasterKey(key_id) => GovernanceError::Conflict {
                reason: format!("master key {key_id} already exists"),
            },
            EnvelopeError::Contract(v) => v.into(),
            other => GovernanceError::internal(InternalFailure::Encryption {
                detail: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MasterKeyRecord {
    pub master_key_id: String,
    pub created_at: MonotonicTimeNs,
    pub retired_at: Option<MonotonicTimeNs>,
}

#[derive(Debug)]
struct MasterKeyState {
    active: String,
    retained: BTreeMap<String, MasterKeyRecord>,
}

/// Per-record data keys wrapped by a rotatable master key. Master keys are
/// retained forever; the set only grows.
#[derive(Debug)]
pub struct EnvelopeEncryptionService {
    kms: Arc<dyn KeyManagementProvider>,
    state: RwLock<MasterKeyState>,
}

fn envelope_aad(version: u16, master_key_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(ENVELOPE_AAD_PREFIX.len() + 8 + master_key_id.len());
    aad.extend_from_slice(ENVELOPE_AAD_PREFIX);
    aad.extend_from_slice(version.to_string().as_bytes());
    aad.push(b':');
    aad.extend_from_slice(master_key_id.as_bytes());
    aad
}

impl EnvelopeEncryptionService {
    pub fn new(
        kms: Arc<dyn KeyManagementProvider>,
        initial_master_key_id: &str,
        now: MonotonicTimeNs,
    ) -> Result<Self, EnvelopeError> {
        validate_key_id("master_key_id", initial_master_key_id)?;
        kms.create_master_key(initial_master_key_id)?;
        let mut retained = BTreeMap::new();
        retained.insert(
            initial_master_key_id.to_string(),
            MasterKeyRecord {
                master_key_id: initial_master_key_id.to_string(),
                created_at: now,
                retired_at: None,
            },
        );
        Ok(Self {
            kms,
            state: RwLock::new(MasterKeyState {
                active: initial_master_key_id.to_string(),
                retained,
            }),
        })
    }

    pub fn active_master_key_id(&self) -> String {
        self.state.read().active.clone()
    }

    pub fn master_keys(&self) -> Vec<MasterKeyRecord> {
        self.state.read().retained.values().cloned().collect()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedEnvelope, EnvelopeError> {
        let mut data_key = Zeroizing::new([0u8; DATA_KEY_LEN]);
        OsRng.fill_bytes(data_key.as_mut());
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        // Held across the wrap so a concurrent rotation cannot split one envelope
        // between two master keys.
        let state = self.state.read();
        let master_key_id = state.active.clone();
        let wrapped_data_key = self.kms.wrap_key(data_key.as_ref(), &master_key_id)?;
        drop(state);

        let cipher =
            Aes256Gcm::new_from_slice(data_key.as_ref()).map_err(|_| EnvelopeError::Authentication)?;
        let aad = envelope_aad(ENCRYPTION_VERSION_V1, &master_key_id);
        let mut sealed = cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| EnvelopeError::Authentication)?;
        let auth_tag = sealed.split_off(sealed.len() - AUTH_TAG_LEN);
        Ok(EncryptedEnvelope {
            ciphertext: sealed,
            auth_tag,
            iv: iv.to_vec(),
            wrapped_data_key,
            master_key_id,
            encryption_version: ENCRYPTION_VERSION_V1,
        })
    }

    pub fn decrypt(&self, envelope: &EncryptedEnvelope) -> Result<Zeroizing<Vec<u8>>, EnvelopeError> {
        envelope.validate()?;
        if !self
            .state
            .read()
            .retained
            .contains_key(&envelope.master_key_id)
        {
            return Err(EnvelopeError::MasterKeyNotFound {
                key_id: envelope.master_key_id.clone(),
            });
        }
        let data_key = self
            .kms
            .unwrap_key(&envelope.wrapped_data_key, &envelope.master_key_id)?;
        let cipher = Aes256Gcm::new_from_slice(data_key.as_slice())
            .map_err(|_| EnvelopeError::Authentication)?;
        let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + AUTH_TAG_LEN);
        sealed.extend_from_slice(&envelope.ciphertext);
        sealed.extend_from_slice(&envelope.auth_tag);
        let aad = envelope_aad(envelope.encryption_version, &envelope.master_key_id);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&envelope.iv),
                Payload {
                    msg: &sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| EnvelopeError::Authentication)?;
        Ok(Zeroizing::new(plaintext))
    }

    /// Activates `new_key_id`; the previous key stays available for decryption.
    pub fn rotate_master_key(
        &self,
        new_key_id: &str,
        now: MonotonicTimeNs,
    ) -> Result<MasterKeyRecord, EnvelopeError> {
        validate_key_id("master_key_id", new_key_id)?;
        if self.state.read().retained.contains_key(new_key_id) {
            return Err(EnvelopeError::DuplicateMasterKey(new_key_id.to_string()));
        }
        self.kms.create_master_key(new_key_id)?;
        let mut state = self.state.write();
        let previous = state.active.clone();
        if let Some(record) = state.retained.get_mut(&previous) {
            record.retired_at = Some(now);
        }
        let record = MasterKeyRecord {
            master_key_id: new_key_id.to_string(),
            created_at: now,
            retired_at: None,
        };
        state.retained.insert(new_key_id.to_string(), record.clone());
        state.active = new_key_id.to_string();
        tracing::info!(
            target: "mnemo.keys",
            master_key_id = new_key_id,
            retired_master_key_id = %previous,
            retained = state.retained.len(),
            "master key activated"
        );
        Ok(record)
    }
}
