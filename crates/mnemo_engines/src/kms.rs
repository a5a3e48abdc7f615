#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use ed25519_dalek::{Signer as _, SigningKey};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

pub const MASTER_KEY_LEN: usize = 32;
const WRAP_NONCE_LEN: usize = 12;
const WRAP_AAD_PREFIX: &[u8] = b"mnemo:wrap:v1:";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KmsError {
    #[error("unknown private key handle")]
    UnknownHandle,
    #[error("unknown master key id: {0}")]
    UnknownMasterKey(String),
    #[error("master key id already exists: {0}")]
    DuplicateMasterKey(String),
    #[error("kms cryptographic operation failed")]
    Crypto,
    #[error("unsupported kms provider: {0}; expected in_process")]
    UnsupportedProvider(String),
}

/// Opaque reference to private key material held by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrivateKeyHandle(String);

impl PrivateKeyHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedKeyPair {
    pub public_key: [u8; 32],
    pub private_handle: PrivateKeyHandle,
}

/// Everything the core needs from key custody. Private signing keys and master
/// keys never leave the provider; callers hold handles and key ids.
pub trait KeyManagementProvider: Send + Sync + std::fmt::Debug {
    fn provider_name(&self) -> &'static str;
    fn generate_key_pair(&self) -> Result<GeneratedKeyPair, KmsError>;
    fn sign(&self, handle: &PrivateKeyHandle, message: &[u8]) -> Result<[u8; 64], KmsError>;
    fn create_master_key(&self, master_key_id: &str) -> Result<(), KmsError>;
    fn wrap_key(&self, material: &[u8], master_key_id: &str) -> Result<Vec<u8>, KmsError>;
    fn unwrap_key(
        &self,
        wrapped: &[u8],
        master_key_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, KmsError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmsProviderKind {
    InProcess,
}

impl KmsProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProcess => "in_process",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, KmsError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "in_process" | "inprocess" | "software" => Ok(Self::InProcess),
            other => Err(KmsError::UnsupportedProvider(other.to_string())),
        }
    }

    pub fn build(self) -> Arc<dyn KeyManagementProvider> {
        match self {
            Self::InProcess => Arc::new(InProcessKms::new()),
        }
    }
}

#[derive(Default)]
pub struct InProcessKms {
    signing_keys: RwLock<HashMap<PrivateKeyHandle, SigningKey>>,
    master_keys: RwLock<HashMap<String, Zeroizing<[u8; MASTER_KEY_LEN]>>>,
}

impl std::fmt::Debug for InProcessKms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessKms")
            .field("signing_keys", &self.signing_keys.read().len())
            .field("master_keys", &self.master_keys.read().len())
            .finish()
    }
}

impl InProcessKms {
    pub fn new() -> Self {
        Self::default()
    }

    fn wrap_cipher(&self, master_key_id: &str) -> Result<Aes256Gcm, KmsError> {
        let keys = self.master_keys.read();
        let key = keys
            .get(master_key_id)
            .ok_or_else(|| KmsError::UnknownMasterKey(master_key_id.to_string()))?;
        Aes256Gcm::new_from_slice(key.as_ref()).map_err(|_| KmsError::Crypto)
    }
}

fn wrap_aad(master_key_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(WRAP_AAD_PREFIX.len() + master_key_id.len());
    aad.extend_from_slice(WRAP_AAD_PREFIX);
    aad.extend_from_slice(master_key_id.as_bytes());
    aad
}

impl KeyManagementProvider for InProcessKms {
    fn provider_name(&self) -> &'static str {
        "in_process"
    }

    fn generate_key_pair(&self) -> Result<GeneratedKeyPair, KmsError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key().to_bytes();
        let handle = PrivateKeyHandle(format!("inproc-sk-{}", uuid::Uuid::new_v4()));
        self.signing_keys.write().insert(handle.clone(), signing_key);
        Ok(GeneratedKeyPair {
            public_key,
            private_handle: handle,
        })
    }

    fn sign(&self, handle: &PrivateKeyHandle, message: &[u8]) -> Result<[u8; 64], KmsError> {
        let keys = self.signing_keys.read();
        let key = keys.get(handle).ok_or(KmsError::UnknownHandle)?;
        Ok(key.sign(message).to_bytes())
    }

    fn create_master_key(&self, master_key_id: &str) -> Result<(), KmsError> {
        let mut keys = self.master_keys.write();
        if keys.contains_key(master_key_id) {
            return Err(KmsError::DuplicateMasterKey(master_key_id.to_string()));
        }
        let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
        OsRng.fill_bytes(key.as_mut());
        keys.insert(master_key_id.to_string(), key);
        Ok(())
    }

    fn wrap_key(&self, material: &[u8], master_key_id: &str) -> Result<Vec<u8>, KmsError> {
        let cipher = self.wrap_cipher(master_key_id)?;
        let mut nonce_bytes = [0u8; WRAP_NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let aad = wrap_aad(master_key_id);
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: material,
                    aad: &aad,
                },
            )
            .map_err(|_| KmsError::Crypto)?;
        let mut out = Vec::with_capacity(WRAP_NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn unwrap_key(
        &self,
        wrapped: &[u8],
        master_key_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, KmsError> {
        let cipher = self.wrap_cipher(master_key_id)?;
        if wrapped.len() <= WRAP_NONCE_LEN {
            return Err(KmsError::Crypto);
        }
        let (nonce_bytes, sealed) = wrapped.split_at(WRAP_NONCE_LEN);
        let aad = wrap_aad(master_key_id);
        let material = cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| KmsError::Crypto)?;
        Ok(Zeroizing::new(material))
    }
}
