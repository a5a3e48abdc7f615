#![forbid(unsafe_code)]

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::common::{b64, validate_token};
use crate::{ContractViolation, MonotonicTimeNs, Validate};

pub const ED25519_PUBLIC_KEY_LEN: usize = 32;
pub const KEY_ID_MAX_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    Ed25519,
}

impl KeyAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ed25519 => "Ed25519",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Retired,
}

pub fn validate_key_id(field: &'static str, key_id: &str) -> Result<(), ContractViolation> {
    validate_token(field, key_id, KEY_ID_MAX_LEN)?;
    if !key_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must contain only [A-Za-z0-9-_.]",
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyEntry {
    pub key_id: String,
    pub algorithm: KeyAlgorithm,
    #[serde(with = "b64")]
    pub public_key_bytes: Vec<u8>,
    pub status: KeyStatus,
    pub created_at: MonotonicTimeNs,
    pub retired_at: Option<MonotonicTimeNs>,
}

impl Validate for PublicKeyEntry {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_key_id("public_key.key_id", &self.key_id)?;
        if self.public_key_bytes.len() != ED25519_PUBLIC_KEY_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "public_key.public_key_bytes",
                reason: "ed25519 public key must be 32 bytes",
            });
        }
        match (self.status, self.retired_at) {
            (KeyStatus::Active, Some(_)) => Err(ContractViolation::InvalidValue {
                field: "public_key.retired_at",
                reason: "active key must not carry retired_at",
            }),
            (KeyStatus::Retired, None) => Err(ContractViolation::InvalidValue {
                field: "public_key.retired_at",
                reason: "retired key must carry retired_at",
            }),
            _ => Ok(()),
        }
    }
}

/// Active key first, then retired keys newest to oldest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PublicKeySet {
    pub keys: Vec<PublicKeyEntry>,
}

impl PublicKeySet {
    pub fn find(&self, key_id: &str) -> Option<&PublicKeyEntry> {
        self.keys.iter().find(|k| k.key_id == key_id)
    }

    pub fn active(&self) -> Option<&PublicKeyEntry> {
        self.keys.iter().find(|k| k.status == KeyStatus::Active)
    }

    pub fn to_jwks(&self) -> JwkSet {
        JwkSet {
            keys: self
                .keys
                .iter()
                .map(|k| Jwk {
                    kty: "OKP".to_string(),
                    crv: "Ed25519".to_string(),
                    alg: "EdDSA".to_string(),
                    key_use: "sig".to_string(),
                    kid: k.key_id.clone(),
                    x: URL_SAFE_NO_PAD.encode(&k.public_key_bytes),
                    status: k.status,
                    created_at: k.created_at,
                    retired_at: k.retired_at,
                })
                .collect(),
        }
    }

    pub fn from_jwks(jwks: &JwkSet) -> Result<Self, ContractViolation> {
        let mut keys = Vec::with_capacity(jwks.keys.len());
        for jwk in &jwks.keys {
            if jwk.kty != "OKP" || jwk.crv != "Ed25519" {
                return Err(ContractViolation::InvalidValue {
                    field: "jwk.kty",
                    reason: "only OKP/Ed25519 keys are accepted",
                });
            }
            let public_key_bytes =
                URL_SAFE_NO_PAD
                    .decode(jwk.x.as_bytes())
                    .map_err(|_| ContractViolation::InvalidValue {
                        field: "jwk.x",
                        reason: "must be unpadded base64url",
                    })?;
            let entry = PublicKeyEntry {
                key_id: jwk.kid.clone(),
                algorithm: KeyAlgorithm::Ed25519,
                public_key_bytes,
                status: jwk.status,
                created_at: jwk.created_at,
                retired_at: jwk.retired_at,
            };
            entry.validate()?;
            keys.push(entry);
        }
        let set = Self { keys };
        set.validate()?;
        Ok(set)
    }
}

impl Validate for PublicKeySet {
    fn validate(&self) -> Result<(), ContractViolation> {
        let active = self
            .keys
            .iter()
            .filter(|k| k.status == KeyStatus::Active)
            .count();
        if active > 1 {
            return Err(ContractViolation::InvalidValue {
                field: "public_key_set",
                reason: "at most one key may be active",
            });
        }
        for (i, key) in self.keys.iter().enumerate() {
            key.validate()?;
            if self.keys[..i].iter().any(|k| k.key_id == key.key_id) {
                return Err(ContractViolation::InvalidValue {
                    field: "public_key_set",
                    reason: "key ids must be unique",
                });
            }
        }
        Ok(())
    }
}

/// RFC 8037 OKP JSON Web Key, extended with lifecycle fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub alg: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub kid: String,
    pub x: String,
    pub status: KeyStatus,
    pub created_at: MonotonicTimeNs,
    pub retired_at: Option<MonotonicTimeNs>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}
