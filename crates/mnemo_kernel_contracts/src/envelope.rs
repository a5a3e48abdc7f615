#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::b64;
use crate::keys::validate_key_id;
use crate::{ContractViolation, Validate};

pub const ENCRYPTION_VERSION_V1: u16 = 1;
pub const IV_LEN: usize = 12;
pub const AUTH_TAG_LEN: usize = 16;
pub const DATA_KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedEnvelope {
    #[serde(with = "b64")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "b64")]
    pub auth_tag: Vec<u8>,
    #[serde(with = "b64")]
    pub iv: Vec<u8>,
    #[serde(with = "b64")]
    pub wrapped_data_key: Vec<u8>,
    pub master_key_id: String,
    pub encryption_version: u16,
}

impl Validate for EncryptedEnvelope {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.encryption_version != ENCRYPTION_VERSION_V1 {
            return Err(ContractViolation::InvalidValue {
                field: "envelope.encryption_version",
                reason: "unsupported encryption version",
            });
        }
        if self.iv.len() != IV_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "envelope.iv",
                reason: "must be 12 bytes",
            });
        }
        if self.auth_tag.len() != AUTH_TAG_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "envelope.auth_tag",
                reason: "must be 16 bytes",
            });
        }
        if self.wrapped_data_key.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "envelope.wrapped_data_key",
                reason: "must not be empty",
            });
        }
        validate_key_id("envelope.master_key_id", &self.master_key_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_bytes_as_base64() {
        let env = EncryptedEnvelope {
            ciphertext: vec![1, 2, 3],
            auth_tag: vec![0; AUTH_TAG_LEN],
            iv: vec![9; IV_LEN],
            wrapped_data_key: vec![4; 60],
            master_key_id: "mk-1".to_string(),
            encryption_version: ENCRYPTION_VERSION_V1,
        };
        env.validate().unwrap();
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["ciphertext"], "AQID");
        let back: EncryptedEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn short_iv_is_rejected() {
        let env = EncryptedEnvelope {
            ciphertext: vec![],
            auth_tag: vec![0; AUTH_TAG_LEN],
            iv: vec![9; 8],
            wrapped_data_key: vec![4; 60],
            master_key_id: "mk-1".to_string(),
            encryption_version: ENCRYPTION_VERSION_V1,
        };
        assert!(env.validate().is_err());
    }
}
