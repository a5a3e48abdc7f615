#![forbid(unsafe_code)]

use std::env;
use std::fs;
use std::path::PathBuf;

use mnemo_engines::aggregator::AggregatorConfig;
use mnemo_engines::canonical::{sha256, Hash32};
use mnemo_engines::consent::{CredentialGrant, Pseudonymizer};
use mnemo_engines::kms::{KmsError, KmsProviderKind};
use mnemo_engines::slo::SloConfig;
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

pub const DEFAULT_HTTP_BIND: &str = "127.0.0.1:8080";
pub const DEFAULT_MASTER_KEY_ID: &str = "mk-1";
pub const MIN_PSEUDONYM_SALT_LEN: usize = 16;

const ENV_HTTP_BIND: &str = "MNEMO_HTTP_BIND";
const ENV_CREDENTIALS_PATH: &str = "MNEMO_CREDENTIALS_PATH";
const ENV_ADMIN_TOKEN: &str = "MNEMO_ADMIN_TOKEN";
const ENV_PSEUDONYM_SALT: &str = "MNEMO_PSEUDONYM_SALT";
const ENV_KMS_PROVIDER: &str = "MNEMO_KMS_PROVIDER";
const ENV_MASTER_KEY_ID: &str = "MNEMO_MASTER_KEY_ID";
const ENV_STORAGE_TIMEOUT_MS: &str = "MNEMO_STORAGE_TIMEOUT_MS";
const ENV_KEY_ACCESS_TIMEOUT_MS: &str = "MNEMO_KEY_ACCESS_TIMEOUT_MS";
const ENV_K_ANONYMITY_FLOOR: &str = "MNEMO_K_ANONYMITY_FLOOR";
const ENV_SLO_WINDOW_MS: &str = "MNEMO_SLO_WINDOW_MS";
const ENV_SLO_MIN_SAMPLES: &str = "MNEMO_SLO_MIN_SAMPLES";
const ENV_SLO_MAX_VIOLATION_RATIO: &str = "MNEMO_SLO_MAX_VIOLATION_RATIO";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Kms(#[from] KmsError),
    #[error("failed to read credentials file '{path}': {detail}")]
    CredentialsRead { path: String, detail: String },
    #[error("failed to parse credentials file '{path}': {detail}")]
    CredentialsParse { path: String, detail: String },
}

#[derive(Clone)]
pub struct GovernanceConfig {
    pub http_bind: String,
    pub credentials_path: Option<PathBuf>,
    /// Only the digest of the admin token is kept.
    pub admin_token_sha256: Option<Hash32>,
    pseudonym_salt: Zeroizing<Vec<u8>>,
    pub kms_provider: KmsProviderKind,
    pub initial_master_key_id: String,
    pub storage_timeout_ms: u64,
    pub key_access_timeout_ms: u64,
    pub aggregator: AggregatorConfig,
    pub slo: SloConfig,
}

impl std::fmt::Debug for GovernanceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceConfig")
            .field("http_bind", &self.http_bind)
            .field("credentials_path", &self.credentials_path)
            .field("admin_token_configured", &self.admin_token_sha256.is_some())
            .field("kms_provider", &self.kms_provider)
            .field("initial_master_key_id", &self.initial_master_key_id)
            .field("storage_timeout_ms", &self.storage_timeout_ms)
            .field("key_access_timeout_ms", &self.key_access_timeout_ms)
            .field("aggregator", &self.aggregator)
            .field("slo", &self.slo)
            .finish_non_exhaustive()
    }
}

fn random_salt() -> Zeroizing<Vec<u8>> {
    let mut salt = Zeroizing::new(vec![0u8; 32]);
    OsRng.fill_bytes(salt.as_mut_slice());
    salt
}

fn parse_in_range<T>(raw: Option<String>, range: std::ops::RangeInclusive<T>) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    raw.and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| range.contains(v))
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl GovernanceConfig {
    /// Defaults with a per-process random pseudonym salt and no admin token.
    pub fn mvp_v1() -> Self {
        Self {
            http_bind: DEFAULT_HTTP_BIND.to_string(),
            credentials_path: None,
            admin_token_sha256: None,
            pseudonym_salt: random_salt(),
            kms_provider: KmsProviderKind::InProcess,
            initial_master_key_id: DEFAULT_MASTER_KEY_ID.to_string(),
            storage_timeout_ms: 2_000,
            key_access_timeout_ms: 2_000,
            aggregator: AggregatorConfig::mvp_v1(),
            slo: SloConfig::mvp_v1(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(|key| env::var(key).ok())
    }

    /// Out-of-range numeric values fall back to defaults. An unknown KMS
    /// provider is refused.
    pub fn from_env_map<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::mvp_v1();
        if let Some(bind) = non_empty(lookup(ENV_HTTP_BIND)) {
            config.http_bind = bind;
        }
        config.credentials_path = non_empty(lookup(ENV_CREDENTIALS_PATH)).map(PathBuf::from);
        config.admin_token_sha256 =
            non_empty(lookup(ENV_ADMIN_TOKEN)).map(|token| sha256(token.as_bytes()));
        match non_empty(lookup(ENV_PSEUDONYM_SALT)) {
            Some(salt) if salt.len() >= MIN_PSEUDONYM_SALT_LEN => {
                config.pseudonym_salt = Zeroizing::new(salt.into_bytes());
            }
            Some(_) => {
                tracing::warn!(
                    min_len = MIN_PSEUDONYM_SALT_LEN,
                    "pseudonym salt too short; using a random per-process salt"
                );
            }
            None => {
                tracing::warn!("no pseudonym salt configured; pseudonyms will not survive restart");
            }
        }
        if let Some(raw) = lookup(ENV_KMS_PROVIDER) {
            config.kms_provider = KmsProviderKind::parse(&raw)?;
        }
        if let Some(id) = non_empty(lookup(ENV_MASTER_KEY_ID)) {
            config.initial_master_key_id = id;
        }
        if let Some(ms) = parse_in_range(lookup(ENV_STORAGE_TIMEOUT_MS), 10..=60_000u64) {
            config.storage_timeout_ms = ms;
        }
        if let Some(ms) = parse_in_range(lookup(ENV_KEY_ACCESS_TIMEOUT_MS), 10..=60_000u64) {
            config.key_access_timeout_ms = ms;
        }
        if let Some(k) = parse_in_range(lookup(ENV_K_ANONYMITY_FLOOR), 2..=10_000u64) {
            config.aggregator.k_anonymity_floor = k;
        }
        if let Some(ms) = parse_in_range(lookup(ENV_SLO_WINDOW_MS), 1_000..=3_600_000u64) {
            config.slo.window_ms = ms;
        }
        if let Some(n) = parse_in_range(lookup(ENV_SLO_MIN_SAMPLES), 1..=100_000u32) {
            config.slo.min_samples = n;
        }
        if let Some(r) = parse_in_range(lookup(ENV_SLO_MAX_VIOLATION_RATIO), 0.01..=0.99f64) {
            config.slo.max_violation_ratio = r;
        }
        Ok(config)
    }

    /// Replaces the pseudonym salt. Deployments that persist records must pin it.
    pub fn with_pseudonym_salt(mut self, salt: &[u8]) -> Self {
        self.pseudonym_salt = Zeroizing::new(salt.to_vec());
        self
    }

    pub fn with_admin_token(mut self, token: &str) -> Self {
        self.admin_token_sha256 = Some(sha256(token.as_bytes()));
        self
    }

    pub fn pseudonymizer(&self) -> Pseudonymizer {
        Pseudonymizer::new(&self.pseudonym_salt)
    }

    /// Reads the JSON array of credential grants. No path means no callers.
    pub fn load_credential_grants(&self) -> Result<Vec<CredentialGrant>, ConfigError> {
        let Some(path) = self.credentials_path.as_ref() else {
            tracing::warn!("no credentials file configured; every request will be unauthorized");
            return Ok(Vec::new());
        };
        let raw = fs::read_to_string(path).map_err(|err| ConfigError::CredentialsRead {
            path: path.display().to_string(),
            detail: err.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|err| ConfigError::CredentialsParse {
            path: path.display().to_string(),
            detail: err.to_string(),
        })
    }
}
