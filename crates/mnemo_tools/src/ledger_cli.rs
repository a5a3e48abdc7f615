#![forbid(unsafe_code)]

use std::fs;

use mnemo_engines::ledger::{verify_chain, verify_receipt};
use mnemo_kernel_contracts::audit::{AuditReceipt, ChainVerification, LedgerExport};
use mnemo_kernel_contracts::keys::{JwkSet, PublicKeySet};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub const USAGE: &str =
    "usage: mnemo ledger <verify <ledger.json> <jwks.json> | receipt <receipt.json> <jwks.json>>";

/// Offline report. Never echoes payloads or subject pseudonyms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerReport {
    pub valid: bool,
    pub checked_events: u64,
    pub height: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl LedgerReport {
    fn from_verification(verification: &ChainVerification, height: u64) -> Self {
        Self {
            valid: verification.valid,
            checked_events: verification.checked_events,
            height,
            failure_index: verification.failure_index,
            failure_reason: verification.failure_reason.map(|r| r.as_str().to_string()),
        }
    }
}

pub fn execute_ledger_command(args: &[String]) -> Result<String, String> {
    let subcommand = args.first().map(String::as_str).ok_or_else(|| USAGE.to_string())?;
    match subcommand {
        "verify" => {
            let (ledger_path, jwks_path) = two_paths(args)?;
            let export: LedgerExport = read_json(ledger_path)?;
            let keys = read_keys(jwks_path)?;
            let report = verify_export(&export, &keys);
            let rendered = to_json(&report)?;
            if report.valid {
                Ok(rendered)
            } else {
                Err(rendered)
            }
        }
        "receipt" => {
            let (receipt_path, jwks_path) = two_paths(args)?;
            let receipt: AuditReceipt = read_json(receipt_path)?;
            let keys = read_keys(jwks_path)?;
            verify_receipt(&receipt, &keys)
                .map_err(|e| format!("receipt {} rejected: {e}", receipt.event_id.as_str()))?;
            Ok("OK".to_string())
        }
        _ => Err(format!(
            "unknown ledger subcommand: {subcommand}. expected one of: verify, receipt"
        )),
    }
}

/// Chain check plus head consistency: a truncated export with an untouched
/// head fails on height even though every remaining link verifies.
pub fn verify_export(export: &LedgerExport, keys: &PublicKeySet) -> LedgerReport {
    let verification = verify_chain(&export.events, keys);
    let mut report = LedgerReport::from_verification(&verification, export.head.height);
    if !report.valid {
        return report;
    }
    let event_count = export.events.len() as u64;
    let tail_matches = export
        .events
        .last()
        .map(|e| e.current_hash == export.head.last_event_hash)
        .unwrap_or(true);
    if export.head.height != event_count || !tail_matches {
        report.valid = false;
        report.failure_index = Some(event_count.min(export.head.height));
        report.failure_reason = Some("head_mismatch".to_string());
    }
    report
}

fn two_paths(args: &[String]) -> Result<(&str, &str), String> {
    match (args.get(1), args.get(2)) {
        (Some(a), Some(b)) => Ok((a.as_str(), b.as_str())),
        _ => Err(USAGE.to_string()),
    }
}

fn read_json<T: DeserializeOwned>(path: &str) -> Result<T, String> {
    let raw = fs::read_to_string(path).map_err(|e| format!("failed to read {path}: {e}"))?;
    serde_json::from_str(&raw).map_err(|e| format!("failed to parse {path}: {e}"))
}

fn read_keys(path: &str) -> Result<PublicKeySet, String> {
    let jwks: JwkSet = read_json(path)?;
    PublicKeySet::from_jwks(&jwks).map_err(|e| format!("invalid key set in {path}: {e}"))
}

fn to_json<T: Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mnemo_engines::kms::InProcessKms;
    use mnemo_engines::ledger::{EmitRequest, HashChain, MerkleAuditLedger};
    use mnemo_engines::signer::{Ed25519KeyRegistry, Signer};
    use mnemo_engines::telemetry::GovernanceTelemetry;
    use mnemo_kernel_contracts::audit::{AuditEventType, OperationName};
    use mnemo_kernel_contracts::MonotonicTimeNs;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    struct Fixture {
        base: PathBuf,
        ledger: MerkleAuditLedger,
    }

    impl Fixture {
        fn new(tag: &str, events: u64) -> Self {
            let suffix = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(1);
            let base = std::env::temp_dir().join(format!("mnemo-ledger-cli-{tag}-{suffix}"));
            fs::create_dir_all(&base).unwrap();
            let registry = Arc::new(
                Ed25519KeyRegistry::new(Arc::new(InProcessKms::new()), MonotonicTimeNs(1))
                    .unwrap(),
            );
            let ledger = MerkleAuditLedger::new(registry, GovernanceTelemetry::new());
            for n in 0..events {
                ledger
                    .emit(
                        EmitRequest::new(
                            AuditEventType::MemoryStored,
                            OperationName::new("store").unwrap(),
                            json!({"record_id": format!("rec_{n}")}),
                        ),
                        MonotonicTimeNs(10 + n),
                    )
                    .unwrap();
            }
            Self { base, ledger }
        }

        fn write<T: Serialize>(&self, name: &str, value: &T) -> String {
            let path = self.base.join(name);
            fs::write(&path, serde_json::to_vec(value).unwrap()).unwrap();
            path.to_string_lossy().into_owned()
        }

        fn jwks_path(&self) -> String {
            self.write("jwks.json", &self.ledger.public_key_set().to_jwks())
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.base);
        }
    }

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn at_ledger_cli_01_exported_chain_verifies_offline() {
        let fx = Fixture::new("verify", 4);
        let ledger = fx.write("ledger.json", &fx.ledger.export());
        let jwks = fx.jwks_path();
        let out = execute_ledger_command(&args(&["verify", &ledger, &jwks])).unwrap();
        let report: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(report["valid"], true);
        assert_eq!(report["checked_events"], 4);
        assert_eq!(report["height"], 4);
    }

    #[test]
    fn at_ledger_cli_02_edited_payload_names_the_broken_index() {
        let fx = Fixture::new("edited", 3);
        let mut export = fx.ledger.export();
        export.events[1].payload = json!({"record_id": "rec_forged"});
        let ledger = fx.write("ledger.json", &export);
        let jwks = fx.jwks_path();
        let err = execute_ledger_command(&args(&["verify", &ledger, &jwks])).unwrap_err();
        let report: serde_json::Value = serde_json::from_str(&err).unwrap();
        assert_eq!(report["valid"], false);
        assert_eq!(report["failure_index"], 1);
        assert!(!err.contains("rec_forged"));
    }

    #[test]
    fn at_ledger_cli_03_truncated_tail_fails_on_head() {
        let fx = Fixture::new("truncated", 3);
        let mut export = fx.ledger.export();
        export.events.pop();
        let ledger = fx.write("ledger.json", &export);
        let jwks = fx.jwks_path();
        let err = execute_ledger_command(&args(&["verify", &ledger, &jwks])).unwrap_err();
        assert!(err.contains("head_mismatch"));
    }

    #[test]
    fn at_ledger_cli_04_receipt_verifies_after_key_rotation() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(1);
        let base = std::env::temp_dir().join(format!("mnemo-ledger-cli-rotate-{suffix}"));
        fs::create_dir_all(&base).unwrap();
        let registry = Arc::new(
            Ed25519KeyRegistry::new(Arc::new(InProcessKms::new()), MonotonicTimeNs(1)).unwrap(),
        );
        let ledger = MerkleAuditLedger::new(registry.clone(), GovernanceTelemetry::new());
        let receipt = ledger
            .emit(
                EmitRequest::new(
                    AuditEventType::MemoryStored,
                    OperationName::new("store").unwrap(),
                    json!({"record_id": "rec_0"}),
                ),
                MonotonicTimeNs(2),
            )
            .unwrap();
        registry.rotate(None, MonotonicTimeNs(3)).unwrap();

        let receipt_path = base.join("receipt.json");
        fs::write(&receipt_path, serde_json::to_vec(&receipt).unwrap()).unwrap();
        let jwks_path = base.join("jwks.json");
        fs::write(
            &jwks_path,
            serde_json::to_vec(&registry.public_key_set().to_jwks()).unwrap(),
        )
        .unwrap();
        let out = execute_ledger_command(&args(&[
            "receipt",
            receipt_path.to_str().unwrap(),
            jwks_path.to_str().unwrap(),
        ]))
        .unwrap();
        assert_eq!(out, "OK");
        fs::remove_dir_all(base).unwrap();
    }

    #[test]
    fn unknown_subcommand_and_missing_paths_are_usage_errors() {
        assert!(execute_ledger_command(&args(&["prune"]))
            .unwrap_err()
            .contains("unknown ledger subcommand"));
        assert_eq!(
            execute_ledger_command(&args(&["verify", "only-one.json"])).unwrap_err(),
            USAGE
        );
        assert_eq!(execute_ledger_command(&[]).unwrap_err(), USAGE);
    }

    #[test]
    fn unreadable_file_reports_path() {
        let err = execute_ledger_command(&args(&[
            "verify",
            "/nonexistent/mnemo/ledger.json",
            "/nonexistent/mnemo/jwks.json",
        ]))
        .unwrap_err();
        assert!(err.contains("/nonexistent/mnemo/ledger.json"));
    }
}
