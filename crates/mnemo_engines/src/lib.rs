#![forbid(unsafe_code)]

pub mod aggregator;
pub mod canonical;
pub mod consent;
pub mod envelope;
pub mod kms;
pub mod ledger;
pub mod merkle;
pub mod signer;
pub mod slo;
pub mod telemetry;
