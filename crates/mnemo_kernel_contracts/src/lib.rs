#![forbid(unsafe_code)]

pub mod aggregation;
pub mod audit;
pub mod common;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod memory;
pub mod operations;
pub mod tier;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};
pub use error::{ForbiddenReason, GovernanceError, InternalFailure, PublicErrorCode};
