#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use mnemo_kernel_contracts::{GovernanceError, MonotonicTimeNs};
use parking_lot::Mutex;
use serde::Serialize;

use crate::telemetry::{GovernanceTelemetry, LatencyHistogram};

pub mod reason_codes {
    use mnemo_kernel_contracts::ReasonCodeId;

    pub const MNEMO_SLO_BREAKER_OPENED: ReasonCodeId = ReasonCodeId(0x534C_0001);
    pub const MNEMO_SLO_BREAKER_CLOSED: ReasonCodeId = ReasonCodeId(0x534C_0002);
    pub const MNEMO_SLO_REJECTED_OPEN: ReasonCodeId = ReasonCodeId(0x534C_00F1);
}

#[derive(Debug, Clone, PartialEq)]
pub struct SloConfig {
    pub window_ms: u64,
    pub min_samples: u32,
    pub max_violation_ratio: f64,
    pub default_p99_target_ms: u64,
    pub p99_targets_ms: BTreeMap<String, u64>,
}

impl SloConfig {
    pub fn mvp_v1() -> Self {
        let p99_targets_ms = [
            ("store", 250),
            ("recall", 250),
            ("forget", 250),
            ("export", 500),
            ("distill", 1_000),
        ]
        .into_iter()
        .map(|(op, ms)| (op.to_string(), ms))
        .collect();
        Self {
            window_ms: 60_000,
            min_samples: 10,
            max_violation_ratio: 0.5,
            default_p99_target_ms: 500,
            p99_targets_ms,
        }
    }

    pub fn target_for(&self, operation: &str) -> u64 {
        self.p99_targets_ms
            .get(operation)
            .copied()
            .unwrap_or(self.default_p99_target_ms)
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: MonotonicTimeNs,
    violated: bool,
}

#[derive(Debug, Default)]
struct OperationWindow {
    samples: VecDeque<Sample>,
    violations: usize,
    histogram: LatencyHistogram,
    open: bool,
}

impl OperationWindow {
    /// Keeps samples in `(now - window, now]`.
    fn prune(&mut self, now: MonotonicTimeNs, window_ms: u64) {
        let cutoff = now.saturating_sub_ms(window_ms);
        while self.samples.front().is_some_and(|s| s.at <= cutoff) {
            if let Some(expired) = self.samples.pop_front() {
                if expired.violated {
                    self.violations -= 1;
                }
            }
        }
    }

    fn violation_ratio(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.violations as f64 / self.samples.len() as f64
    }

    fn should_open(&self, config: &SloConfig) -> bool {
        self.samples.len() >= config.min_samples as usize
            && self.violation_ratio() > config.max_violation_ratio
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub operation: String,
    pub samples: usize,
    pub violations: usize,
    pub is_open: bool,
    pub p99_target_ms: u64,
    pub p99_observed_upper_bound_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SloSample {
    pub violated: bool,
    pub is_open: bool,
}

/// Per-operation rolling windows behind one lock, so a pre-check and a record
/// never interleave mid-prune. Recovery is by window decay only.
#[derive(Debug)]
pub struct SloMonitor {
    config: SloConfig,
    telemetry: GovernanceTelemetry,
    windows: Mutex<HashMap<String, OperationWindow>>,
}

impl SloMonitor {
    pub fn new(config: SloConfig, telemetry: GovernanceTelemetry) -> Self {
        Self {
            config,
            telemetry,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SloConfig {
        &self.config
    }

    fn sync_open_state(&self, operation: &str, window: &mut OperationWindow) -> bool {
        let open = window.should_open(&self.config);
        if open != window.open {
            window.open = open;
            self.telemetry.set_breaker_open(operation, open);
            if open {
                tracing::warn!(
                    target: "mnemo.slo",
                    operation,
                    samples = window.samples.len(),
                    violations = window.violations,
                    reason_code = %reason_codes::MNEMO_SLO_BREAKER_OPENED,
                    "circuit opened"
                );
            } else {
                tracing::info!(
                    target: "mnemo.slo",
                    operation,
                    reason_code = %reason_codes::MNEMO_SLO_BREAKER_CLOSED,
                    "circuit closed after window decay"
                );
            }
        }
        open
    }

    /// Pre-check run before any handler. An open circuit rejects without
    /// touching the window.
    pub fn check(&self, operation: &str, now: MonotonicTimeNs) -> Result<(), GovernanceError> {
        let mut windows = self.windows.lock();
        let Some(window) = windows.get_mut(operation) else {
            return Ok(());
        };
        window.prune(now, self.config.window_ms);
        if !self.sync_open_state(operation, window) {
            return Ok(());
        }
        let oldest = window.samples.front().map(|s| s.at).unwrap_or(now);
        let expires = oldest.plus_ms(self.config.window_ms);
        let retry_after_ms = (expires.0.saturating_sub(now.0) / 1_000_000).max(1);
        self.telemetry.record_breaker_rejection(operation);
        tracing::warn!(
            target: "mnemo.slo",
            operation,
            retry_after_ms,
            reason_code = %reason_codes::MNEMO_SLO_REJECTED_OPEN,
            "request rejected by open circuit"
        );
        Err(GovernanceError::ServiceUnavailable {
            operation: operation.to_string(),
            retry_after_ms,
        })
    }

    pub fn record(&self, operation: &str, latency: Duration, now: MonotonicTimeNs) -> SloSample {
        let target = Duration::from_millis(self.config.target_for(operation));
        let violated = latency > target;
        let mut windows = self.windows.lock();
        let window = windows.entry(operation.to_string()).or_default();
        window.prune(now, self.config.window_ms);
        window.samples.push_back(Sample { at: now, violated });
        if violated {
            window.violations += 1;
        }
        window.histogram.record(latency);
        let is_open = self.sync_open_state(operation, window);
        drop(windows);
        self.telemetry.record_operation_latency(operation, latency);
        SloSample { violated, is_open }
    }

    pub fn snapshot(&self, operation: &str, now: MonotonicTimeNs) -> BreakerSnapshot {
        let mut windows = self.windows.lock();
        let p99_target_ms = self.config.target_for(operation);
        match windows.get_mut(operation) {
            Some(window) => {
                window.prune(now, self.config.window_ms);
                let is_open = self.sync_open_state(operation, window);
                BreakerSnapshot {
                    operation: operation.to_string(),
                    samples: window.samples.len(),
                    violations: window.violations,
                    is_open,
                    p99_target_ms,
                    p99_observed_upper_bound_ms: window.histogram.p99_upper_bound_ms(),
                }
            }
            None => BreakerSnapshot {
                operation: operation.to_string(),
                samples: 0,
                violations: 0,
                is_open: false,
                p99_target_ms,
                p99_observed_upper_bound_ms: None,
            },
        }
    }
}
