#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// Upper bounds in milliseconds; the final bucket is `+Inf`.
pub const LATENCY_BUCKETS_MS: [u64; 13] = [1, 2, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10_000];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatencyHistogram {
    buckets: BTreeMap<u64, u64>,
    total: u64,
}

impl LatencyHistogram {
    pub fn record(&mut self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        let bucket = LATENCY_BUCKETS_MS
            .into_iter()
            .find(|bound| ms <= *bound)
            .unwrap_or(u64::MAX);
        let entry = self.buckets.entry(bucket).or_insert(0);
        *entry = entry.saturating_add(1);
        self.total = self.total.saturating_add(1);
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Upper bound of the bucket holding the 99th percentile sample, or `None`
    /// before any sample or when it falls in the `+Inf` bucket.
    pub fn p99_upper_bound_ms(&self) -> Option<u64> {
        if self.total == 0 {
            return None;
        }
        let rank = self.total - self.total / 100;
        let mut seen = 0u64;
        for (bound, count) in &self.buckets {
            seen = seen.saturating_add(*count);
            if seen >= rank {
                return (*bound != u64::MAX).then_some(*bound);
            }
        }
        None
    }

    fn render_cumulative(&self, out: &mut String, name: &str, labels: &str) {
        let mut cumulative = 0u64;
        for bound in LATENCY_BUCKETS_MS {
            cumulative = cumulative.saturating_add(self.buckets.get(&bound).copied().unwrap_or(0));
            let _ = writeln!(out, "{name}_bucket{{{labels}le=\"{bound}\"}} {cumulative}");
        }
        let _ = writeln!(out, "{name}_bucket{{{labels}le=\"+Inf\"}} {}", self.total);
        let count_labels = labels.trim_end_matches(',');
        if count_labels.is_empty() {
            let _ = writeln!(out, "{name}_count {}", self.total);
        } else {
            let _ = writeln!(out, "{name}_count{{{count_labels}}} {}", self.total);
        }
    }
}

#[derive(Debug, Default)]
struct TelemetryState {
    audit_events_total: BTreeMap<(String, String), u64>,
    consent_decisions_total: BTreeMap<(String, String), u64>,
    ledger_height: u64,
    signing_latency: LatencyHistogram,
    operation_latency: BTreeMap<String, LatencyHistogram>,
    chain_verification_failures_total: u64,
    receipt_verification_failures_total: u64,
    breaker_rejections_total: BTreeMap<String, u64>,
    breaker_open: BTreeMap<String, u8>,
    aggregation_refusals_total: u64,
    key_rotations_total: BTreeMap<String, u64>,
}

/// Process-wide counters, cloned cheaply into every component.
#[derive(Debug, Clone, Default)]
pub struct GovernanceTelemetry {
    state: Arc<Mutex<TelemetryState>>,
}

impl GovernanceTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_audit_event(&self, event_type: &str, operation: &str, ledger_height: u64) {
        let mut guard = self.state.lock();
        let entry = guard
            .audit_events_total
            .entry((event_type.to_string(), operation.to_string()))
            .or_insert(0);
        *entry = entry.saturating_add(1);
        guard.ledger_height = guard.ledger_height.max(ledger_height);
    }

    pub fn record_consent_decision(&self, decision: &str, reason: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .consent_decisions_total
            .entry((decision.to_string(), reason.to_string()))
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_signing_latency(&self, latency: Duration) {
        self.state.lock().signing_latency.record(latency);
    }

    pub fn record_operation_latency(&self, operation: &str, latency: Duration) {
        self.state
            .lock()
            .operation_latency
            .entry(operation.to_string())
            .or_default()
            .record(latency);
    }

    pub fn record_chain_verification_failure(&self) {
        let mut guard = self.state.lock();
        guard.chain_verification_failures_total =
            guard.chain_verification_failures_total.saturating_add(1);
    }

    pub fn record_receipt_verification_failure(&self) {
        let mut guard = self.state.lock();
        guard.receipt_verification_failures_total =
            guard.receipt_verification_failures_total.saturating_add(1);
    }

    pub fn record_breaker_rejection(&self, operation: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .breaker_rejections_total
            .entry(operation.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn set_breaker_open(&self, operation: &str, open: bool) {
        self.state
            .lock()
            .breaker_open
            .insert(operation.to_string(), u8::from(open));
    }

    pub fn record_aggregation_refusal(&self) {
        let mut guard = self.state.lock();
        guard.aggregation_refusals_total = guard.aggregation_refusals_total.saturating_add(1);
    }

    pub fn record_key_rotation(&self, key_kind: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .key_rotations_total
            .entry(key_kind.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn ledger_height(&self) -> u64 {
        self.state.lock().ledger_height
    }

    pub fn chain_verification_failures(&self) -> u64 {
        self.state.lock().chain_verification_failures_total
    }

    pub fn breaker_rejections(&self, operation: &str) -> u64 {
        self.state
            .lock()
            .breaker_rejections_total
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    /// Prometheus text exposition format.
    pub fn render(&self) -> String {
        let guard = self.state.lock();
        let mut out = String::new();
        out.push_str("# TYPE mnemo_audit_events_total counter\n");
        for ((event_type, operation), value) in &guard.audit_events_total {
            let _ = writeln!(
                out,
                "mnemo_audit_events_total{{event_type=\"{}\",operation=\"{}\"}} {}",
                event_type, operation, value
            );
        }
        out.push_str("# TYPE mnemo_consent_decisions_total counter\n");
        for ((decision, reason), value) in &guard.consent_decisions_total {
            let _ = writeln!(
                out,
                "mnemo_consent_decisions_total{{decision=\"{}\",reason=\"{}\"}} {}",
                decision, reason, value
            );
        }
        out.push_str("# TYPE mnemo_ledger_height gauge\n");
        let _ = writeln!(out, "mnemo_ledger_height {}", guard.ledger_height);
        out.push_str("# TYPE mnemo_signing_latency_ms histogram\n");
        guard
            .signing_latency
            .render_cumulative(&mut out, "mnemo_signing_latency_ms", "");
        out.push_str("# TYPE mnemo_operation_latency_ms histogram\n");
        for (operation, histogram) in &guard.operation_latency {
            let labels = format!("operation=\"{operation}\",");
            histogram.render_cumulative(&mut out, "mnemo_operation_latency_ms", &labels);
        }
        out.push_str("# TYPE mnemo_chain_verification_failures_total counter\n");
        let _ = writeln!(
            out,
            "mnemo_chain_verification_failures_total {}",
            guard.chain_verification_failures_total
        );
        out.push_str("# TYPE mnemo_receipt_verification_failures_total counter\n");
        let _ = writeln!(
            out,
            "mnemo_receipt_verification_failures_total {}",
            guard.receipt_verification_failures_total
        );
        out.push_str("# TYPE mnemo_breaker_rejections_total counter\n");
        for (operation, value) in &guard.breaker_rejections_total {
            let _ = writeln!(
                out,
                "mnemo_breaker_rejections_total{{operation=\"{}\"}} {}",
                operation, value
            );
        }
        out.push_str("# TYPE mnemo_breaker_open gauge\n");
        for (operation, value) in &guard.breaker_open {
            let _ = writeln!(out, "mnemo_breaker_open{{operation=\"{}\"}} {}", operation, value);
        }
        out.push_str("# TYPE mnemo_aggregation_refusals_total counter\n");
        let _ = writeln!(
            out,
            "mnemo_aggregation_refusals_total {}",
            guard.aggregation_refusals_total
        );
        out.push_str("# TYPE mnemo_key_rotations_total counter\n");
        for (key_kind, value) in &guard.key_rotations_total {
            let _ = writeln!(
                out,
                "mnemo_key_rotations_total{{key_kind=\"{}\"}} {}",
                key_kind, value
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p99_reports_bucket_bound() {
        let mut h = LatencyHistogram::default();
        assert_eq!(h.p99_upper_bound_ms(), None);
        for _ in 0..99 {
            h.record(Duration::from_millis(3));
        }
        h.record(Duration::from_millis(400));
        assert_eq!(h.total(), 100);
        assert_eq!(h.p99_upper_bound_ms(), Some(5));
        h.record(Duration::from_secs(30));
        h.record(Duration::from_secs(30));
        assert_eq!(h.p99_upper_bound_ms(), None);
    }

    #[test]
    fn render_includes_counters_and_cumulative_buckets() {
        let t = GovernanceTelemetry::new();
        t.record_audit_event("memory_stored", "store", 3);
        t.record_audit_event("memory_stored", "store", 4);
        t.record_signing_latency(Duration::from_millis(2));
        t.record_breaker_rejection("distill");
        let text = t.render();
        assert!(text.contains(
            "mnemo_audit_events_total{event_type=\"memory_stored\",operation=\"store\"} 2"
        ));
        assert!(text.contains("mnemo_ledger_height 4"));
        assert!(text.contains("mnemo_signing_latency_ms_bucket{le=\"1\"} 0"));
        assert!(text.contains("mnemo_signing_latency_ms_bucket{le=\"2\"} 1"));
        assert!(text.contains("mnemo_signing_latency_ms_count 1"));
        assert!(text.contains("mnemo_breaker_rejections_total{operation=\"distill\"} 1"));
        assert_eq!(t.breaker_rejections("distill"), 1);
    }
}
