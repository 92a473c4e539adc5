//! Core metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - plain names for gauges

use metrics::{counter, describe_counter, describe_gauge, gauge};

/// Register all core metrics with descriptions.
pub fn register_core_metrics() {
    describe_counter!(
        "passthru_detach_total",
        "Total number of successful detach operations (by stub driver)"
    );
    describe_counter!("passthru_reattach_total", "Total number of devices returned to the host");
    describe_counter!(
        "passthru_operation_failures_total",
        "Total number of failed operations (by operation, kind)"
    );
    describe_counter!(
        "passthru_reset_failures_total",
        "Total number of best-effort device resets that failed"
    );
    describe_counter!(
        "passthru_state_persist_failures_total",
        "Total number of failed writes of the device ledger"
    );
    describe_gauge!("passthru_devices", "Current number of managed devices (by list)");
}

pub fn record_detach(stub: &str) {
    counter!("passthru_detach_total", "stub" => stub.to_string()).increment(1);
}

pub fn record_reattach() {
    counter!("passthru_reattach_total").increment(1);
}

pub fn record_failure(operation: &str, kind: &str) {
    counter!(
        "passthru_operation_failures_total",
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_reset_failure() {
    counter!("passthru_reset_failures_total").increment(1);
}

pub fn record_persist_failure() {
    counter!("passthru_state_persist_failures_total").increment(1);
}

pub fn set_device_count(list: &str, count: usize) {
    gauge!("passthru_devices", "list" => list.to_string()).set(count as f64);
}
