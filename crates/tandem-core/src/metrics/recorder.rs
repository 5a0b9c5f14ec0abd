//! Metrics recording utilities
//!
//! This module provides functions to record the cutover engine's signals:
//! replication lag, consistency mismatches, and the current cutover state.

use metrics::{counter, gauge};

/// Record replication lag in seconds for a table
pub fn record_lag_seconds(table: &str, lag: f64) {
    let labels = [("table", table.to_string())];
    gauge!("tandem_replication_lag_seconds", &labels).set(lag);
}

/// Record the number of mismatched keys found by the last verification of a table
pub fn record_mismatches(table: &str, count: u64) {
    let labels = [("table", table.to_string())];
    gauge!("tandem_consistency_mismatches", &labels).set(count as f64);
}

/// Record the current cutover state as a numeric code plus a labelled info gauge
pub fn record_cutover_state(migration: &str, state: &str, code: u8) {
    let labels = [("migration", migration.to_string())];
    gauge!("tandem_cutover_state", &labels).set(f64::from(code));
    let info = [
        ("migration", migration.to_string()),
        ("state", state.to_string()),
    ];
    counter!("tandem_cutover_transitions_total", &info).increment(1);
}

/// Record changes applied by a directional pipeline
pub fn record_changes_applied(direction: &str, table: &str, count: u64) {
    let labels = [
        ("direction", direction.to_string()),
        ("table", table.to_string()),
    ];
    counter!("tandem_changes_applied_total", &labels).increment(count);
}

/// Record a write conflict detected while applying a change
pub fn record_conflict(direction: &str, table: &str) {
    let labels = [
        ("direction", direction.to_string()),
        ("table", table.to_string()),
    ];
    counter!("tandem_apply_conflicts_total", &labels).increment(1);
}

/// Record a transient pipeline error that will be retried
pub fn record_pipeline_retry(direction: &str, table: &str) {
    let labels = [
        ("direction", direction.to_string()),
        ("table", table.to_string()),
    ];
    counter!("tandem_pipeline_retries_total", &labels).increment(1);
}

/// Record a pipeline halted by a non-retryable error
pub fn record_pipeline_halted(direction: &str, table: &str) {
    let labels = [
        ("direction", direction.to_string()),
        ("table", table.to_string()),
    ];
    counter!("tandem_pipeline_halts_total", &labels).increment(1);
}

/// Record a full table resync
pub fn record_table_resync(direction: &str, table: &str) {
    let labels = [
        ("direction", direction.to_string()),
        ("table", table.to_string()),
    ];
    counter!("tandem_table_resyncs_total", &labels).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_lag_seconds("users", 0.25);
        record_mismatches("users", 3);
        record_cutover_state("m1", "syncing", 1);
        record_changes_applied("blue_to_green", "users", 10);
        record_conflict("green_to_blue", "orders");
        record_pipeline_retry("blue_to_green", "users");
        record_pipeline_halted("blue_to_green", "users");
        record_table_resync("blue_to_green", "users");
    }
}
