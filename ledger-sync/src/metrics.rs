//! Prometheus metrics for the ledger sync pipeline

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Inbound events by outcome (acknowledged, rejected, failed)
    pub static ref EVENTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_sync_events_total",
        "Inbound transaction events by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Failed attempts that were retried, by operation
    pub static ref RETRY_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_sync_retry_attempts_total",
        "Failed attempts of external calls, by operation",
        &["operation"]
    )
    .unwrap();

    /// Sync cycles by outcome (applied, empty, failed)
    pub static ref SYNC_CYCLES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_sync_cycles_total",
        "Cache reconciliation cycles by outcome",
        &["outcome"]
    )
    .unwrap();

    /// Highest transaction id incorporated into the cache
    pub static ref SYNC_CURSOR: IntGauge = register_int_gauge!(
        "ledger_sync_cursor",
        "Last transaction id incorporated into the balance cache"
    )
    .unwrap();

    /// Synthetic events published
    pub static ref PUBLISHED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "ledger_sync_published_total",
        "Synthetic transaction events published",
        &["status"]
    )
    .unwrap();
}

/// Render the default registry in the Prometheus text format
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Metrics are not valid UTF-8: {}", e))
}
