// src/metrics.rs

#[cfg(feature = "observability")]
pub use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};

// NOTE: When observability feature is disabled, provide stub implementations
#[cfg(not(feature = "observability"))]
pub enum Unit {}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = &$value;
        $(let _ = &$label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = &$value;
        $(let _ = &$label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {{
        let _ = &$value;
        $(let _ = &$label_value;)*
    }};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

use std::time::Duration;

/// Registers metric descriptions. Call once at startup.
pub fn describe_metrics() {
    describe_counter!(
        "indexer_ticks_total",
        Unit::Count,
        "Indexer ticks, labeled by outcome (ok, idle, failed)."
    );
    describe_counter!(
        "indexer_events_total",
        Unit::Count,
        "Events reconciled, labeled by event kind."
    );
    describe_counter!(
        "indexer_errors_total",
        Unit::Count,
        "Failed ticks, labeled by error kind."
    );
    describe_counter!(
        "indexer_rpc_calls_total",
        Unit::Count,
        "RPC calls issued, labeled by method."
    );
    describe_gauge!("indexer_last_block", "Last block committed to the checkpoint.");
    describe_gauge!("indexer_chain_head", "Chain head seen by the last tick.");
    describe_gauge!("indexer_known_pools", "Pool contracts currently tracked.");
    describe_histogram!(
        "indexer_tick_duration_seconds",
        Unit::Seconds,
        "Wall time of a tick that processed a range."
    );
}

/// Installs the Prometheus scrape endpoint on `bind`.
#[cfg(feature = "observability")]
pub fn init_exporter(bind: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(bind)
        .install()?;
    describe_metrics();
    Ok(())
}

pub fn increment_rpc_call(method: &'static str) {
    counter!("indexer_rpc_calls_total", 1, "method" => method);
}

pub fn increment_tick(outcome: &'static str) {
    counter!("indexer_ticks_total", 1, "outcome" => outcome);
}

pub fn increment_tick_error(kind: &'static str) {
    counter!("indexer_errors_total", 1, "kind" => kind);
}

pub fn increment_events(kind: &'static str, count: u64) {
    counter!("indexer_events_total", count, "kind" => kind);
}

pub fn set_last_block(block: u64) {
    gauge!("indexer_last_block", block as f64);
}

pub fn set_chain_head(block: u64) {
    gauge!("indexer_chain_head", block as f64);
}

pub fn set_known_pools(count: usize) {
    gauge!("indexer_known_pools", count as f64);
}

pub fn record_tick_duration(duration: Duration) {
    histogram!("indexer_tick_duration_seconds", duration.as_secs_f64());
}
