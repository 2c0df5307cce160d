//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,heron=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize the Prometheus metrics exporter on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Record a statement-cache lookup. `outcome` is "hit", "miss" or "stale".
pub fn record_statement_cache_lookup(outcome: &str) {
    metrics::counter!("heron_statement_cache_lookups_total", "outcome" => outcome.to_string())
        .increment(1);
}

pub fn record_statement_cache_size(entries: usize) {
    metrics::gauge!("heron_statement_cache_entries").set(entries as f64);
}

/// Record one Execute (or simple-query statement) with its command tag verb.
pub fn record_execute(verb: &str, duration_us: u64, success: bool) {
    metrics::counter!(
        "heron_statements_total",
        "verb" => verb.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
    metrics::histogram!("heron_statement_duration_us", "verb" => verb.to_string())
        .record(duration_us as f64);
}

/// `direction` is "in" or "out".
pub fn record_copy_rows(direction: &str, rows: u64) {
    metrics::counter!("heron_copy_rows_total", "direction" => direction.to_string())
        .increment(rows);
}

pub fn record_active_connections(count: usize) {
    metrics::gauge!("heron_active_connections").set(count as f64);
}

pub fn record_cancellation() {
    metrics::counter!("heron_statement_cancellations_total").increment(1);
}

pub fn record_portal_suspended() {
    metrics::counter!("heron_portal_suspensions_total").increment(1);
}

/// Record an error response by SQLSTATE class (first two characters).
pub fn record_error(sqlstate: &str) {
    let class = sqlstate.get(..2).unwrap_or(sqlstate);
    metrics::counter!("heron_errors_total", "class" => class.to_string()).increment(1);
}
