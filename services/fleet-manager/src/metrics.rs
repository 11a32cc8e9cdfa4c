//! Prometheus metrics exposition
//!
//! The fleet library records through the `metrics` facade; this module
//! installs the exporter and registers help text for:
//!
//! - `fleet_workers_live` (gauge)
//! - `fleet_credential_transitions_total` (counter): label `status`
//! - `fleet_failovers_total` (counter): label `outcome`
//! - `fleet_broadcast_sends_total` (counter): labels `kind`, `result`

use anyhow::Context;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Only one global recorder may exist per process; a second call fails.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;
    describe_metrics();
    Ok(handle)
}

/// Attach help text to the fleet metrics on the current recorder.
pub fn describe_metrics() {
    metrics::describe_gauge!(
        "fleet_workers_live",
        "Workers whose dispatch loop is currently executing"
    );
    metrics::describe_counter!(
        "fleet_credential_transitions_total",
        "Credential status changes, by new status"
    );
    metrics::describe_counter!(
        "fleet_failovers_total",
        "Completed failover runs, by outcome"
    );
    metrics::describe_counter!(
        "fleet_broadcast_sends_total",
        "Broadcast deliveries, by broadcast kind and result"
    );
}
