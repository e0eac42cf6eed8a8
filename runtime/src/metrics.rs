//! Prometheus metrics for the registration engine.
//!
//! Counters recorded by the engine:
//! - `placement.submission.total{outcome}`: submissions by outcome
//! - `placement.ledger.reserved` / `placement.ledger.released`: ledger movements
//! - `placement.staff_action.total{action, outcome}`: staff transitions
//! - `placement.store.failures{operation}`: store failures sent to diagnostics
//! - `placement.conflict.retries`: re-plans after a lost race
//!
//! # Example
//!
//! ```rust,no_run
//! use placement_runtime::metrics::install_prometheus;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Scrape endpoint on :9090, served from the current Tokio runtime.
//! let handle = install_prometheus(Some("0.0.0.0:9090".parse()?))?;
//! println!("{}", handle.render());
//! # Ok(())
//! # }
//! ```

use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

pub use metrics::counter;

/// Why the Prometheus exporter could not be installed.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The exporter could not be built (bad listener address, bucket config).
    #[error("Cannot build Prometheus exporter: {0}")]
    Build(String),

    /// A global recorder is already installed in this process.
    #[error("A metrics recorder is already installed")]
    AlreadyInstalled,
}

/// Install a Prometheus recorder as the global `metrics` recorder and
/// describe the engine's counters.
///
/// With `listen`, a scrape endpoint is spawned on the current Tokio runtime.
/// Without it, nothing listens and the returned handle renders on demand,
/// which suits embedding in an existing HTTP server.
///
/// # Errors
///
/// [`MetricsError::Build`] if the exporter cannot be built,
/// [`MetricsError::AlreadyInstalled`] if a recorder is already set.
pub fn install_prometheus(listen: Option<SocketAddr>) -> Result<PrometheusHandle, MetricsError> {
    let builder = match listen {
        Some(addr) => PrometheusBuilder::new().with_http_listener(addr),
        None => PrometheusBuilder::new(),
    };

    let handle = if listen.is_some() {
        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;
        tokio::spawn(async move {
            if let Err(error) = exporter.await {
                tracing::error!(error = ?error, "Prometheus endpoint stopped");
            }
        });
        handle
    } else {
        let recorder = builder.build_recorder();
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|_| MetricsError::AlreadyInstalled)?;
        handle
    };

    register_metrics();
    match listen {
        Some(addr) => tracing::info!(%addr, "Prometheus endpoint listening"),
        None => tracing::info!("Prometheus recorder installed"),
    }
    Ok(handle)
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        "placement.submission.total",
        "Internship registration submissions by outcome"
    );
    describe_counter!(
        "placement.ledger.reserved",
        "Capacity units reserved in the position occupancy ledger"
    );
    describe_counter!(
        "placement.ledger.released",
        "Capacity units released from the position occupancy ledger"
    );
    describe_counter!(
        "placement.staff_action.total",
        "Staff status transitions by action and outcome"
    );
    describe_counter!(
        "placement.store.failures",
        "Store operations that failed and were reported to diagnostics"
    );
    describe_counter!(
        "placement.conflict.retries",
        "Operations re-planned after losing a race"
    );
}

/// Submission metrics recorder.
pub struct SubmissionMetrics;

impl SubmissionMetrics {
    /// Record a submission outcome (`accepted`, `links_attached`, `full`, `already_locked`, `track_closed`, `error`).
    pub fn record(outcome: &'static str) {
        counter!("placement.submission.total", "outcome" => outcome).increment(1);
    }
}

/// Ledger metrics recorder.
pub struct LedgerMetrics;

impl LedgerMetrics {
    /// Record one unit reserved.
    pub fn record_reserved() {
        counter!("placement.ledger.reserved").increment(1);
    }

    /// Record one unit released.
    pub fn record_released() {
        counter!("placement.ledger.released").increment(1);
    }
}

/// Staff action metrics recorder.
pub struct StaffActionMetrics;

impl StaffActionMetrics {
    /// Record a staff action and whether it was applied.
    pub fn record(action: &'static str, applied: bool) {
        let outcome = if applied { "applied" } else { "refused" };
        counter!("placement.staff_action.total", "action" => action, "outcome" => outcome)
            .increment(1);
    }
}

/// Store metrics recorder.
pub struct StoreMetrics;

impl StoreMetrics {
    /// Record a store failure.
    pub fn record_failure(operation: &'static str) {
        counter!("placement.store.failures", "operation" => operation).increment(1);
    }

    /// Record a re-plan after a lost race.
    pub fn record_conflict_retry() {
        counter!("placement.conflict.retries").increment(1);
    }
}
