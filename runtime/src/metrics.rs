//! Prometheus metrics for the fulfillment workers.
//!
//! Every pipeline step records into the global `metrics` recorder. Nothing is
//! exported until a recorder is installed, so recording is free in tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use order_fulfillment_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! if let Some(text) = server.render() {
//!     println!("{text}");
//! }
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, histogram};

/// Commands received with a decodable body.
pub const COMMANDS_RECEIVED: &str = "fulfillment_commands_received_total";
/// Handling attempts that finished, labelled by result.
pub const COMMANDS_COMPLETED: &str = "fulfillment_commands_completed_total";
/// Retries published by the scheduler.
pub const RETRIES_SCHEDULED: &str = "fulfillment_retries_scheduled_total";
/// Delay applied to scheduled retries.
pub const RETRY_DELAY: &str = "fulfillment_retry_delay_seconds";
/// Commands given up on.
pub const ESCALATIONS: &str = "fulfillment_escalations_total";
/// Secondary messages that could not be published.
pub const BEST_EFFORT_FAILURES: &str = "fulfillment_best_effort_publish_failures_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder for a worker process.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe the fulfillment metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// A recorder that is already installed (common in tests) is not an error.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        describe_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full(RETRY_DELAY.to_string()),
                &[1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Address the metrics are meant to be scraped from.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register descriptions for every fulfillment metric.
pub fn describe_metrics() {
    describe_counter!(COMMANDS_RECEIVED, "Commands received with a decodable body");
    describe_counter!(
        COMMANDS_COMPLETED,
        "Handling attempts that finished, by result (success, retry_scheduled, escalated, rejected, duplicate)"
    );
    describe_counter!(RETRIES_SCHEDULED, "Retries published with a deferred delivery time");
    describe_histogram!(RETRY_DELAY, "Backoff delay applied to scheduled retries");
    describe_counter!(ESCALATIONS, "Commands that exhausted their retry budget or failed finally");
    describe_counter!(
        BEST_EFFORT_FAILURES,
        "Events and notifications that could not be published"
    );
}

/// Pipeline metrics recorder.
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Record a command received.
    pub fn record_received(command: &'static str) {
        counter!(COMMANDS_RECEIVED, "command" => command).increment(1);
    }

    /// Record how handling a command ended.
    pub fn record_completed(command: &'static str, result: &'static str) {
        counter!(COMMANDS_COMPLETED, "command" => command, "result" => result).increment(1);
    }

    /// Record a scheduled retry and its delay.
    pub fn record_retry(command: &'static str, delay_seconds: f64) {
        counter!(RETRIES_SCHEDULED, "command" => command).increment(1);
        histogram!(RETRY_DELAY, "command" => command).record(delay_seconds);
    }

    /// Record an escalation.
    pub fn record_escalation(command: &'static str) {
        counter!(ESCALATIONS, "command" => command).increment(1);
    }

    /// Record a secondary message that was not published.
    pub fn record_best_effort_failure(message: &'static str) {
        counter!(BEST_EFFORT_FAILURES, "message" => message).increment(1);
    }
}
