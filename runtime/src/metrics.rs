//! Prometheus metrics for the voucher engine.
//!
//! Recorded by the engine operations:
//! - Batch issuance (vouchers inserted, code collisions, latency)
//! - Redemption outcomes by error code
//! - Lazy expiry and administrative disables
//! - Transaction conflict retries
//!
//! # Example
//!
//! ```rust,no_run
//! use voucher_runtime::metrics::MetricsServer;
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
use std::time::Duration;
use thiserror::Error;
use voucher_core::VoucherError;

pub use metrics::{counter, histogram};

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

/// Prometheus metrics exporter.
///
/// Installs the global recorder and renders the scrape payload. Serving
/// `render()` over HTTP is left to the embedding service.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address the embedding service exposes `/metrics` on
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe the voucher metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// A recorder that is already installed (e.g., by another test) is
    /// tolerated: metrics keep flowing to it and `render()` returns `None`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!(addr = %self.addr, "Voucher metrics recorder installed");
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

    /// Address metrics are advertised on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    // Issuance
    describe_counter!("voucher_batches_issued_total", "Total number of batches issued");
    describe_counter!(
        "voucher_vouchers_issued_total",
        "Total number of vouchers inserted by batch issuance"
    );
    describe_counter!(
        "voucher_code_collisions_total",
        "Generated codes discarded because they collided"
    );
    describe_counter!(
        "voucher_issue_failures_total",
        "Batch issuances that failed, labelled by error code"
    );
    describe_histogram!(
        "voucher_issue_duration_seconds",
        "Time taken to issue a batch"
    );

    // Redemption
    describe_counter!("voucher_redemptions_total", "Successful voucher redemptions");
    describe_counter!(
        "voucher_redemption_failures_total",
        "Rejected voucher redemptions, labelled by error code"
    );
    describe_histogram!(
        "voucher_redeem_duration_seconds",
        "Time taken to redeem a voucher"
    );

    // Lifecycle
    describe_counter!(
        "voucher_expired_total",
        "Vouchers moved to expired during redemption"
    );
    describe_counter!("voucher_disabled_total", "Vouchers disabled by an operator");
    describe_counter!("voucher_batches_deleted_total", "Batches soft-deleted");

    // Retry
    describe_counter!("voucher_retry_attempts_total", "Transaction conflict retries");
    describe_counter!(
        "voucher_retry_successes_total",
        "Operations that succeeded after at least one retry"
    );
    describe_counter!(
        "voucher_retry_exhausted_total",
        "Operations that failed after exhausting retries"
    );
}

/// Voucher engine metrics recorder.
pub struct VoucherMetrics;

impl VoucherMetrics {
    /// Record a successful batch issuance.
    pub fn record_issue(vouchers: u64, collisions: usize, duration: Duration) {
        counter!("voucher_batches_issued_total").increment(1);
        counter!("voucher_vouchers_issued_total").increment(vouchers);
        counter!("voucher_code_collisions_total").increment(collisions as u64);
        histogram!("voucher_issue_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed batch issuance.
    pub fn record_issue_failure(err: &VoucherError) {
        counter!("voucher_issue_failures_total", "code" => err.code()).increment(1);
    }

    /// Record a successful redemption.
    pub fn record_redeem(duration: Duration) {
        counter!("voucher_redemptions_total").increment(1);
        histogram!("voucher_redeem_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a rejected redemption.
    pub fn record_redeem_failure(err: &VoucherError) {
        counter!("voucher_redemption_failures_total", "code" => err.code()).increment(1);
    }

    /// Record a lazy expiry.
    pub fn record_expired() {
        counter!("voucher_expired_total").increment(1);
    }

    /// Record an administrative disable.
    pub fn record_disabled() {
        counter!("voucher_disabled_total").increment(1);
    }

    /// Record a batch deletion.
    pub fn record_batch_deleted() {
        counter!("voucher_batches_deleted_total").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("voucher_retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("voucher_retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("voucher_retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert_eq!(server.addr(), addr);
    }

    #[test]
    fn test_voucher_metrics_render() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        VoucherMetrics::record_issue(100, 2, Duration::from_millis(40));
        VoucherMetrics::record_redeem(Duration::from_millis(5));
        VoucherMetrics::record_redeem_failure(&VoucherError::VoucherExpired);
        RetryMetrics::record_attempt();

        // Another test may have installed the recorder first.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("voucher_vouchers_issued_total"));
            assert!(rendered.contains("voucher_redemptions_total"));
            assert!(rendered.contains("VOUCHER_EXPIRED"));
            assert!(rendered.contains("voucher_retry_attempts_total"));
        }
    }
}
