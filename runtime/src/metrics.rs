//! Prometheus metrics for the coordination components.
//!
//! Every crate records through the recorder types below (`LockMetrics`,
//! `DelayMetrics` and so on). Until [`MetricsServer::start`] installs the
//! Prometheus recorder the `metrics` macros discard what they are given,
//! so only the binary decides whether anything is exported.
//!
//! # Example
//!
//! ```rust,no_run
//! use seatlock_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! println!("{}", server.render().unwrap_or_default());
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Failure to set up the Prometheus recorder.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Histogram buckets were rejected
    #[error("invalid histogram buckets: {0}")]
    Build(String),
    /// Another recorder could not be replaced
    #[error("cannot install the Prometheus recorder: {0}")]
    Install(String),
}

/// Buckets for every `*_duration_seconds` histogram: lock waits run from
/// a few milliseconds to the configured wait, delivery lag up to seconds.
const DURATION_BUCKETS: &[f64] = &[0.002, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 3.0, 10.0, 30.0];

/// Prometheus metrics recorder installation.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Exporter meant to be scraped on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe the seatlock metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// [`MetricsError`] when the recorder cannot be built or installed. A
    /// recorder installed earlier in the process is left in place.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        describe_all();

        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Suffix("duration_seconds".into()), DURATION_BUCKETS)
            .map_err(|error| MetricsError::Build(error.to_string()))?;

        let handle = match recorder.install_recorder() {
            Ok(handle) => handle,
            Err(error) if error.to_string().contains("already initialized") => {
                tracing::debug!("Metrics recorder already installed");
                return Ok(());
            }
            Err(error) => return Err(MetricsError::Install(error.to_string())),
        };
        tracing::info!(addr = %self.addr, "Metrics recorder installed");
        self.handle = Some(handle);
        Ok(())
    }

    /// Address the exporter is meant to be scraped on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current metrics in the Prometheus text format, or `None` when another
    /// recorder was already installed.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn describe_all() {
    // Cluster locks
    describe_counter!("seatlock_lock_acquired_total", "Cluster locks acquired");
    describe_counter!("seatlock_lock_timeout_total", "Cluster lock waits that timed out");
    describe_counter!("seatlock_lock_released_total", "Cluster locks released");
    describe_counter!("seatlock_lock_misuse_total", "Unlock attempts by a non-holder");
    describe_counter!(
        "seatlock_lock_fallback_total",
        "Timeout policies applied by the service lock wrapper"
    );
    describe_histogram!("seatlock_lock_wait_duration_seconds", "Time spent waiting for cluster locks");

    // Local locks
    describe_gauge!("seatlock_local_locks", "Mutexes held in the local lock cache");
    describe_counter!("seatlock_local_locks_evicted_total", "Idle local mutexes evicted");

    // Delay dispatcher
    describe_counter!("seatlock_delay_offered_total", "Items offered to delay queues");
    describe_counter!("seatlock_delay_delivered_total", "Items handed to delay handlers");
    describe_counter!("seatlock_delay_handler_errors_total", "Delay handler failures");
    describe_counter!("seatlock_delay_redelivered_total", "Items delivered more than once");
    describe_histogram!("seatlock_delay_lag_duration_seconds", "Delivery time minus not-before time");

    // Admission
    describe_counter!("seatlock_gate_decisions_total", "Admission gate decisions by outcome");

    // Retry
    describe_counter!("seatlock_retry_attempts_total", "Retried store operations");
    describe_counter!("seatlock_retry_exhausted_total", "Store operations that ran out of retries");
}

/// Cluster lock metrics recorder.
pub struct LockMetrics;

impl LockMetrics {
    /// Record a successful acquisition after `waited`.
    pub fn record_acquired(kind: &'static str, waited: Duration) {
        counter!("seatlock_lock_acquired_total", "kind" => kind).increment(1);
        histogram!("seatlock_lock_wait_duration_seconds", "kind" => kind).record(waited.as_secs_f64());
    }

    /// Record a wait that ran out of time.
    pub fn record_timeout(kind: &'static str) {
        counter!("seatlock_lock_timeout_total", "kind" => kind).increment(1);
    }

    /// Record a release.
    pub fn record_released(kind: &'static str) {
        counter!("seatlock_lock_released_total", "kind" => kind).increment(1);
    }

    /// Record an unlock by a non-holder.
    pub fn record_misuse(kind: &'static str) {
        counter!("seatlock_lock_misuse_total", "kind" => kind).increment(1);
    }

    /// Record a timeout policy being applied.
    pub fn record_fallback(policy: &'static str) {
        counter!("seatlock_lock_fallback_total", "policy" => policy).increment(1);
    }
}

/// Local lock cache metrics recorder.
pub struct LocalLockMetrics;

impl LocalLockMetrics {
    /// Record the current cache size.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_size(size: usize) {
        gauge!("seatlock_local_locks").set(size as f64);
    }

    /// Record evicted entries.
    pub fn record_evicted(count: usize) {
        counter!("seatlock_local_locks_evicted_total").increment(count as u64);
    }
}

/// Delay dispatcher metrics recorder.
pub struct DelayMetrics;

impl DelayMetrics {
    /// Record an offer.
    pub fn record_offer(topic: &str) {
        counter!("seatlock_delay_offered_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a delivery, `lag` after its not-before time.
    pub fn record_delivery(topic: &str, attempt: u32, lag: Duration) {
        counter!("seatlock_delay_delivered_total", "topic" => topic.to_string()).increment(1);
        if attempt > 1 {
            counter!("seatlock_delay_redelivered_total", "topic" => topic.to_string()).increment(1);
        }
        histogram!("seatlock_delay_lag_duration_seconds").record(lag.as_secs_f64());
    }

    /// Record a handler failure.
    pub fn record_handler_error(topic: &str) {
        counter!("seatlock_delay_handler_errors_total", "topic" => topic.to_string()).increment(1);
    }
}

/// Admission gate metrics recorder.
pub struct GateMetrics;

impl GateMetrics {
    /// Record a decision.
    pub fn record_decision(gate: &'static str, outcome: &'static str) {
        counter!("seatlock_gate_decisions_total", "gate" => gate, "outcome" => outcome).increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("seatlock_retry_attempts_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("seatlock_retry_exhausted_total").increment(1);
    }
}
