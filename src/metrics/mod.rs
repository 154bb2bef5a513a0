//! Prometheus metrics for the judgeworks coordinator
//!
//! This module tracks:
//! - Workers: connected workers, free slots, protocol violations
//! - Jobs: queue depth, dispatches, completions by result code, permanent
//!   failures, retries
//! - RPC: request counts and latency by endpoint
//!
//! # Usage
//!
//! Call `init_metrics()` at startup to register all metrics. Until then
//! (or if registration fails) every recording function is a no-op.

use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Encoder, Gauge, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all coordinator metrics
struct CoordinatorMetrics {
    connected_workers: Gauge,
    free_slots: Gauge,
    queue_depth: Gauge,
    jobs_dispatched: Counter,
    jobs_completed: CounterVec,
    jobs_failed: Counter,
    jobs_retried: Counter,
    protocol_violations: CounterVec,
    api_requests: CounterVec,
    api_duration: HistogramVec,
}

/// Global storage for coordinator metrics
static COORDINATOR_METRICS: OnceLock<CoordinatorMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers anything.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let coordinator = CoordinatorMetrics {
        connected_workers: register_gauge!(
            "judgeworks_connected_workers",
            "Number of workers currently registered"
        )?,
        free_slots: register_gauge!(
            "judgeworks_free_slots",
            "Free job slots across active workers"
        )?,
        queue_depth: register_gauge!(
            "judgeworks_queue_depth",
            "Number of jobs waiting in the pending queue"
        )?,
        jobs_dispatched: register_counter!(
            "judgeworks_jobs_dispatched_total",
            "Total jobs handed to workers"
        )?,
        jobs_completed: register_counter_vec!(
            "judgeworks_jobs_completed_total",
            "Total job results recorded, by result code",
            &["result_code"]
        )?,
        jobs_failed: register_counter!(
            "judgeworks_jobs_failed_total",
            "Total jobs failed permanently after exhausting retries"
        )?,
        jobs_retried: register_counter!(
            "judgeworks_jobs_retried_total",
            "Total jobs requeued after losing their worker"
        )?,
        protocol_violations: register_counter_vec!(
            "judgeworks_protocol_violations_total",
            "Total worker connections dropped for protocol violations",
            &["kind"]
        )?,
        api_requests: register_counter_vec!(
            "judgeworks_api_requests_total",
            "Total RPC requests by endpoint and status",
            &["endpoint", "status"]
        )?,
        api_duration: register_histogram_vec!(
            "judgeworks_api_request_duration_seconds",
            "RPC request duration in seconds",
            &["endpoint"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
        )?,
    };

    COORDINATOR_METRICS
        .set(coordinator)
        .map_err(|_| "Coordinator metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    COORDINATOR_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Update worker and queue gauges
pub fn update_capacity(connected_workers: usize, free_slots: u64, queue_depth: usize) {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.connected_workers.set(connected_workers as f64);
        m.free_slots.set(free_slots as f64);
        m.queue_depth.set(queue_depth as f64);
    }
}

/// Record a job handed to a worker
pub fn record_dispatch() {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.jobs_dispatched.inc();
    }
}

/// Record a job result
pub fn record_completion(result_code: &str) {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.jobs_completed.with_label_values(&[result_code]).inc();
    }
}

/// Record a permanent job failure
pub fn record_permanent_failure() {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.jobs_failed.inc();
    }
}

/// Record a requeue after worker loss
pub fn record_retry() {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.jobs_retried.inc();
    }
}

/// Record a dropped worker connection
pub fn record_protocol_violation(kind: &str) {
    if let Some(m) = COORDINATOR_METRICS.get() {
        m.protocol_violations.with_label_values(&[kind]).inc();
    }
}

/// Record API request
pub fn record_api_request(endpoint: &str, status: u16, duration_secs: f64) {
    let Some(m) = COORDINATOR_METRICS.get() else {
        return;
    };

    let status_str = status.to_string();
    m.api_requests
        .with_label_values(&[endpoint, &status_str])
        .inc();
    m.api_duration
        .with_label_values(&[endpoint])
        .observe(duration_secs);
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ensure_metrics_initialized() {
        let _ = init_metrics();
    }

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
        // Idempotent
        assert!(init_metrics().is_ok());
    }

    #[test]
    fn test_encode_metrics() {
        ensure_metrics_initialized();
        record_dispatch();
        let text = encode_metrics().unwrap();
        assert!(text.contains("judgeworks_") || text.is_empty());
    }

    #[test]
    fn test_recording_does_not_panic() {
        ensure_metrics_initialized();
        update_capacity(2, 3, 10);
        record_completion("OK");
        record_completion("WA");
        record_permanent_failure();
        record_retry();
        record_protocol_violation("malformed");
        record_api_request("/api/batches", 202, 0.002);
    }
}
