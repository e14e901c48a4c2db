//! Prometheus metrics for the automation engine
//!
//! Provides observability metrics for production monitoring:
//! - Admission outcomes and capacity rejections
//! - Execution completions by status
//! - Sub-action retry behavior
//! - Dropped external events
//!
//! Recording is infallible; a metrics failure never affects execution
//! correctness, and the HTTP server runs in its own task.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_counter, register_histogram_vec, Counter, CounterVec,
    Encoder, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use std::time::Duration;
use warp::Filter;

lazy_static! {
    /// Run submissions by admission outcome
    pub static ref SUBMISSIONS_TOTAL: CounterVec = register_counter_vec!(
        "streamrig_submissions_total",
        "Total number of run submissions",
        &["outcome"]  // "accepted", "queued", "rejected"
    )
    .unwrap();

    /// Queued runs dropped by the backpressure policy
    pub static ref CAPACITY_REJECTIONS_TOTAL: Counter = register_counter!(
        "streamrig_capacity_rejections_total",
        "Total number of runs dropped because the per-action queue was full"
    )
    .unwrap();

    /// Execution completions by terminal status
    pub static ref EXECUTIONS_TOTAL: CounterVec = register_counter_vec!(
        "streamrig_executions_total",
        "Total number of completed executions",
        &["status"]  // "succeeded", "failed", "cancelled"
    )
    .unwrap();

    /// Execution duration histogram
    pub static ref EXECUTION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "streamrig_execution_duration_seconds",
        "Action execution duration in seconds",
        &["status"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    /// Sub-action retry attempts
    pub static ref SUB_ACTION_RETRIES_TOTAL: CounterVec = register_counter_vec!(
        "streamrig_sub_action_retries_total",
        "Total number of sub-action retry attempts",
        &["kind", "reason"]
    )
    .unwrap();

    /// Retry delay histogram (seconds).
    pub static ref RETRY_DELAY_SECONDS: HistogramVec = register_histogram_vec!(
        "streamrig_retry_delay_seconds",
        "Delay applied before retrying a sub-action",
        &["kind", "reason"],
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
    )
    .unwrap();

    /// Malformed or unroutable external events
    pub static ref EVENTS_DROPPED_TOTAL: CounterVec = register_counter_vec!(
        "streamrig_events_dropped_total",
        "Total number of external events dropped before matching",
        &["source"]
    )
    .unwrap();
}

/// Start the Prometheus metrics HTTP server
///
/// Serves metrics on the specified address.
/// Returns a future that runs until cancelled
pub async fn start_metrics_server(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    eprintln!("[metrics] Starting Prometheus metrics server on {}", addr);

    // Create the /metrics route
    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .map(|| {
            let encoder = TextEncoder::new();
            let metric_families = prometheus::gather();
            let mut buffer = Vec::new();

            if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                eprintln!("[metrics] Error encoding metrics: {}", e);
                return warp::reply::with_status(
                    "Error encoding metrics".to_string(),
                    warp::http::StatusCode::INTERNAL_SERVER_ERROR,
                );
            }

            warp::reply::with_status(
                String::from_utf8_lossy(&buffer).to_string(),
                warp::http::StatusCode::OK,
            )
        });

    // Health check endpoint
    let health_route = warp::path("health")
        .and(warp::get())
        .map(|| warp::reply::with_status("OK", warp::http::StatusCode::OK));

    let routes = metrics_route.or(health_route);

    eprintln!("[metrics] Metrics available at http://{}/metrics", addr);

    warp::serve(routes).run(addr).await;

    Ok(())
}

/// Helper to record an admission outcome
pub fn record_admission(outcome: &str) {
    SUBMISSIONS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Helper to record a capacity rejection
pub fn record_capacity_rejection() {
    CAPACITY_REJECTIONS_TOTAL.inc();
}

/// Helper to record a completed execution
pub fn record_execution(status: &str, duration_secs: f64) {
    EXECUTIONS_TOTAL.with_label_values(&[status]).inc();
    EXECUTION_DURATION_SECONDS
        .with_label_values(&[status])
        .observe(duration_secs);
}

/// Helper to record sub-action retry behavior
pub fn record_sub_action_retry(kind: &str, reason: &str, delay: Duration) {
    SUB_ACTION_RETRIES_TOTAL
        .with_label_values(&[kind, reason])
        .inc();
    RETRY_DELAY_SECONDS
        .with_label_values(&[kind, reason])
        .observe(delay.as_secs_f64());
}

/// Helper to record a dropped external event
pub fn record_event_dropped(source: &str) {
    EVENTS_DROPPED_TOTAL.with_label_values(&[source]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        // Just verify that all metrics are properly registered
        // by accessing them without panicking
        let _ = &*SUBMISSIONS_TOTAL;
        let _ = &*CAPACITY_REJECTIONS_TOTAL;
        let _ = &*EXECUTIONS_TOTAL;
        let _ = &*EXECUTION_DURATION_SECONDS;
        let _ = &*SUB_ACTION_RETRIES_TOTAL;
        let _ = &*RETRY_DELAY_SECONDS;
        let _ = &*EVENTS_DROPPED_TOTAL;
    }

    #[test]
    fn test_capacity_rejection_counter() {
        let before = CAPACITY_REJECTIONS_TOTAL.get();
        record_capacity_rejection();
        assert_eq!(CAPACITY_REJECTIONS_TOTAL.get(), before + 1.0);
    }

    #[test]
    fn test_recording_helpers_do_not_panic() {
        record_admission("accepted");
        record_execution("succeeded", 0.05);
        record_sub_action_retry("http_call", "timeout", Duration::from_millis(250));
        record_event_dropped("chat");
    }
}
