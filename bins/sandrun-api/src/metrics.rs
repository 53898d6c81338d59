// Prometheus metrics for the API, exposed on GET /metrics

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder, HistogramVec, IntCounter,
    IntCounterVec, TextEncoder,
};

lazy_static! {
    /// Accepted submissions, labelled `queued` or `direct`
    pub static ref SUBMISSIONS: IntCounterVec = register_int_counter_vec!(
        "sandrun_submissions_total",
        "Accepted code submissions by execution mode",
        &["mode"]
    )
    .expect("metric can be registered");

    /// Requests refused before execution, labelled by failure kind
    pub static ref REJECTIONS: IntCounterVec = register_int_counter_vec!(
        "sandrun_rejections_total",
        "Submissions rejected before execution",
        &["reason"]
    )
    .expect("metric can be registered");

    /// Submissions executed inline because the queue was unreachable
    pub static ref QUEUE_FALLBACKS: IntCounter = register_int_counter!(
        "sandrun_queue_fallbacks_total",
        "Submissions executed directly because the job queue was unavailable"
    )
    .expect("metric can be registered");

    pub static ref DIRECT_EXECUTION_SECONDS: HistogramVec = register_histogram_vec!(
        "sandrun_direct_execution_seconds",
        "Latency of inline executions",
        &["language", "status"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("metric can be registered");
}

/// Render every registered metric in the text exposition format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
