// Prometheus metrics for the HTTP surface
use lazy_static::lazy_static;
use prometheus::{register_int_counter_vec, Encoder, IntCounterVec, TextEncoder};

lazy_static! {
    pub static ref JOBS_QUEUED: IntCounterVec = register_int_counter_vec!(
        "codeclass_jobs_queued_total",
        "Grading jobs pushed onto a language queue",
        &["mode", "language"]
    )
    .expect("metric can be registered");
    pub static ref REQUESTS_REJECTED: IntCounterVec = register_int_counter_vec!(
        "codeclass_requests_rejected_total",
        "Requests refused before queueing",
        &["reason"]
    )
    .expect("metric can be registered");
}

pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}
