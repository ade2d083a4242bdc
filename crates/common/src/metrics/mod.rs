//! Metrics and observability utilities
//!
//! Prometheus metric descriptions and recording helpers for the chat
//! pipeline. Everything goes through the `metrics` facade; the gateway
//! installs the exporter.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all FaqBot metrics
pub const METRICS_PREFIX: &str = "faqbot";

/// Histogram buckets for HTTP and retrieval latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.00,
];

/// Buckets for model calls and whole turns, which run much longer
pub const GENERATION_BUCKETS: &[f64] = &[
    0.100, 0.250, 0.500, 1.000, 2.000, 4.000, 8.000, 15.00, 30.00, 60.00,
];

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Turns
    describe_counter!(
        format!("{}_turns_total", METRICS_PREFIX),
        Unit::Count,
        "Chat turns by intent and outcome"
    );

    describe_histogram!(
        format!("{}_turn_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end turn latency including streaming"
    );

    describe_counter!(
        format!("{}_extraction_fallbacks_total", METRICS_PREFIX),
        Unit::Count,
        "Extraction replies that could not be parsed"
    );

    // Retrieval
    describe_histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Ranking latency in seconds"
    );

    describe_gauge!(
        format!("{}_retrieval_candidates", METRICS_PREFIX),
        Unit::Count,
        "Candidates kept by the last retrieval"
    );

    describe_counter!(
        format!("{}_retrieval_empty_total", METRICS_PREFIX),
        Unit::Count,
        "Retrievals that produced no relevant FAQ"
    );

    // Embeddings
    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    // Generation
    describe_counter!(
        format!("{}_generation_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Completion requests by mode and status"
    );

    describe_histogram!(
        format!("{}_generation_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Completion latency in seconds"
    );

    describe_counter!(
        format!("{}_streamed_tokens_total", METRICS_PREFIX),
        Unit::Count,
        "Tokens relayed to clients"
    );

    // Sessions
    describe_gauge!(
        format!("{}_active_sessions", METRICS_PREFIX),
        Unit::Count,
        "Sessions held in memory"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Record a finished turn. `outcome` is `completed`, `error` or `cancelled`.
pub fn record_turn(duration_secs: f64, intent: &str, outcome: &str) {
    counter!(
        format!("{}_turns_total", METRICS_PREFIX),
        "intent" => intent.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_turn_duration_seconds", METRICS_PREFIX),
        "intent" => intent.to_string()
    )
    .record(duration_secs);
}

pub fn record_extraction_fallback() {
    counter!(format!("{}_extraction_fallbacks_total", METRICS_PREFIX)).increment(1);
}

pub fn record_retrieval(duration_secs: f64, mode: &str, kept: usize) {
    histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .record(duration_secs);

    gauge!(
        format!("{}_retrieval_candidates", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .set(kept as f64);

    if kept == 0 {
        counter!(
            format!("{}_retrieval_empty_total", METRICS_PREFIX),
            "mode" => mode.to_string()
        )
        .increment(1);
    }
}

pub fn record_embedding(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
    }
}

/// `mode` is `structured` or `stream`
pub fn record_generation(duration_secs: f64, mode: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_generation_requests_total", METRICS_PREFIX),
        "mode" => mode.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_generation_duration_seconds", METRICS_PREFIX),
        "mode" => mode.to_string()
    )
    .record(duration_secs);
}

pub fn record_streamed_tokens(count: usize) {
    counter!(format!("{}_streamed_tokens_total", METRICS_PREFIX)).increment(count as u64);
}

pub fn set_active_sessions(count: usize) {
    gauge!(format!("{}_active_sessions", METRICS_PREFIX)).set(count as f64);
}
