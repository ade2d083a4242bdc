//! HTTP middleware

pub mod rate_limit;

use axum::{extract::MatchedPath, extract::Request, middleware::Next, response::Response};
use faqbot_common::metrics::RequestMetrics;

/// Count and time every request by matched route
pub async fn track_metrics(request: Request, next: Next) -> Response {
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let metrics = RequestMetrics::start(request.method().as_str(), &endpoint);

    let response = next.run(request).await;
    metrics.finish(response.status().as_u16());
    response
}
