//! Health check and metrics handlers

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: CheckResult,
    pub pgvector: CheckResult,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CheckResult {
    fn up(latency_ms: Option<u64>) -> Self {
        Self {
            status: "up".to_string(),
            latency_ms,
            error: None,
        }
    }

    fn down(error: impl Into<String>) -> Self {
        Self {
            status: "down".to_string(),
            latency_ms: None,
            error: Some(error.into()),
        }
    }

    fn skipped() -> Self {
        Self {
            status: "in_memory".to_string(),
            latency_ms: None,
            error: None,
        }
    }

    fn is_ok(&self) -> bool {
        self.status != "down"
    }
}

/// Liveness probe - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: faqbot_common::VERSION,
    })
}

/// Readiness probe - database connectivity and the pgvector extension
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let (database, pgvector) = match &state.db {
        None => (CheckResult::skipped(), CheckResult::skipped()),
        Some(db) => {
            let start = std::time::Instant::now();
            match db.ping().await {
                Err(e) => (CheckResult::down(e.to_string()), CheckResult::down("database unreachable")),
                Ok(()) => {
                    let database = CheckResult::up(Some(start.elapsed().as_millis() as u64));
                    let pgvector = match db.pgvector_enabled().await {
                        Ok(true) => CheckResult::up(None),
                        Ok(false) => CheckResult::down("extension not installed"),
                        Err(e) => CheckResult::down(e.to_string()),
                    };
                    (database, pgvector)
                }
            }
        }
    };

    let all_healthy = database.is_ok() && pgvector.is_ok();
    let status = if all_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyResponse {
            status: if all_healthy { "ready" } else { "not_ready" }.to_string(),
            checks: HealthChecks { database, pgvector },
        }),
    )
}

/// Prometheus exposition
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics exporter not installed".to_string()),
    }
}
