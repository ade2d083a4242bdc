//! Session inspection and eviction handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use faqbot_common::{
    errors::{AppError, Result},
    session::SessionState,
};

use crate::AppState;

/// Current state of a session; 409 while a turn holds it
pub async fn get_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<SessionState>> {
    let session = state
        .sessions
        .try_get(&id)
        .await?
        .ok_or_else(|| AppError::SessionNotFound { id: id.clone() })?;
    Ok(Json(session))
}

/// Drop a session and everything it remembers
pub async fn delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode> {
    if !state.sessions.evict(&id).await {
        return Err(AppError::SessionNotFound { id });
    }

    tracing::info!(session_id = %id, "Session evicted");
    faqbot_common::metrics::set_active_sessions(state.sessions.len().await);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use crate::test_support::state;
    use crate::create_router;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use faqbot_common::llm::MockCompleter;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn request(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let app = create_router(state(Arc::new(MockCompleter::new()), Vec::new()));
        let response = app.oneshot(request("GET", "/sessions/nope")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_inspect_during_turn_is_conflict() {
        let app_state = state(Arc::new(MockCompleter::new()), Vec::new());
        let turn = app_state.sessions.lock("s1").await;
        let app = create_router(app_state.clone());

        let response = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            app.clone().oneshot(request("GET", "/sessions/s1")),
        )
        .await
        .expect("inspection waited on the turn")
        .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "SESSION_BUSY");

        drop(turn);
        let response = app.oneshot(request("GET", "/sessions/s1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_inspect_and_evict() {
        let app_state = state(Arc::new(MockCompleter::new()), Vec::new());
        app_state
            .sessions
            .merge_facts("s1", json!({"child_count": 2}).as_object().unwrap())
            .await;
        let app = create_router(app_state);

        let response = app.clone().oneshot(request("GET", "/sessions/s1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["sessionId"], "s1");
        assert_eq!(body["contextJson"]["child_count"], 2);

        let response = app.clone().oneshot(request("DELETE", "/sessions/s1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app.oneshot(request("GET", "/sessions/s1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
