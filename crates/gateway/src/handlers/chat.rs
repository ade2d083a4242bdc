//! Streaming chat handlers
//!
//! `POST /faq/chatbot` and `POST /ask` stream plain token frames;
//! `POST /chatbot/ask` streams JSON frames for the multi-intent path.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderName},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use faqbot_common::{
    context::{StreamEvent, DONE_SENTINEL},
    errors::{AppError, Result},
    session::ConversationContext,
};
use futures::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use validator::Validate;

use crate::AppState;

const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// FAQ question for a server-held session
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub question: String,

    #[serde(default)]
    #[validate(length(max = 128))]
    pub session_id: String,
}

/// Question plus the caller-held conversation context
#[derive(Debug, Deserialize, Validate)]
pub struct ConverseRequest {
    #[serde(default)]
    #[validate(length(max = 2000))]
    pub question: String,

    #[serde(default)]
    pub context: ConversationContext,
}

fn required<'a>(value: &'a str, field: &str) -> Result<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AppError::MissingField {
            field: field.to_string(),
        });
    }
    Ok(value)
}

fn validate(request: &impl Validate) -> Result<()> {
    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })
}

fn body<T>(payload: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    payload.map(|Json(request)| request).map_err(|e| AppError::InvalidFormat {
        message: e.body_text(),
    })
}

/// Stream a FAQ answer as `data: <token>` frames ending in `data: [DONE]`
pub async fn ask(
    State(state): State<AppState>,
    payload: std::result::Result<Json<AskRequest>, JsonRejection>,
) -> Result<Response> {
    let request = body(payload)?;
    let question = required(&request.question, "question")?;
    let session_id = required(&request.session_id, "sessionId")?;
    validate(&request)?;

    tracing::info!(session_id = %session_id, "FAQ question received");
    let events = state.engine.ask(session_id, question);
    Ok(sse_response(frames(events, plain_event)))
}

/// Stream a routed answer as JSON frames, context first
pub async fn converse(
    State(state): State<AppState>,
    payload: std::result::Result<Json<ConverseRequest>, JsonRejection>,
) -> Result<Response> {
    let request = body(payload)?;
    let question = required(&request.question, "question")?.to_string();
    validate(&request)?;

    let events = state.engine.converse(question, request.context);
    Ok(sse_response(frames(events, json_event)))
}

fn frames(
    events: mpsc::Receiver<StreamEvent>,
    to_frame: fn(StreamEvent) -> Option<Event>,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    ReceiverStream::new(events).filter_map(move |event| to_frame(event).map(Ok))
}

fn sse_response<S>(stream: S) -> Response
where
    S: Stream<Item = std::result::Result<Event, Infallible>> + Send + 'static,
{
    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
            (X_ACCEL_BUFFERING, "no"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

// SSE field values may not contain carriage returns
fn sse_data(text: &str) -> String {
    text.replace('\r', "")
}

fn plain_event(event: StreamEvent) -> Option<Event> {
    match event {
        StreamEvent::Token { content } => Some(Event::default().data(sse_data(&content))),
        StreamEvent::Error { message, .. } => Some(Event::default().event("error").data(sse_data(&message))),
        StreamEvent::Done => Some(Event::default().data(DONE_SENTINEL)),
        StreamEvent::Context { .. } | StreamEvent::RealtimeData { .. } => None,
    }
}

fn json_event(event: StreamEvent) -> Option<Event> {
    Some(Event::default().data(event.to_json_frame()))
}

#[cfg(test)]
mod tests {
    use crate::test_support::{faq, router};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use faqbot_common::llm::MockCompleter;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_body(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn data_frames(body: &str) -> Vec<String> {
        body.split("\n\n")
            .filter_map(|frame| frame.strip_prefix("data: "))
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_missing_session_id_is_rejected() {
        let app = router(Arc::new(MockCompleter::new()), Vec::new());
        let response = app
            .oneshot(post("/ask", json!({"question": "Can kids fly?"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_str(&read_body(response).await).unwrap();
        assert_eq!(body["error"]["code"], "MISSING_FIELD");
        assert_eq!(body["error"]["details"]["field"], "sessionId");
    }

    #[tokio::test]
    async fn test_blank_question_is_rejected() {
        let app = router(Arc::new(MockCompleter::new()), Vec::new());
        let response = app
            .oneshot(post("/faq/chatbot", json!({"question": "  ", "sessionId": "s1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected() {
        let app = router(Arc::new(MockCompleter::new()), Vec::new());
        let request = Request::builder()
            .method("POST")
            .uri("/ask")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_empty_corpus_streams_fallback() {
        let app = router(Arc::new(MockCompleter::new()), Vec::new());
        let response = app
            .oneshot(post("/ask", json!({"question": "Gift cards?", "sessionId": "s1"})))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert!(headers["content-type"].to_str().unwrap().starts_with("text/event-stream"));
        assert_eq!(headers["cache-control"], "no-cache");
        assert_eq!(headers["x-accel-buffering"], "no");

        let body = read_body(response).await;
        assert_eq!(
            data_frames(&body),
            vec![
                "I couldn't find this information in our knowledge base.".to_string(),
                "[DONE]".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_tokens_stream_in_order() {
        let mock = Arc::new(MockCompleter::new());
        mock.push_tokens(["Children ", "over 2 ", "can join."]);
        let app = router(
            mock,
            vec![faq(1, "Can children join the seaplane tour?", "Children over 2 can join.")],
        );

        let response = app
            .oneshot(post("/faq/chatbot", json!({"question": "Can kids join?", "sessionId": "s1"})))
            .await
            .unwrap();
        let body = read_body(response).await;
        assert_eq!(data_frames(&body), vec!["Children ", "over 2 ", "can join.", "[DONE]"]);
    }

    #[tokio::test]
    async fn test_generation_error_event() {
        let mock = Arc::new(MockCompleter::new());
        mock.push_stream_error(faqbot_common::AppError::GenerationError {
            message: "upstream failed".into(),
        });
        let app = router(mock, vec![faq(1, "Refunds?", "Up to 48 hours before.")]);

        let response = app
            .oneshot(post("/ask", json!({"question": "Refunds?", "sessionId": "s1"})))
            .await
            .unwrap();
        let body = read_body(response).await;
        assert!(body.contains("event: error\ndata: Generation service error: upstream failed\n\n"));
        assert!(body.ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn test_converse_leads_with_context() {
        let mock = Arc::new(MockCompleter::new());
        mock.push_reply(
            json!({
                "intent": "general",
                "corrected_question": "Hello!",
                "keywords": ["hello"]
            })
            .to_string(),
        );
        mock.push_tokens(["Hi ", "there."]);
        let app = router(mock, Vec::new());

        let response = app
            .oneshot(post(
                "/chatbot/ask",
                json!({"question": "hello", "context": {"keywords": ["seaplane"], "enquiryHistory": [], "json": {}}}),
            ))
            .await
            .unwrap();
        let body = read_body(response).await;
        let frames = data_frames(&body);

        let first: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(first["type"], "context");
        assert_eq!(first["context"]["keywords"], json!(["seaplane", "hello"]));

        let chunks: Vec<Value> = frames[1..3].iter().map(|f| serde_json::from_str(f).unwrap()).collect();
        assert_eq!(chunks[0], json!({"type": "chunk", "content": "Hi "}));
        assert_eq!(chunks[1], json!({"type": "chunk", "content": "there."}));
        assert_eq!(frames.last().map(String::as_str), Some("[DONE]"));
    }

    #[tokio::test]
    async fn test_converse_requires_question() {
        let app = router(Arc::new(MockCompleter::new()), Vec::new());
        let response = app
            .oneshot(post("/chatbot/ask", json!({"context": {}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
