//! Events emitted while a turn streams

use crate::errors::{AppError, ErrorCode, Result};
use crate::session::ConversationContext;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

/// Terminal frame payload
pub const DONE_SENTINEL: &str = "[DONE]";

/// One unit of streamed output, in emission order.
///
/// Serialized with a `type` tag for the JSON-framed endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Updated conversation context, always first on the multi-intent path
    Context { context: ConversationContext },

    #[serde(rename = "chunk")]
    Token { content: String },

    /// Rows from a realtime query, sent as a single event
    RealtimeData { data: Vec<Value> },

    Error { code: ErrorCode, message: String },

    /// Always last
    Done,
}

impl StreamEvent {
    pub fn token(content: impl Into<String>) -> Self {
        Self::Token { content: content.into() }
    }

    pub fn error(error: &AppError) -> Self {
        Self::Error {
            code: error.code(),
            message: error.to_string(),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    /// Payload for the JSON-framed endpoint; `Done` is the bare sentinel
    pub fn to_json_frame(&self) -> String {
        match self {
            Self::Done => DONE_SENTINEL.to_string(),
            other => serde_json::to_string(other).unwrap_or_else(|e| {
                format!(r#"{{"type":"error","code":"SERIALIZATION_ERROR","message":"{}"}}"#, e)
            }),
        }
    }
}

/// Sending half of a turn's event channel
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl EventSink {
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    /// Deliver an event; `Cancelled` once the client has gone away
    pub async fn send(&self, event: StreamEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| AppError::Cancelled)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the receiver is dropped
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
