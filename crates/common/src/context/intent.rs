//! Intent routing for the multi-intent endpoint
//!
//! Provides:
//! - `Intent` classification labels
//! - `IntentRouter` dispatching a classified turn to the FAQ, realtime or
//!   general path

use super::events::{EventSink, StreamEvent};
use super::extractor::{apply_extraction, ContextExtractor};
use super::query_builder::{simplify_rows, QueryBuilder};
use super::retriever::Retriever;
use super::streamer::{AnswerPrompt, AnswerStreamer};
use crate::config::RealtimeConfig;
use crate::db::RecordStore;
use crate::errors::Result;
use crate::session::SessionState;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    #[default]
    Faq,
    Realtime,
    General,
}

impl Intent {
    /// Case-insensitive; unknown labels are `None`
    pub fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "faq" => Some(Self::Faq),
            "realtime" | "real_time" | "real-time" => Some(Self::Realtime),
            "general" => Some(Self::General),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Faq => "faq",
            Self::Realtime => "realtime",
            Self::General => "general",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a routed turn
#[derive(Debug, Clone, PartialEq)]
pub struct RoutedTurn {
    pub intent: Intent,
    /// Text recorded as the turn's answer
    pub answer: String,
}

pub struct IntentRouter {
    extractor: Arc<ContextExtractor>,
    retriever: Arc<Retriever>,
    streamer: Arc<AnswerStreamer>,
    query_builder: QueryBuilder,
    records: Arc<dyn RecordStore>,
    realtime: RealtimeConfig,
    history_turns: usize,
}

impl IntentRouter {
    pub fn new(
        extractor: Arc<ContextExtractor>,
        retriever: Arc<Retriever>,
        streamer: Arc<AnswerStreamer>,
        query_builder: QueryBuilder,
        records: Arc<dyn RecordStore>,
        realtime: RealtimeConfig,
        history_turns: usize,
    ) -> Self {
        Self {
            extractor,
            retriever,
            streamer,
            query_builder,
            records,
            realtime,
            history_turns,
        }
    }

    /// Sample rows of every configured collection. Failing collections are
    /// left empty.
    pub async fn prefetch_samples(&self) -> Map<String, Value> {
        let fetches = self.realtime.collections.iter().map(|collection| async move {
            let rows = match self.records.sample(collection, self.realtime.sample_size).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(collection = %collection, error = %e, "Failed to sample collection");
                    Vec::new()
                }
            };
            (collection.clone(), Value::Array(rows))
        });
        futures::future::join_all(fetches).await.into_iter().collect()
    }

    /// Classify, update the state, emit the context frame and dispatch.
    ///
    /// The sample prefetch runs concurrently with classification.
    #[instrument(skip(self, state, sink), fields(session_id = %state.session_id))]
    pub async fn route(&self, state: &mut SessionState, question: &str, sink: &EventSink) -> Result<RoutedTurn> {
        let (extraction, samples) = tokio::join!(
            self.extractor.classify(state, question, &self.realtime.collections),
            self.prefetch_samples()
        );
        apply_extraction(state, &extraction);
        sink.send(StreamEvent::Context {
            context: state.to_context(),
        })
        .await?;

        let intent = extraction.intent.unwrap_or_default();
        let question = extraction.corrected_question.as_str();
        info!(intent = %intent, "Routing turn");

        let answer = match intent {
            Intent::Faq => {
                let retrieved = self
                    .retriever
                    .retrieve(question, state.facts.active_enquiry(), &extraction.keywords)
                    .await?;
                let facts = state.facts.as_json();
                let prompt = AnswerPrompt {
                    context_block: &retrieved.block,
                    last_question: state.last_question.as_deref(),
                    last_answer: state.last_answer.as_deref(),
                    facts: &facts,
                    question,
                };
                self.streamer.stream_faq(prompt, sink).await?
            }
            Intent::Realtime => {
                let descriptor = self.query_builder.build(question, &samples).await?;
                let rows = self.records.query(&descriptor).await?;
                let data = simplify_rows(rows, &self.realtime.id_field);
                debug!(collection = %descriptor.collection, rows = data.len(), "Realtime query complete");

                let summary = format!("Returned {} record(s) from {}.", data.len(), descriptor.collection);
                sink.send(StreamEvent::RealtimeData { data }).await?;
                summary
            }
            Intent::General => {
                self.streamer
                    .stream_general(state, question, self.history_turns, sink)
                    .await?
            }
        };

        Ok(RoutedTurn { intent, answer })
    }
}
