//! Chat engine
//!
//! Wires extraction, retrieval, answer streaming and intent routing into
//! turns. Each turn runs on its own task and reports through an event
//! channel; once the channel is handed out, failures become an `Error`
//! event followed by `Done`.

use super::events::{EventSink, StreamEvent};
use super::extractor::{apply_extraction, ContextExtractor};
use super::intent::{Intent, IntentRouter, RoutedTurn};
use super::query_builder::QueryBuilder;
use super::retriever::{RetrievalPolicy, Retriever};
use super::streamer::{AnswerPrompt, AnswerStreamer, StreamSettings};
use crate::config::AppConfig;
use crate::db::{ChatLogStore, FaqStore, RecordStore};
use crate::embeddings::Embedder;
use crate::errors::{AppError, Result};
use crate::llm::Completer;
use crate::session::{ConversationContext, SessionState, SessionStore};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

const EVENT_BUFFER: usize = 64;

/// Providers and stores the engine runs on
pub struct EngineDeps {
    pub embedder: Arc<dyn Embedder>,
    pub completer: Arc<dyn Completer>,
    pub faq_store: Arc<dyn FaqStore>,
    pub chat_log: Arc<dyn ChatLogStore>,
    pub records: Arc<dyn RecordStore>,
}

pub struct ChatEngine {
    sessions: Arc<SessionStore>,
    extractor: Arc<ContextExtractor>,
    retriever: Arc<Retriever>,
    streamer: Arc<AnswerStreamer>,
    router: IntentRouter,
    chat_log: Arc<dyn ChatLogStore>,
}

impl ChatEngine {
    pub fn new(config: &AppConfig, deps: EngineDeps, sessions: Arc<SessionStore>) -> Self {
        let extractor = Arc::new(ContextExtractor::new(
            deps.completer.clone(),
            config.llm.extraction_budget(),
        ));
        let retriever = Arc::new(Retriever::new(
            deps.embedder,
            deps.faq_store,
            RetrievalPolicy::from(&config.retrieval),
        ));
        let streamer = Arc::new(AnswerStreamer::new(
            deps.completer.clone(),
            StreamSettings::from(&config.llm),
        ));
        let router = IntentRouter::new(
            extractor.clone(),
            retriever.clone(),
            streamer.clone(),
            QueryBuilder::new(deps.completer, config.realtime.clone()),
            deps.records,
            config.realtime.clone(),
            config.session.history_turns,
        );

        Self {
            sessions,
            extractor,
            retriever,
            streamer,
            router,
            chat_log: deps.chat_log,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Start a FAQ turn for a server-held session
    pub fn ask(self: &Arc<Self>, session_id: impl Into<String>, question: impl Into<String>) -> mpsc::Receiver<StreamEvent> {
        let (sink, rx) = EventSink::channel(EVENT_BUFFER);
        let engine = Arc::clone(self);
        let session_id = session_id.into();
        let question = question.into();
        let span = info_span!("faq_turn", session_id = %session_id);

        tokio::spawn(
            async move {
                let start = Instant::now();
                let result = engine.run_faq_turn(&session_id, &question, &sink).await;
                finish(&sink, Intent::Faq.as_str(), start, result.map(|_| ())).await;
            }
            .instrument(span),
        );
        rx
    }

    /// Start a multi-intent turn over a caller-held context
    pub fn converse(self: &Arc<Self>, question: impl Into<String>, context: ConversationContext) -> mpsc::Receiver<StreamEvent> {
        let (sink, rx) = EventSink::channel(EVENT_BUFFER);
        let engine = Arc::clone(self);
        let question = question.into();
        let turn_id = Uuid::new_v4().to_string();
        let span = info_span!("routed_turn", turn_id = %turn_id);

        tokio::spawn(
            async move {
                let start = Instant::now();
                let mut state = SessionState::from_context(turn_id, &context);
                let result = engine.run_routed_turn(&mut state, &question, &sink).await;
                let intent = match &result {
                    Ok(turn) => turn.intent.as_str(),
                    Err(_) => "unknown",
                };
                finish(&sink, intent, start, result.map(|_| ())).await;
            }
            .instrument(span),
        );
        rx
    }

    /// Extraction, retrieval and generation for one FAQ turn, holding the
    /// session lock throughout. The turn is recorded only when the answer
    /// streamed to completion.
    #[instrument(skip(self, question, sink))]
    pub async fn run_faq_turn(&self, session_id: &str, question: &str, sink: &EventSink) -> Result<String> {
        let mut session = self.sessions.lock(session_id).await;

        let extraction = self.extractor.extract(&session, question).await;
        let update = apply_extraction(&mut session, &extraction);
        debug!(
            changed_facts = ?update.changed_facts,
            new_topics = ?update.new_topics,
            active_enquiry = ?update.active_enquiry,
            "Session updated"
        );

        if sink.is_closed() {
            return Err(AppError::Cancelled);
        }

        let retrieved = self
            .retriever
            .retrieve(
                &extraction.corrected_question,
                session.facts.active_enquiry(),
                &extraction.keywords,
            )
            .await?;

        let facts = session.facts.as_json();
        let prompt = AnswerPrompt {
            context_block: &retrieved.block,
            last_question: session.last_question.as_deref(),
            last_answer: session.last_answer.as_deref(),
            facts: &facts,
            question: &extraction.corrected_question,
        };
        let answer = self.streamer.stream_faq(prompt, sink).await?;

        session.record_turn(question, &answer);
        drop(session);

        self.log_turn(question, &answer).await;
        Ok(answer)
    }

    /// Routed turn over an ephemeral state. Ends with a second context frame
    /// carrying the recorded turn.
    pub async fn run_routed_turn(&self, state: &mut SessionState, question: &str, sink: &EventSink) -> Result<RoutedTurn> {
        let turn = self.router.route(state, question, sink).await?;

        state.record_turn(question, &turn.answer);
        self.log_turn(question, &turn.answer).await;
        sink.send(StreamEvent::Context {
            context: state.to_context(),
        })
        .await?;
        Ok(turn)
    }

    async fn log_turn(&self, question: &str, answer: &str) {
        if let Err(e) = self.chat_log.append(question, answer).await {
            warn!(error = %e, "Failed to append chat log");
        }
    }
}

async fn finish(sink: &EventSink, intent: &str, start: Instant, result: Result<()>) {
    let latency_ms = start.elapsed().as_millis() as u64;
    let outcome = match result {
        Ok(()) => {
            info!(intent, latency_ms, "Turn completed");
            "completed"
        }
        Err(AppError::Cancelled) => {
            info!(intent, latency_ms, "Turn cancelled by client");
            "cancelled"
        }
        Err(e) => {
            if e.is_server_error() {
                error!(intent, latency_ms, error = %e, "Turn failed");
            } else {
                warn!(intent, latency_ms, error = %e, "Turn failed");
            }
            let _ = sink.send(StreamEvent::error(&e)).await;
            "error"
        }
    };

    if outcome != "cancelled" {
        let _ = sink.send(StreamEvent::Done).await;
    }
    crate::metrics::record_turn(start.elapsed().as_secs_f64(), intent, outcome);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::{FaqRecord, InMemoryChatLog, InMemoryFaqStore, InMemoryRecordStore};
    use crate::embeddings::{faq_embedding_text, MockEmbedder};
    use crate::errors::ErrorCode;
    use crate::context::streamer::FALLBACK_ANSWER;
    use crate::llm::MockCompleter;
    use serde_json::json;
    use std::time::Duration;

    const DIM: usize = 128;

    struct Harness {
        engine: Arc<ChatEngine>,
        completer: Arc<MockCompleter>,
        chat_log: Arc<InMemoryChatLog>,
    }

    fn faq(id: i32, question: &str, answer: &str) -> FaqRecord {
        let embedder = MockEmbedder::new(DIM);
        FaqRecord::new(id, question, answer, embedder.embed_sync(&faq_embedding_text(question, answer)))
    }

    async fn harness(faqs: Vec<FaqRecord>, completer: MockCompleter) -> Harness {
        let completer = Arc::new(completer);
        let chat_log = Arc::new(InMemoryChatLog::new());
        let records = Arc::new(InMemoryRecordStore::new());
        records
            .insert_collection(
                "tours",
                vec![
                    json!({"id": 1, "tour": "Seaplane", "price": 420}),
                    json!({"id": 2, "tour": "Snorkel", "price": 90}),
                ],
            )
            .await;

        let deps = EngineDeps {
            embedder: Arc::new(MockEmbedder::new(DIM)),
            completer: completer.clone(),
            faq_store: Arc::new(InMemoryFaqStore::with_records(faqs)),
            chat_log: chat_log.clone(),
            records,
        };
        let engine = Arc::new(ChatEngine::new(&AppConfig::default(), deps, Arc::new(SessionStore::new())));
        Harness {
            engine,
            completer,
            chat_log,
        }
    }

    fn corpus() -> Vec<FaqRecord> {
        vec![
            faq(1, "Can children join the seaplane tour?", "Children over 2 can join with an adult."),
            faq(2, "What is the refund policy?", "Refunds are given up to 48 hours before."),
        ]
    }

    async fn drain(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn tokens(events: &[StreamEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Token { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_two_turn_conversation() {
        let mock = MockCompleter::new();
        mock.push_reply(
            json!({
                "keywords": ["seaplane", "tour", "kids"],
                "corrected_question": "I have 2 kids. Can I book a seaplane tour?",
                "updated_json": {"child_count": 2},
                "active_enquiry": "seaplane booking",
                "new_enquiry": "seaplane booking"
            })
            .to_string(),
        );
        mock.push_tokens(["Yes, ", "children over 2 ", "can join."]);
        mock.push_reply(
            json!({
                "keywords": ["kids"],
                "corrected_question": "What if I have 1 more kid?",
                "updated_json": {"child_count": 3},
                "active_enquiry": "seaplane booking"
            })
            .to_string(),
        );
        mock.push_tokens(["All three ", "can join."]);
        let h = harness(corpus(), mock).await;

        let first = drain(h.engine.ask("s1", "i have 2 kids can i book seaplane tour")).await;
        assert_eq!(tokens(&first), "Yes, children over 2 can join.");
        assert_eq!(first.last(), Some(&StreamEvent::Done));

        let second = drain(h.engine.ask("s1", "what if i have 1 more kid")).await;
        assert_eq!(tokens(&second), "All three can join.");

        let state = h.engine.sessions().get("s1").await.unwrap();
        assert_eq!(state.facts.get_i64("child_count"), Some(3));
        assert_eq!(state.facts.active_enquiry(), Some("seaplane booking"));
        assert_eq!(state.enquiries.len(), 1);
        assert_eq!(state.last_question.as_deref(), Some("what if i have 1 more kid"));
        assert_eq!(state.last_answer.as_deref(), Some("All three can join."));
        assert_eq!(state.accumulated_keywords, vec!["seaplane", "tour", "kids"]);

        // the second answer prompt carries the first turn
        let calls = h.completer.calls();
        assert_eq!(calls.len(), 4);
        assert!(calls[3][1].content.contains("User: i have 2 kids can i book seaplane tour"));
        assert!(calls[3][1].content.contains("\"child_count\":3"));

        assert_eq!(h.chat_log.entries().await.len(), 2);
    }

    #[tokio::test]
    async fn test_malformed_extraction_still_answers() {
        let mock = MockCompleter::new();
        mock.push_reply("not json at all");
        let h = harness(corpus(), mock).await;

        let events = drain(h.engine.ask("s2", "refund policy?")).await;
        assert_eq!(tokens(&events), MockCompleter::DEFAULT_ANSWER);
        assert_eq!(events.last(), Some(&StreamEvent::Done));

        let state = h.engine.sessions().get("s2").await.unwrap();
        assert!(state.facts.is_empty());
        assert_eq!(state.last_question.as_deref(), Some("refund policy?"));
    }

    #[tokio::test]
    async fn test_empty_corpus_falls_back_without_generation() {
        let h = harness(Vec::new(), MockCompleter::new()).await;

        let events = drain(h.engine.ask("s3", "Do you sell gift cards?")).await;
        assert_eq!(events, vec![StreamEvent::token(FALLBACK_ANSWER), StreamEvent::Done]);
        // extraction only
        assert_eq!(h.completer.call_count(), 1);

        let entries = h.chat_log.entries().await;
        assert_eq!(entries[0].bot_response, FALLBACK_ANSWER);
    }

    #[tokio::test]
    async fn test_generation_error_becomes_error_event() {
        let mock = MockCompleter::new();
        mock.push_stream_error(AppError::GenerationError {
            message: "upstream 500".into(),
        });
        let h = harness(corpus(), mock).await;

        let events = drain(h.engine.ask("s4", "refund policy?")).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            StreamEvent::Error { code: ErrorCode::GenerationError, .. }
        ));
        assert_eq!(events[1], StreamEvent::Done);

        let state = h.engine.sessions().get("s4").await.unwrap();
        assert!(state.last_answer.is_none());
        assert!(h.chat_log.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_skips_recording() {
        let mock = MockCompleter::new().with_token_delay(Duration::from_millis(10));
        mock.push_tokens((0..200).map(|i| format!("t{} ", i)));
        let h = harness(corpus(), mock).await;

        let mut rx = h.engine.ask("s5", "refund policy?");
        assert_eq!(rx.recv().await, Some(StreamEvent::token("t0 ")));
        drop(rx);

        // waits for the turn to release the session
        let state = h.engine.sessions().get("s5").await.unwrap();
        assert!(state.last_answer.is_none());
        assert!(h.chat_log.entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_realtime_turn() {
        let mock = MockCompleter::new();
        mock.push_reply(
            json!({
                "intent": "realtime",
                "keywords": ["tours"],
                "corrected_question": "Which tours cost more than 100?",
                "active_enquiry": "tour prices",
                "new_enquiry": "tour prices"
            })
            .to_string(),
        );
        mock.push_reply(json!({"collection": "tours", "filters": {"price": {"$gt": 100}}}).to_string());
        let h = harness(corpus(), mock).await;

        let events = drain(h.engine.converse("tours over 100?", ConversationContext::default())).await;
        assert_eq!(events.len(), 4);
        match &events[0] {
            StreamEvent::Context { context } => {
                assert_eq!(context.enquiry_history, vec!["tour prices"]);
                assert!(context.last_question.is_none());
            }
            other => panic!("expected context, got {:?}", other),
        }
        assert_eq!(
            events[1],
            StreamEvent::RealtimeData {
                data: vec![json!({"tour": "Seaplane", "price": 420})]
            }
        );
        match &events[2] {
            StreamEvent::Context { context } => {
                assert_eq!(context.last_question.as_deref(), Some("tours over 100?"));
            }
            other => panic!("expected context, got {:?}", other),
        }
        assert_eq!(events[3], StreamEvent::Done);
    }

    #[tokio::test]
    async fn test_realtime_without_collection() {
        let mock = MockCompleter::new();
        mock.push_reply(json!({"intent": "Realtime", "corrected_question": "Where is my booking?"}).to_string());
        mock.push_reply(json!({"collection": null}).to_string());
        let h = harness(corpus(), mock).await;

        let events = drain(h.engine.converse("where is my booking", ConversationContext::default())).await;
        assert!(matches!(events[0], StreamEvent::Context { .. }));
        assert!(matches!(
            &events[1],
            StreamEvent::Error { code: ErrorCode::NoCollectionSpecified, .. }
        ));
        assert_eq!(events[2], StreamEvent::Done);
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_general_turn_uses_context_history() {
        let mock = MockCompleter::new();
        mock.push_reply(json!({"intent": "general", "corrected_question": "Thanks!"}).to_string());
        mock.push_tokens(["You're ", "welcome."]);
        let h = harness(corpus(), mock).await;

        let context = ConversationContext {
            last_question: Some("Can kids fly?".into()),
            last_answer: Some("Over 2 only.".into()),
            ..Default::default()
        };
        let events = drain(h.engine.converse("thanks", context)).await;
        assert_eq!(tokens(&events), "You're welcome.");

        let general = &h.completer.calls()[1];
        let contents: Vec<&str> = general.iter().skip(1).map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["Can kids fly?", "Over 2 only.", "Thanks!"]);
    }
}
