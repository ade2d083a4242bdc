//! Context extraction
//!
//! One structured model call per turn turns the raw question plus the
//! session snapshot into a corrected question, keywords, a fact delta and a
//! topic decision. `apply_extraction` owns the merge policy; the model only
//! proposes values.

use super::intent::Intent;
use crate::errors::{AppError, Result};
use crate::llm::{ChatMessage, Completer, CompletionOptions};
use crate::session::{enquiry_index, SessionState, ACTIVE_ENQUIRY_KEY};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Result of one extraction call
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Extraction {
    pub keywords: Vec<String>,

    pub corrected_question: String,

    /// Proposed fact updates, without `active_enquiry`
    pub updated_json: Map<String, Value>,

    /// Topic of this turn, new or continued
    pub active_enquiry: Option<String>,

    /// Topics the model flagged as new, in order
    pub new_enquiries: Vec<String>,

    /// Only present on the classification schema
    pub intent: Option<Intent>,

    /// True when the reply could not be used
    #[serde(skip)]
    pub fallback: bool,
}

impl Extraction {
    /// Default extraction for an unusable reply: the raw question, nothing else
    pub fn fallback(question: &str) -> Self {
        Self {
            corrected_question: question.to_string(),
            fallback: true,
            ..Default::default()
        }
    }

    /// Parse a model reply. Fields of the wrong type are treated as absent.
    pub fn parse(question: &str, reply: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(strip_code_fence(reply)).map_err(|e| AppError::ExtractionParse {
            message: e.to_string(),
        })?;
        let Value::Object(mut root) = value else {
            return Err(AppError::ExtractionParse {
                message: "reply is not a JSON object".to_string(),
            });
        };

        let keywords = match root.remove("keywords") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
            _ => Vec::new(),
        };

        let corrected_question = root
            .get("corrected_question")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .unwrap_or(question)
            .to_string();

        let mut updated_json = match root.remove("updated_json") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };

        let active_enquiry = non_empty_str(root.get(ACTIVE_ENQUIRY_KEY))
            .or_else(|| non_empty_str(updated_json.get(ACTIVE_ENQUIRY_KEY)));
        updated_json.remove(ACTIVE_ENQUIRY_KEY);

        let mut new_enquiries: Vec<String> = non_empty_str(root.get("new_enquiry")).into_iter().collect();
        let mut numbered: Vec<(usize, String)> = updated_json
            .iter()
            .filter_map(|(k, v)| Some((enquiry_index(k)?, non_empty_str(Some(v))?)))
            .collect();
        numbered.sort_by_key(|(n, _)| *n);
        new_enquiries.extend(numbered.into_iter().map(|(_, topic)| topic));
        updated_json.retain(|k, _| enquiry_index(k).is_none());

        let intent = root.get("intent").and_then(Value::as_str).and_then(Intent::parse);

        Ok(Self {
            keywords,
            corrected_question,
            updated_json,
            active_enquiry,
            new_enquiries,
            intent,
            fallback: false,
        })
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// What an extraction changed in the session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AppliedUpdate {
    pub changed_facts: Vec<String>,
    pub new_keywords: Vec<String>,
    pub new_topics: Vec<String>,
    pub active_enquiry: Option<String>,
}

/// Apply an extraction to the session.
///
/// - facts merge per key, identical values skipped
/// - keywords join the case-insensitive union
/// - proposed topics already in the history are ignored, the rest are
///   pushed in order
/// - the active enquiry is the proposed topic, else the newest pushed
///   topic, else the turn's keywords joined by spaces
pub fn apply_extraction(state: &mut SessionState, extraction: &Extraction) -> AppliedUpdate {
    let changed_facts = state.merge_facts(&extraction.updated_json);
    let new_keywords = state.append_keywords(&extraction.keywords);

    let mut new_topics = Vec::new();
    for topic in &extraction.new_enquiries {
        if !state.knows_topic(topic) && state.push_topic(topic) {
            new_topics.push(topic.clone());
        }
    }

    let active = extraction
        .active_enquiry
        .clone()
        .or_else(|| new_topics.last().cloned())
        .or_else(|| (!extraction.keywords.is_empty()).then(|| extraction.keywords.join(" ")));
    if let Some(topic) = &active {
        state.set_active_enquiry(topic);
    }

    AppliedUpdate {
        changed_facts,
        new_keywords,
        new_topics,
        active_enquiry: active,
    }
}

const EXTRACTION_RULES: &str = "You maintain the context of a customer support conversation.\n\
For every user question:\n\
1. Correct spelling and grammar without changing the meaning. Return it as \"corrected_question\".\n\
2. Return the important words of the question as \"keywords\": lowercase, one word each.\n\
3. Put every personal or situational fact the user states into \"updated_json\" with a snake_case key, \
e.g. \"I have 2 kids\" -> {\"child_count\": 2}, \"my budget is $1000\" -> {\"budget\": 1000}, \
\"travelling to Male\" -> {\"traveling_to\": \"Male\"}.\n\
4. Relative changes update the known value: known {\"child_count\": 2} and \"1 more kid\" -> {\"child_count\": 3}. \
Corrections replace it: \"actually 3 kids\" -> {\"child_count\": 3}.\n\
5. Only include facts that are new or changed. Never repeat unchanged facts.\n\
6. Set \"active_enquiry\" to a short phrase naming the topic of this question.\n\
7. If the topic is not in the enquiry history, also set \"new_enquiry\" to that phrase. \
If it continues or returns to a listed topic, leave \"new_enquiry\" out.";

const INTENT_RULES: &str = "8. Classify the question as \"intent\":\n\
- \"faq\": policies, procedures or general information the knowledge base answers\n\
- \"realtime\": live records such as bookings, availability or schedules held in these collections: ";

const GENERAL_INTENT_RULE: &str = "\n- \"general\": greetings, small talk or anything else";

/// Structured extraction over a `Completer`
pub struct ContextExtractor {
    completer: Arc<dyn Completer>,
    timeout: Duration,
}

impl ContextExtractor {
    pub fn new(completer: Arc<dyn Completer>, timeout: Duration) -> Self {
        Self { completer, timeout }
    }

    /// Prompt for one turn. `collections` switches on the intent schema.
    pub fn build_messages(state: &SessionState, question: &str, collections: Option<&[String]>) -> Vec<ChatMessage> {
        let mut system = String::from(EXTRACTION_RULES);
        let mut schema = String::from(
            "{\"keywords\": [string], \"corrected_question\": string, \"updated_json\": object, \
             \"active_enquiry\": string, \"new_enquiry\": string",
        );

        if let Some(collections) = collections {
            system.push('\n');
            system.push_str(INTENT_RULES);
            system.push_str(&collections.join(", "));
            system.push_str(GENERAL_INTENT_RULE);
            schema.push_str(", \"intent\": \"faq\" | \"realtime\" | \"general\"");
        }
        schema.push('}');

        system.push_str("\n\nReply with one JSON object: ");
        system.push_str(&schema);

        let history: Vec<String> = state
            .enquiries
            .iter()
            .enumerate()
            .map(|(i, t)| format!("{}. {}", i + 1, t))
            .collect();

        let user = format!(
            "Known facts: {}\nPrevious keywords: {}\nEnquiry history:\n{}\n\nUser question: {}",
            state.facts.as_json(),
            serde_json::to_string(&state.accumulated_keywords).unwrap_or_else(|_| "[]".to_string()),
            if history.is_empty() { "(none)".to_string() } else { history.join("\n") },
            question
        );

        vec![ChatMessage::system(system), ChatMessage::user(user)]
    }

    async fn call(&self, messages: &[ChatMessage]) -> Result<String> {
        tokio::time::timeout(self.timeout, self.completer.complete(messages, &CompletionOptions::structured()))
            .await
            .map_err(|_| AppError::GenerationTimeout {
                timeout_ms: self.timeout.as_millis() as u64,
            })?
    }

    async fn run(&self, state: &SessionState, question: &str, collections: Option<&[String]>) -> Extraction {
        let messages = Self::build_messages(state, question, collections);
        let parsed = match self.call(&messages).await {
            Ok(reply) => Extraction::parse(question, &reply),
            Err(e) => Err(e),
        };

        match parsed {
            Ok(extraction) => {
                debug!(
                    session_id = %state.session_id,
                    keywords = ?extraction.keywords,
                    facts = extraction.updated_json.len(),
                    intent = ?extraction.intent,
                    "Extraction parsed"
                );
                extraction
            }
            Err(e) => {
                warn!(session_id = %state.session_id, error = %e, "Extraction failed, using defaults");
                crate::metrics::record_extraction_fallback();
                Extraction::fallback(question)
            }
        }
    }

    /// Extract context for the FAQ path. Never fails.
    #[instrument(skip(self, state), fields(session_id = %state.session_id))]
    pub async fn extract(&self, state: &SessionState, question: &str) -> Extraction {
        self.run(state, question, None).await
    }

    /// Extract context and classify intent in the same call. Never fails.
    #[instrument(skip(self, state, collections), fields(session_id = %state.session_id))]
    pub async fn classify(&self, state: &SessionState, question: &str, collections: &[String]) -> Extraction {
        self.run(state, question, Some(collections)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockCompleter;
    use serde_json::json;

    fn extractor(mock: &Arc<MockCompleter>) -> ContextExtractor {
        ContextExtractor::new(mock.clone(), Duration::from_secs(5))
    }

    #[test]
    fn test_parse_full_reply() {
        let reply = r#"{
            "keywords": ["Seaplane", "tour", ""],
            "corrected_question": "I have 2 kids. Can I book a seaplane tour?",
            "updated_json": {"child_count": 2, "active_enquiry": "seaplane booking", "enquiry_1": "seaplane booking"}
        }"#;
        let e = Extraction::parse("raw", reply).unwrap();

        assert_eq!(e.keywords, vec!["seaplane", "tour"]);
        assert_eq!(e.corrected_question, "I have 2 kids. Can I book a seaplane tour?");
        assert_eq!(e.updated_json, json!({"child_count": 2}).as_object().cloned().unwrap());
        assert_eq!(e.active_enquiry.as_deref(), Some("seaplane booking"));
        assert_eq!(e.new_enquiries, vec!["seaplane booking"]);
        assert!(!e.fallback);
    }

    #[test]
    fn test_parse_tolerates_wrong_types_and_fences() {
        let reply = "```json\n{\"keywords\": \"a, B\", \"corrected_question\": 3, \"updated_json\": []}\n```";
        let e = Extraction::parse("raw q", reply).unwrap();
        assert_eq!(e.keywords, vec!["a", "b"]);
        assert_eq!(e.corrected_question, "raw q");
        assert!(e.updated_json.is_empty());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            Extraction::parse("q", "{not json"),
            Err(AppError::ExtractionParse { .. })
        ));
        assert!(Extraction::parse("q", "[1,2]").is_err());
    }

    #[test]
    fn test_parse_intent() {
        let e = Extraction::parse("q", r#"{"intent": "Realtime"}"#).unwrap();
        assert_eq!(e.intent, Some(Intent::Realtime));
        let e = Extraction::parse("q", r#"{"intent": "weather"}"#).unwrap();
        assert_eq!(e.intent, None);
    }

    #[test]
    fn test_apply_synthesizes_active_enquiry_from_keywords() {
        let mut state = SessionState::new("s");
        let extraction = Extraction {
            keywords: vec!["refund".into(), "policy".into()],
            corrected_question: "What is the refund policy?".into(),
            ..Default::default()
        };
        let applied = apply_extraction(&mut state, &extraction);

        assert_eq!(applied.active_enquiry.as_deref(), Some("refund policy"));
        assert_eq!(state.facts.active_enquiry(), Some("refund policy"));
        assert!(state.enquiries.is_empty());
    }

    #[test]
    fn test_apply_ignores_known_topics() {
        let mut state = SessionState::new("s");
        state.push_topic("seaplane booking");
        state.push_topic("luggage");

        let extraction = Extraction {
            new_enquiries: vec!["Seaplane Booking".into()],
            active_enquiry: Some("seaplane booking".into()),
            ..Default::default()
        };
        let applied = apply_extraction(&mut state, &extraction);

        assert!(applied.new_topics.is_empty());
        assert_eq!(state.enquiries.len(), 2);
        assert_eq!(state.facts.active_enquiry(), Some("seaplane booking"));
    }

    #[test]
    fn test_apply_ignores_known_non_ascii_topics() {
        let mut state = SessionState::new("s");
        state.push_topic("Île tour");
        state.push_topic("luggage");

        let extraction = Extraction {
            new_enquiries: vec!["île tour".into()],
            ..Default::default()
        };
        let applied = apply_extraction(&mut state, &extraction);
        assert!(applied.new_topics.is_empty());
        assert_eq!(state.enquiries.len(), 2);
    }

    #[test]
    fn test_fallback_leaves_state_untouched() {
        let mut state = SessionState::new("s");
        state.merge_facts(json!({"budget": 10}).as_object().unwrap());
        let before = state.facts.clone();

        let applied = apply_extraction(&mut state, &Extraction::fallback("hello"));
        assert_eq!(applied, AppliedUpdate::default());
        assert_eq!(state.facts, before);
    }

    #[tokio::test]
    async fn test_seaplane_scenario_two_turns() {
        let mock = Arc::new(MockCompleter::new());
        mock.push_reply(
            r#"{"keywords": ["kids", "book", "seaplane", "tour"],
                "corrected_question": "I have 2 kids. Can I book a seaplane tour?",
                "updated_json": {"child_count": 2},
                "active_enquiry": "seaplane tour booking",
                "new_enquiry": "seaplane tour booking"}"#,
        );
        mock.push_reply(
            r#"{"keywords": ["kid"],
                "corrected_question": "I have 1 more kid.",
                "updated_json": {"child_count": 3},
                "active_enquiry": "seaplane tour booking"}"#,
        );
        let extractor = extractor(&mock);
        let mut state = SessionState::new("s1");

        let turn1 = extractor.extract(&state, "I have 2 kids, can I book a seaplane tour?").await;
        apply_extraction(&mut state, &turn1);
        assert_eq!(state.facts.get_i64("child_count"), Some(2));
        assert_eq!(state.facts.get_str("enquiry_1"), Some("seaplane tour booking"));
        assert!(state.accumulated_keywords.contains(&"seaplane".to_string()));
        let keywords_after_turn1 = state.accumulated_keywords.clone();

        let turn2 = extractor.extract(&state, "I have 1 more kid").await;
        let applied = apply_extraction(&mut state, &turn2);
        assert_eq!(state.facts.get_i64("child_count"), Some(3));
        assert!(applied.new_topics.is_empty());
        assert!(!state.facts.contains_key("enquiry_2"));
        assert!(keywords_after_turn1.iter().all(|k| state.accumulated_keywords.contains(k)));

        // The second prompt carried the first turn's facts and topic
        let prompt = &mock.calls()[1][1].content;
        assert!(prompt.contains("\"child_count\":2"));
        assert!(prompt.contains("1. seaplane tour booking"));
    }

    #[tokio::test]
    async fn test_malformed_reply_falls_back() {
        let mock = Arc::new(MockCompleter::new());
        mock.push_reply("Sure! Here is the JSON you asked for: {");
        let extraction = extractor(&mock).extract(&SessionState::new("s"), "wat is refund").await;

        assert!(extraction.fallback);
        assert_eq!(extraction.corrected_question, "wat is refund");
        assert!(extraction.keywords.is_empty());
        assert!(extraction.updated_json.is_empty());
    }

    #[tokio::test]
    async fn test_provider_error_falls_back() {
        let mock = Arc::new(MockCompleter::new());
        mock.push_reply_error(AppError::GenerationError {
            message: "down".into(),
        });
        let extraction = extractor(&mock).extract(&SessionState::new("s"), "hi").await;
        assert!(extraction.fallback);
    }

    #[tokio::test]
    async fn test_slow_reply_times_out_to_fallback() {
        let mock = Arc::new(MockCompleter::new().with_reply_delay(Duration::from_millis(500)));
        mock.push_reply(r#"{"corrected_question": "too late"}"#);
        let extractor = ContextExtractor::new(mock.clone(), Duration::from_millis(50));

        let extraction = extractor.extract(&SessionState::new("s"), "raw?").await;
        assert!(extraction.fallback);
        assert_eq!(extraction.corrected_question, "raw?");
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_hung_attempt_is_retried_within_budget() {
        use crate::config::LlmConfig;
        use crate::llm::OpenAICompleter;
        use axum::{routing::post, Json, Router};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/chat/completions",
            post(move || {
                let counter = counter.clone();
                async move {
                    // first attempt hangs past the per-attempt timeout
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Json(json!({
                        "choices": [{"message": {"content": "{\"corrected_question\": \"Is the refund flexible?\"}"}}]
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let config = LlmConfig {
            api_base: Some(format!("http://{}", addr)),
            extraction_timeout_secs: 1,
            max_retries: 2,
            ..Default::default()
        };
        let completer = Arc::new(OpenAICompleter::new("test-key".to_string(), &config).unwrap());
        let extractor = ContextExtractor::new(completer, config.extraction_budget());

        let extraction = extractor.extract(&SessionState::new("s"), "raw?").await;
        assert!(!extraction.fallback);
        assert_eq!(extraction.corrected_question, "Is the refund flexible?");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_classification_prompt_lists_collections() {
        let collections = vec!["bookings".to_string(), "tours".to_string()];
        let messages = ContextExtractor::build_messages(&SessionState::new("s"), "q", Some(&collections));
        assert!(messages[0].content.contains("bookings, tours"));
        assert!(messages[0].content.contains("\"intent\""));

        let plain = ContextExtractor::build_messages(&SessionState::new("s"), "q", None);
        assert!(!plain[0].content.contains("\"intent\""));
    }
}
