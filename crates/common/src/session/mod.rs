//! Per-session conversational state
//!
//! Provides:
//! - `SessionState` with the fact-merge, keyword-union and topic-history rules
//! - `FactBag`, a typed accessor over the open-ended fact map
//! - `SessionStore`, a keyed in-memory store with per-session locking and
//!   idle eviction
//! - `ConversationContext`, the caller-held round-trip form of a session

use crate::errors::{AppError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info};

/// Topics kept in the enquiry history
pub const MAX_ENQUIRIES: usize = 10;

/// Completed turns kept for conversational replay
pub const MAX_TURN_HISTORY: usize = 10;

/// Fact key holding the topic of the current turn
pub const ACTIVE_ENQUIRY_KEY: &str = "active_enquiry";

const ENQUIRY_PREFIX: &str = "enquiry_";

/// `enquiry_<n>` with n >= 1
pub fn enquiry_index(key: &str) -> Option<usize> {
    key.strip_prefix(ENQUIRY_PREFIX)
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n >= 1)
}

pub fn is_enquiry_key(key: &str) -> bool {
    enquiry_index(key).is_some()
}

/// Topic equality: trimmed, Unicode case-insensitive
pub fn same_topic(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

/// Open-ended fact map extracted from the conversation.
///
/// Keys are whatever the extraction step chose; values are opaque JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FactBag(Map<String, Value>);

impl FactBag {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Integer view of a fact; numeric strings ("3") are accepted
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn active_enquiry(&self) -> Option<&str> {
        self.get_str(ACTIVE_ENQUIRY_KEY).filter(|s| !s.trim().is_empty())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `(n, key)` for every `enquiry_<n>` key, sorted by n
    pub fn enquiry_keys(&self) -> Vec<(usize, String)> {
        let mut keys: Vec<(usize, String)> = self
            .0
            .keys()
            .filter_map(|k| enquiry_index(k).map(|n| (n, k.clone())))
            .collect();
        keys.sort_by_key(|(n, _)| *n);
        keys
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn as_json(&self) -> Value {
        Value::Object(self.0.clone())
    }

    fn insert(&mut self, key: String, value: Value) -> Option<Value> {
        self.0.insert(key, value)
    }

    fn remove_enquiries(&mut self) {
        self.0.retain(|k, _| !is_enquiry_key(k));
    }
}

impl From<Map<String, Value>> for FactBag {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// One completed question/answer exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

/// Accumulated state of one conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub session_id: String,

    /// Extracted facts, including `active_enquiry` and `enquiry_<n>`
    #[serde(rename = "contextJson")]
    pub facts: FactBag,

    /// Lowercase single words, insertion ordered, never shrinks
    pub accumulated_keywords: Vec<String>,

    /// Most recent topics, oldest first
    pub enquiries: VecDeque<String>,

    pub last_question: Option<String>,

    pub last_answer: Option<String>,

    /// Recent turns, oldest first
    #[serde(default)]
    pub history: VecDeque<Turn>,

    pub last_active_at: DateTime<Utc>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            facts: FactBag::new(),
            accumulated_keywords: Vec::new(),
            enquiries: VecDeque::new(),
            last_question: None,
            last_answer: None,
            history: VecDeque::new(),
            last_active_at: Utc::now(),
        }
    }

    /// Apply a per-key overriding merge.
    ///
    /// Identical values and nulls are skipped, so absent or empty updates
    /// never erase a fact. `enquiry_<n>` keys are ignored: numbering is
    /// derived from the topic history only. Returns the keys that changed.
    pub fn merge_facts(&mut self, updates: &Map<String, Value>) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, value) in updates {
            if value.is_null() || is_enquiry_key(key) {
                continue;
            }
            if self.facts.get(key) == Some(value) {
                continue;
            }
            self.facts.insert(key.clone(), value.clone());
            changed.push(key.clone());
        }
        changed
    }

    /// Case-insensitive union. Multi-word entries are split into words.
    /// Returns the words that were new to the session.
    pub fn append_keywords<I, S>(&mut self, keywords: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = Vec::new();
        for keyword in keywords {
            for word in keyword.as_ref().split_whitespace() {
                let word = word.to_lowercase();
                if word.is_empty() || self.accumulated_keywords.contains(&word) {
                    continue;
                }
                self.accumulated_keywords.push(word.clone());
                added.push(word);
            }
        }
        added
    }

    /// Whether the topic history already holds this topic
    pub fn knows_topic(&self, topic: &str) -> bool {
        self.enquiries.iter().any(|t| same_topic(t, topic))
    }

    /// Append a topic unless it repeats the most recent one.
    ///
    /// Keeps the last `MAX_ENQUIRIES` topics and rewrites the
    /// `enquiry_1..enquiry_N` facts to match. Returns whether a topic was
    /// appended.
    pub fn push_topic(&mut self, topic: &str) -> bool {
        let topic = topic.trim();
        if topic.is_empty() {
            return false;
        }
        if self
            .enquiries
            .back()
            .is_some_and(|last| same_topic(last, topic))
        {
            return false;
        }

        self.enquiries.push_back(topic.to_string());
        while self.enquiries.len() > MAX_ENQUIRIES {
            self.enquiries.pop_front();
        }
        self.renumber_enquiries();
        true
    }

    pub fn set_active_enquiry(&mut self, topic: &str) -> bool {
        let topic = topic.trim();
        if topic.is_empty() || self.facts.active_enquiry() == Some(topic) {
            return false;
        }
        self.facts
            .insert(ACTIVE_ENQUIRY_KEY.to_string(), Value::String(topic.to_string()));
        true
    }

    pub fn record_turn(&mut self, question: &str, answer: &str) {
        self.last_question = Some(question.to_string());
        self.last_answer = Some(answer.to_string());
        self.history.push_back(Turn {
            question: question.to_string(),
            answer: answer.to_string(),
        });
        while self.history.len() > MAX_TURN_HISTORY {
            self.history.pop_front();
        }
        self.touch();
    }

    /// Up to `n` most recent turns, oldest first
    pub fn recent_turns(&self, n: usize) -> impl Iterator<Item = &Turn> {
        self.history.iter().skip(self.history.len().saturating_sub(n))
    }

    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }

    pub fn idle_for(&self) -> Duration {
        (Utc::now() - self.last_active_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    fn renumber_enquiries(&mut self) {
        self.facts.remove_enquiries();
        for (i, topic) in self.enquiries.iter().enumerate() {
            self.facts
                .insert(format!("{}{}", ENQUIRY_PREFIX, i + 1), Value::String(topic.clone()));
        }
    }

    /// Snapshot in the caller-held round-trip form
    pub fn to_context(&self) -> ConversationContext {
        ConversationContext {
            keywords: self.accumulated_keywords.clone(),
            enquiry_history: self.enquiries.iter().cloned().collect(),
            json: self.facts.as_map().clone(),
            last_question: self.last_question.clone(),
            last_answer: self.last_answer.clone(),
        }
    }

    /// Rebuild a state from a round-tripped context.
    ///
    /// The enquiry history wins over any `enquiry_<n>` keys in `json`; when
    /// the history is empty it is recovered from those keys in numeric order.
    pub fn from_context(session_id: impl Into<String>, context: &ConversationContext) -> Self {
        let mut state = Self::new(session_id);
        state.facts = FactBag::from(context.json.clone());

        let history: Vec<String> = if context.enquiry_history.is_empty() {
            state
                .facts
                .enquiry_keys()
                .into_iter()
                .filter_map(|(_, key)| state.facts.get_str(&key).map(str::to_string))
                .collect()
        } else {
            context.enquiry_history.clone()
        };

        let skip = history.len().saturating_sub(MAX_ENQUIRIES);
        state.enquiries = history
            .into_iter()
            .skip(skip)
            .filter(|t| !t.trim().is_empty())
            .collect();
        state.renumber_enquiries();

        state.append_keywords(&context.keywords);
        state.last_question = context.last_question.clone();
        state.last_answer = context.last_answer.clone();
        if let (Some(q), Some(a)) = (&state.last_question, &state.last_answer) {
            state.history.push_back(Turn {
                question: q.clone(),
                answer: a.clone(),
            });
        }
        state
    }
}

/// Session context carried by the caller between turns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationContext {
    pub keywords: Vec<String>,
    pub enquiry_history: Vec<String>,
    pub json: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_answer: Option<String>,
}

/// Exclusive handle on one session for the duration of a turn
pub type SessionGuard = OwnedMutexGuard<SessionState>;

/// Keyed in-memory session store.
///
/// Each session sits behind its own mutex so overlapping turns for the same
/// id run one after another; different sessions never contend beyond the
/// brief map lookup.
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn entry(&self, session_id: &str) -> Arc<Mutex<SessionState>> {
        if let Some(entry) = self.sessions.read().await.get(session_id) {
            return entry.clone();
        }

        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                debug!(session_id = %session_id, "Session created");
                Arc::new(Mutex::new(SessionState::new(session_id)))
            })
            .clone()
    }

    /// Lock a session (creating it if needed) for a whole turn
    pub async fn lock(&self, session_id: &str) -> SessionGuard {
        let entry = self.entry(session_id).await;
        let mut guard = entry.lock_owned().await;
        guard.touch();
        guard
    }

    /// Snapshot of the session, created with empty defaults on first contact
    pub async fn get_or_create(&self, session_id: &str) -> SessionState {
        self.lock(session_id).await.clone()
    }

    /// Snapshot of an existing session
    pub async fn get(&self, session_id: &str) -> Option<SessionState> {
        let entry = self.sessions.read().await.get(session_id).cloned()?;
        let guard = entry.lock().await;
        Some(guard.clone())
    }

    /// Snapshot of an existing session without waiting for a running turn
    pub async fn try_get(&self, session_id: &str) -> Result<Option<SessionState>> {
        let Some(entry) = self.sessions.read().await.get(session_id).cloned() else {
            return Ok(None);
        };
        let guard = entry.try_lock().map_err(|_| AppError::SessionBusy {
            id: session_id.to_string(),
        })?;
        Ok(Some(guard.clone()))
    }

    pub async fn merge_facts(&self, session_id: &str, updates: &Map<String, Value>) -> Vec<String> {
        self.lock(session_id).await.merge_facts(updates)
    }

    pub async fn append_keywords(&self, session_id: &str, keywords: &[String]) -> Vec<String> {
        self.lock(session_id).await.append_keywords(keywords)
    }

    pub async fn push_topic(&self, session_id: &str, topic: &str) -> bool {
        self.lock(session_id).await.push_topic(topic)
    }

    pub async fn record_turn(&self, session_id: &str, question: &str, answer: &str) {
        self.lock(session_id).await.record_turn(question, answer);
    }

    /// Drop a session. Returns whether it existed.
    pub async fn evict(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            debug!(session_id = %session_id, "Session evicted");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Evict sessions idle for at least `ttl`. Sessions mid-turn are kept.
    pub async fn evict_idle(&self, ttl: Duration) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, entry| match entry.try_lock() {
            Ok(state) => state.idle_for() < ttl,
            Err(_) => true,
        });
        before - sessions.len()
    }

    /// Run `evict_idle` every `interval` until the store is dropped
    pub fn spawn_eviction(
        self: &Arc<Self>,
        ttl: Duration,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else { break };
                let evicted = store.evict_idle(ttl).await;
                let active = store.len().await;
                crate::metrics::set_active_sessions(active);
                if evicted > 0 {
                    info!(evicted, active, "Evicted idle sessions");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn enquiry_values(state: &SessionState) -> Vec<String> {
        state
            .facts
            .enquiry_keys()
            .into_iter()
            .map(|(_, k)| state.facts.get_str(&k).unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_merge_overrides_per_key() {
        let mut state = SessionState::new("s1");
        state.merge_facts(&obj(json!({"child_count": 2, "destination": "Male"})));
        let changed = state.merge_facts(&obj(json!({"child_count": 3})));

        assert_eq!(changed, vec!["child_count".to_string()]);
        assert_eq!(state.facts.get_i64("child_count"), Some(3));
        assert_eq!(state.facts.get_str("destination"), Some("Male"));
    }

    #[test]
    fn test_merge_skips_identical_and_null() {
        let mut state = SessionState::new("s1");
        state.merge_facts(&obj(json!({"budget": 1000})));
        let changed = state.merge_facts(&obj(json!({"budget": 1000, "diet": null})));

        assert!(changed.is_empty());
        assert!(!state.facts.contains_key("diet"));
    }

    #[test]
    fn test_merge_ignores_enquiry_keys() {
        let mut state = SessionState::new("s1");
        state.merge_facts(&obj(json!({"enquiry_7": "rogue", "enquiry_x": "kept"})));
        assert!(!state.facts.contains_key("enquiry_7"));
        // not a numbered key, so just an ordinary fact
        assert!(state.facts.contains_key("enquiry_x"));
    }

    #[test]
    fn test_keywords_union_case_insensitive() {
        let mut state = SessionState::new("s1");
        state.append_keywords(["Seaplane", "tour"]);
        let added = state.append_keywords(["TOUR", "kids", "seaplane booking"]);

        assert_eq!(added, vec!["kids".to_string(), "booking".to_string()]);
        assert_eq!(
            state.accumulated_keywords,
            vec!["seaplane", "tour", "kids", "booking"]
        );
    }

    #[test]
    fn test_keywords_equal_union_over_turns() {
        let turns = [vec!["a", "B"], vec!["b", "c"], vec!["C", "a", "d"]];
        let mut state = SessionState::new("s1");
        for turn in &turns {
            let before = state.accumulated_keywords.clone();
            state.append_keywords(turn);
            assert!(before.iter().all(|k| state.accumulated_keywords.contains(k)));
        }
        assert_eq!(state.accumulated_keywords, vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn test_push_topic_skips_repeat_of_latest() {
        let mut state = SessionState::new("s1");
        assert!(state.push_topic("seaplane booking"));
        assert!(!state.push_topic("Seaplane Booking"));
        assert!(state.push_topic("refunds"));
        assert!(state.push_topic("seaplane booking"));
        assert_eq!(
            enquiry_values(&state),
            vec!["seaplane booking", "refunds", "seaplane booking"]
        );
    }

    #[test]
    fn test_topic_case_folding_is_unicode_aware() {
        let mut state = SessionState::new("s1");
        assert!(state.push_topic("Île tour"));
        assert!(!state.push_topic("île tour"));
        assert!(!state.push_topic("ÎLE TOUR "));
        assert_eq!(enquiry_values(&state), vec!["Île tour"]);
        assert!(state.knows_topic("ÎLE tour"));
        assert!(!state.knows_topic("lagoon tour"));
    }

    #[test]
    fn test_topic_history_is_bounded_and_renumbered() {
        let mut state = SessionState::new("s1");
        for i in 1..=13 {
            state.push_topic(&format!("topic {}", i));
            let keys = state.facts.enquiry_keys();
            let numbers: Vec<usize> = keys.iter().map(|(n, _)| *n).collect();
            let expected: Vec<usize> = (1..=i.min(MAX_ENQUIRIES)).collect();
            assert_eq!(numbers, expected);
        }

        let values = enquiry_values(&state);
        assert_eq!(values.len(), MAX_ENQUIRIES);
        assert_eq!(values.first().unwrap(), "topic 4");
        assert_eq!(values.last().unwrap(), "topic 13");
        assert_eq!(state.facts.get_str("enquiry_1"), Some("topic 4"));
        assert!(!state.facts.contains_key("enquiry_11"));
    }

    #[test]
    fn test_turn_history_is_bounded() {
        let mut state = SessionState::new("s1");
        for i in 0..12 {
            state.record_turn(&format!("q{}", i), &format!("a{}", i));
        }
        assert_eq!(state.history.len(), MAX_TURN_HISTORY);
        let recent: Vec<&str> = state.recent_turns(2).map(|t| t.question.as_str()).collect();
        assert_eq!(recent, vec!["q10", "q11"]);
        assert_eq!(state.last_question.as_deref(), Some("q11"));
    }

    #[test]
    fn test_active_enquiry() {
        let mut state = SessionState::new("s1");
        assert!(state.set_active_enquiry("refund policy"));
        assert!(!state.set_active_enquiry("refund policy"));
        assert!(!state.set_active_enquiry("  "));
        assert_eq!(state.facts.active_enquiry(), Some("refund policy"));
    }

    #[test]
    fn test_fact_bag_accessors() {
        let bag = FactBag::from(obj(json!({"n": "3", "f": 2.5, "ok": true})));
        assert_eq!(bag.get_i64("n"), Some(3));
        assert_eq!(bag.get_f64("f"), Some(2.5));
        assert_eq!(bag.get_bool("ok"), Some(true));
        assert_eq!(bag.get_i64("missing"), None);
    }

    #[test]
    fn test_context_round_trip_is_identity() {
        let mut state = SessionState::new("s1");
        state.append_keywords(["seaplane", "kids"]);
        state.push_topic("seaplane booking");
        state.push_topic("luggage");
        state.merge_facts(&obj(json!({"child_count": 2})));
        state.set_active_enquiry("luggage");
        state.record_turn("q", "a");

        let context = state.to_context();
        let wire = serde_json::to_value(&context).unwrap();
        let back: ConversationContext = serde_json::from_value(wire).unwrap();
        let restored = SessionState::from_context("s1", &back);

        assert_eq!(restored.to_context(), context);
        assert_eq!(restored.accumulated_keywords, state.accumulated_keywords);
        assert_eq!(restored.enquiries, state.enquiries);
    }

    #[test]
    fn test_context_history_recovered_from_json() {
        let context: ConversationContext = serde_json::from_value(json!({
            "json": {"enquiry_2": "b", "enquiry_1": "a", "budget": 10}
        }))
        .unwrap();
        let state = SessionState::from_context("x", &context);
        assert_eq!(state.enquiries, VecDeque::from(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(state.facts.get_i64("budget"), Some(10));
    }

    #[tokio::test]
    async fn test_store_get_or_create_is_idempotent() {
        let store = SessionStore::new();
        store.merge_facts("s1", &obj(json!({"child_count": 2}))).await;

        let state = store.get_or_create("s1").await;
        assert_eq!(state.facts.get_i64("child_count"), Some(2));
        assert_eq!(store.len().await, 1);

        store.get_or_create("s1").await;
        assert_eq!(store.len().await, 1);
        assert!(store.get("nope").await.is_none());
    }

    #[tokio::test]
    async fn test_store_operations() {
        let store = SessionStore::new();
        store.append_keywords("s1", &["Tour".to_string()]).await;
        assert!(store.push_topic("s1", "tours").await);
        store.record_turn("s1", "How much?", "It depends.").await;

        let state = store.get("s1").await.unwrap();
        assert_eq!(state.accumulated_keywords, vec!["tour"]);
        assert_eq!(state.facts.get_str("enquiry_1"), Some("tours"));
        assert_eq!(state.last_answer.as_deref(), Some("It depends."));

        assert!(store.evict("s1").await);
        assert!(!store.evict("s1").await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_try_get_does_not_wait_for_a_turn() {
        let store = SessionStore::new();
        assert!(store.try_get("s1").await.unwrap().is_none());

        let guard = store.lock("s1").await;
        assert!(matches!(
            store.try_get("s1").await,
            Err(AppError::SessionBusy { .. })
        ));
        drop(guard);

        let state = store.try_get("s1").await.unwrap().unwrap();
        assert_eq!(state.session_id, "s1");
    }

    #[tokio::test]
    async fn test_lock_serializes_turns() {
        let store = Arc::new(SessionStore::new());
        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut guard = store.lock("shared").await;
                let count = guard.facts.get_i64("count").unwrap_or(0);
                tokio::task::yield_now().await;
                guard.merge_facts(&obj(json!({"count": count + 1})));
                guard.append_keywords([format!("k{}", i)]);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let state = store.get("shared").await.unwrap();
        assert_eq!(state.facts.get_i64("count"), Some(20));
        assert_eq!(state.accumulated_keywords.len(), 20);
    }

    #[tokio::test]
    async fn test_evict_idle_keeps_locked_sessions() {
        let store = SessionStore::new();
        store.get_or_create("idle").await;
        let _busy = store.lock("busy").await;

        let evicted = store.evict_idle(Duration::ZERO).await;
        assert_eq!(evicted, 1);
        assert!(store.get("idle").await.is_none());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_evict_idle_respects_ttl() {
        let store = SessionStore::new();
        store.get_or_create("fresh").await;
        assert_eq!(store.evict_idle(Duration::from_secs(3600)).await, 0);
    }
}
