//! In-memory stores
//!
//! Used by tests and by the gateway when no database is configured.

use crate::context::query_builder::{is_valid_identifier, QueryDescriptor};
use crate::db::{ChatLogStore, FaqDocument, FaqStore, RecordStore};
use crate::errors::{AppError, Result};
use crate::vector::normalize_embedding;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// FAQ row as stored, before embedding validation
#[derive(Debug, Clone)]
pub struct FaqRecord {
    pub id: i32,
    pub question: String,
    pub answer: String,
    pub embedding: Value,
    pub published: bool,
}

impl FaqRecord {
    pub fn new(id: i32, question: &str, answer: &str, embedding: Vec<f32>) -> Self {
        Self {
            id,
            question: question.to_string(),
            answer: answer.to_string(),
            embedding: Value::from(embedding),
            published: true,
        }
    }
}

#[derive(Default)]
pub struct InMemoryFaqStore {
    records: RwLock<Vec<FaqRecord>>,
}

impl InMemoryFaqStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<FaqRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub async fn insert(&self, record: FaqRecord) {
        self.records.write().await.push(record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl FaqStore for InMemoryFaqStore {
    async fn list_embedded(&self) -> Result<Vec<FaqDocument>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.published)
            .filter_map(|r| {
                Some(FaqDocument {
                    id: r.id,
                    question: r.question.clone(),
                    answer: r.answer.clone(),
                    embedding: normalize_embedding(&r.embedding)?,
                })
            })
            .collect())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatLogEntry {
    pub user_query: String,
    pub bot_response: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
pub struct InMemoryChatLog {
    entries: RwLock<Vec<ChatLogEntry>>,
}

impl InMemoryChatLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<ChatLogEntry> {
        self.entries.read().await.clone()
    }
}

#[async_trait]
impl ChatLogStore for InMemoryChatLog {
    async fn append(&self, user_query: &str, bot_response: &str) -> Result<()> {
        self.entries.write().await.push(ChatLogEntry {
            user_query: user_query.to_string(),
            bot_response: bot_response.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

/// Named collections of JSON rows
#[derive(Default)]
pub struct InMemoryRecordStore {
    collections: RwLock<HashMap<String, Vec<Value>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_collection(&self, name: &str, rows: Vec<Value>) {
        self.collections.write().await.insert(name.to_string(), rows);
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn sample(&self, collection: &str, limit: usize) -> Result<Vec<Value>> {
        if !is_valid_identifier(collection) {
            return Err(AppError::UnknownCollection {
                name: collection.to_string(),
            });
        }
        Ok(self
            .collections
            .read()
            .await
            .get(collection)
            .map(|rows| rows.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn query(&self, query: &QueryDescriptor) -> Result<Vec<Value>> {
        let collections = self.collections.read().await;
        let rows = collections
            .get(&query.collection)
            .ok_or_else(|| AppError::UnknownCollection {
                name: query.collection.clone(),
            })?;
        Ok(query.apply(rows.iter().cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_faq_store_excludes_unusable_rows() {
        let mut draft = FaqRecord::new(2, "Draft?", "No.", vec![1.0, 0.0]);
        draft.published = false;
        let mut no_embedding = FaqRecord::new(3, "Null?", "Yes.", vec![]);
        no_embedding.embedding = Value::Null;

        let store = InMemoryFaqStore::with_records(vec![
            FaqRecord::new(1, "Ok?", "Yes.", vec![1.0, 0.0]),
            draft,
            no_embedding,
            FaqRecord::new(4, "Empty?", "Yes.", vec![]),
        ]);

        let docs = store.list_embedded().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, 1);
    }

    #[tokio::test]
    async fn test_default_distance_ranking() {
        let store = InMemoryFaqStore::with_records(vec![
            FaqRecord::new(1, "far", "a", vec![-1.0, 0.0]),
            FaqRecord::new(2, "near", "b", vec![1.0, 0.1]),
            FaqRecord::new(3, "exact", "c", vec![1.0, 0.0]),
            FaqRecord::new(4, "wrong dim", "d", vec![1.0, 0.0, 0.0]),
        ]);

        let ranked = store.nearest_by_distance(&[1.0, 0.0], 0.9, 5).await.unwrap();
        let questions: Vec<&str> = ranked.iter().map(|c| c.question.as_str()).collect();
        assert_eq!(questions, vec!["exact", "near"]);
        assert!(ranked[0].score <= ranked[1].score);
    }

    #[tokio::test]
    async fn test_chat_log_appends() {
        let log = InMemoryChatLog::new();
        log.append("q1", "a1").await.unwrap();
        log.append("q2", "a2").await.unwrap();
        let entries = log.entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].user_query, "q2");
    }

    #[tokio::test]
    async fn test_record_store_query() {
        let store = InMemoryRecordStore::new();
        store
            .insert_collection("tours", vec![json!({"id": 1, "price": 50}), json!({"id": 2, "price": 150})])
            .await;

        assert_eq!(store.sample("tours", 1).await.unwrap().len(), 1);
        assert!(store.sample("missing", 3).await.unwrap().is_empty());

        let q = QueryDescriptor::parse(
            &json!({"collection": "tours", "filters": {"price": {"$gt": 100}}}),
            &["tours".to_string()],
            10,
        )
        .unwrap();
        let rows = store.query(&q).await.unwrap();
        assert_eq!(rows, vec![json!({"id": 2, "price": 150})]);
    }
}
