//! Database layer for FaqBot
//!
//! Provides:
//! - SeaORM entity models for FAQs and chat logs
//! - Store traits used by the chat engine (`FaqStore`, `ChatLogStore`,
//!   `RecordStore`)
//! - `Repository`, the Postgres implementation of all three
//! - In-memory implementations in `memory`
//! - Connection pool management

pub mod memory;
pub mod models;
mod repository;

pub use repository::Repository;

use crate::config::DatabaseConfig;
use crate::context::query_builder::QueryDescriptor;
use crate::errors::{AppError, Result};
use crate::vector::cosine_distance;
use async_trait::async_trait;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// A published FAQ with a usable embedding
#[derive(Debug, Clone, PartialEq)]
pub struct FaqDocument {
    pub id: i32,
    pub question: String,
    pub answer: String,
    pub embedding: Vec<f32>,
}

/// A scored FAQ. `score` is a similarity or a distance depending on the
/// retrieval mode that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalCandidate {
    pub question: String,
    pub answer: String,
    pub score: f32,
}

/// Read access to the FAQ corpus
#[async_trait]
pub trait FaqStore: Send + Sync {
    /// Published FAQs whose embedding is present and well formed
    async fn list_embedded(&self) -> Result<Vec<FaqDocument>>;

    /// FAQs within `max_distance` of `query`, nearest first, at most `limit`.
    ///
    /// Rows whose embedding dimension differs from the query are skipped.
    async fn nearest_by_distance(
        &self,
        query: &[f32],
        max_distance: f32,
        limit: usize,
    ) -> Result<Vec<RetrievalCandidate>> {
        let mut candidates = Vec::new();
        for doc in self.list_embedded().await? {
            match cosine_distance(query, &doc.embedding) {
                Ok(distance) if distance <= max_distance => candidates.push(RetrievalCandidate {
                    question: doc.question,
                    answer: doc.answer,
                    score: distance,
                }),
                Ok(_) => {}
                Err(e) => debug!(faq_id = doc.id, error = %e, "Skipping FAQ"),
            }
        }
        candidates.sort_by(|a, b| a.score.total_cmp(&b.score));
        candidates.truncate(limit);
        Ok(candidates)
    }
}

/// Append-only record of answered turns
#[async_trait]
pub trait ChatLogStore: Send + Sync {
    async fn append(&self, user_query: &str, bot_response: &str) -> Result<()>;
}

/// Read access to the named collections the realtime path may query
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// A few rows of `collection`, as JSON objects
    async fn sample(&self, collection: &str, limit: usize) -> Result<Vec<serde_json::Value>>;

    /// Rows matching a validated query descriptor
    async fn query(&self, query: &QueryDescriptor) -> Result<Vec<serde_json::Value>>;
}

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    conn: DatabaseConnection,
    query_timeout: Duration,
}

impl DbPool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database...");

        let mut opts = ConnectOptions::new(&config.url);
        opts.max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .sqlx_logging(false);

        let conn = Database::connect(opts)
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Failed to connect: {}", e),
            })?;

        info!("Database connection established");

        Ok(Self {
            conn,
            query_timeout: Duration::from_secs(config.query_timeout_secs),
        })
    }

    pub fn conn(&self) -> &DatabaseConnection {
        &self.conn
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        self.conn
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::DatabaseConnection {
                message: format!("Ping failed: {}", e),
            })?;
        Ok(())
    }

    /// Whether the pgvector extension is installed
    pub async fn pgvector_enabled(&self) -> Result<bool> {
        let stmt = Statement::from_string(
            DbBackend::Postgres,
            "SELECT extname FROM pg_extension WHERE extname = 'vector'",
        );
        let row = self.conn.query_one(stmt).await?;
        Ok(row.is_some())
    }
}
