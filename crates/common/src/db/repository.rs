//! Repository pattern for database operations
//!
//! Postgres implementation of the FAQ, chat-log and record stores.

use crate::context::query_builder::{sample_sql, CompiledQuery, QueryDescriptor, SqlParam};
use crate::db::models::*;
use crate::db::{ChatLogStore, DbPool, FaqDocument, FaqStore, RecordStore, RetrievalCandidate};
use crate::errors::{AppError, Result};
use crate::vector::{normalize_embedding, to_pgvector_literal};
use async_trait::async_trait;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait, QueryFilter, Set,
    Statement,
};
use std::future::Future;
use tracing::{debug, warn};

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> &DatabaseConnection {
        self.pool.conn()
    }

    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    /// Run a query under the configured per-query timeout
    async fn timed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.pool.query_timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| AppError::ServiceUnavailable {
                message: format!("Database query exceeded {}s", timeout.as_secs()),
            })?
    }

    async fn query_json(&self, compiled: CompiledQuery) -> Result<Vec<serde_json::Value>> {
        let values: Vec<sea_orm::Value> = compiled.params.into_iter().map(to_db_value).collect();
        let stmt = Statement::from_sql_and_values(DbBackend::Postgres, &compiled.sql, values);

        let rows = self.timed(async { Ok(self.conn().query_all(stmt).await?) }).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.try_get::<serde_json::Value>("", "r").ok())
            .collect())
    }
}

/// The JSON embedding is cast through text to `vector` only inside a CASE,
/// whose branches Postgres evaluates in order. Rows that are not an array of
/// `$2` numbers get a NULL vector and drop out instead of failing the cast.
const NEAREST_BY_DISTANCE_SQL: &str = r#"
    SELECT question, answer, distance FROM (
        SELECT
            question,
            answer,
            (CASE
                WHEN jsonb_typeof(embedding) <> 'array' THEN NULL
                WHEN jsonb_array_length(embedding) <> $2 THEN NULL
                WHEN jsonb_path_exists(embedding, '$[*] ? (@.type() != "number")') THEN NULL
                ELSE embedding::text::vector
            END <=> $1::vector) AS distance
        FROM faqs
        WHERE published_at IS NOT NULL
          AND embedding IS NOT NULL
    ) ranked
    WHERE distance IS NOT NULL
      AND distance <= $3
    ORDER BY distance ASC
    LIMIT $4
"#;

fn to_db_value(param: SqlParam) -> sea_orm::Value {
    match param {
        SqlParam::Json(v) => v.into(),
        SqlParam::Float(f) => f.into(),
        SqlParam::Text(s) => s.into(),
        SqlParam::Int(i) => i.into(),
    }
}

#[async_trait]
impl FaqStore for Repository {
    async fn list_embedded(&self) -> Result<Vec<FaqDocument>> {
        let rows = self
            .timed(async {
                FaqEntity::find()
                    .filter(FaqColumn::PublishedAt.is_not_null())
                    .filter(FaqColumn::Embedding.is_not_null())
                    .all(self.conn())
                    .await
                    .map_err(Into::into)
            })
            .await?;

        let total = rows.len();
        let docs: Vec<FaqDocument> = rows
            .into_iter()
            .filter_map(|faq| {
                let embedding = faq.embedding.as_ref().and_then(normalize_embedding)?;
                Some(FaqDocument {
                    id: faq.id,
                    question: faq.question,
                    answer: faq.answer,
                    embedding,
                })
            })
            .collect();

        if docs.len() < total {
            debug!(skipped = total - docs.len(), "FAQs with malformed embeddings skipped");
        }
        Ok(docs)
    }

    /// Distance ranking pushed down to pgvector.
    async fn nearest_by_distance(
        &self,
        query: &[f32],
        max_distance: f32,
        limit: usize,
    ) -> Result<Vec<RetrievalCandidate>> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            NEAREST_BY_DISTANCE_SQL,
            vec![
                to_pgvector_literal(query).into(),
                (query.len() as i32).into(),
                (max_distance as f64).into(),
                (limit as i64).into(),
            ],
        );

        let rows = self.timed(async { Ok(self.conn().query_all(stmt).await?) }).await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some(RetrievalCandidate {
                    question: row.try_get::<String>("", "question").ok()?,
                    answer: row.try_get::<String>("", "answer").ok()?,
                    score: row.try_get::<f64>("", "distance").ok()? as f32,
                })
            })
            .collect())
    }
}

#[async_trait]
impl ChatLogStore for Repository {
    async fn append(&self, user_query: &str, bot_response: &str) -> Result<()> {
        let entry = ChatLogActiveModel {
            user_query: Set(user_query.to_string()),
            bot_response: Set(Some(bot_response.to_string())),
            timestamp: Set(Some(chrono::Utc::now().into())),
            ..Default::default()
        };

        self.timed(async {
            entry.insert(self.conn()).await?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl RecordStore for Repository {
    async fn sample(&self, collection: &str, limit: usize) -> Result<Vec<serde_json::Value>> {
        self.query_json(sample_sql(collection, limit)?).await
    }

    async fn query(&self, query: &QueryDescriptor) -> Result<Vec<serde_json::Value>> {
        let compiled = query.to_sql();
        debug!(collection = %query.collection, sql = %compiled.sql, "Running realtime query");
        self.query_json(compiled).await.inspect_err(|e| {
            warn!(collection = %query.collection, error = %e, "Realtime query failed");
        })
    }
}
