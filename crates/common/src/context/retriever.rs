//! FAQ retrieval
//!
//! Embeds the contextualized question and ranks the FAQ corpus under one of
//! two scoring modes:
//! - `Similarity`: cosine similarity computed in memory, higher is better,
//!   optional floor
//! - `Distance`: cosine distance (pgvector `<=>` when the store supports it),
//!   lower is better, hard cutoff
//!
//! Scores from different modes are never compared.

use crate::config::{RetrievalConfig, ScoreModeKind};
use crate::db::{FaqDocument, FaqStore, RetrievalCandidate};
use crate::embeddings::{query_embedding_text, Embedder};
use crate::errors::{AppError, Result};
use crate::vector::cosine_similarity;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

/// Context block used when nothing relevant was found
pub const NO_RELEVANT_FAQS: &str = "NO_RELEVANT_FAQS";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreMode {
    Similarity { min_similarity: Option<f32> },
    Distance { max_distance: f32 },
}

impl ScoreMode {
    pub fn label(&self) -> &'static str {
        match self {
            ScoreMode::Similarity { .. } => "similarity",
            ScoreMode::Distance { .. } => "distance",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalPolicy {
    pub mode: ScoreMode,
    pub top_k: usize,
    /// Rows fetched from the store before dedupe in distance mode
    pub candidate_pool: usize,
    pub dedupe_questions: bool,
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        Self::from(&RetrievalConfig::default())
    }
}

impl From<&RetrievalConfig> for RetrievalPolicy {
    fn from(config: &RetrievalConfig) -> Self {
        let mode = match config.mode {
            ScoreModeKind::Similarity => ScoreMode::Similarity {
                min_similarity: config.min_similarity,
            },
            ScoreModeKind::Distance => ScoreMode::Distance {
                max_distance: config.max_distance,
            },
        };
        Self {
            mode,
            top_k: config.top_k,
            candidate_pool: config.candidate_pool.max(config.top_k),
            dedupe_questions: config.dedupe_questions,
        }
    }
}

/// Ranked candidates and the context block built from them
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedContext {
    pub candidates: Vec<RetrievalCandidate>,
    pub block: String,
}

impl RetrievedContext {
    pub fn from_candidates(candidates: Vec<RetrievalCandidate>) -> Self {
        let block = format_context(&candidates);
        Self { candidates, block }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// `Q:/A:` blocks separated by blank lines, or the sentinel
pub fn format_context(candidates: &[RetrievalCandidate]) -> String {
    if candidates.is_empty() {
        return NO_RELEVANT_FAQS.to_string();
    }
    candidates
        .iter()
        .map(|c| format!("Q: {}\nA: {}", c.question, c.answer))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Score every document of matching dimension, best first
pub fn rank_by_similarity(
    query: &[f32],
    docs: Vec<FaqDocument>,
    min_similarity: Option<f32>,
) -> Vec<RetrievalCandidate> {
    let mut ranked: Vec<RetrievalCandidate> = docs
        .into_iter()
        .filter_map(|doc| match cosine_similarity(query, &doc.embedding) {
            Ok(score) => Some(RetrievalCandidate {
                question: doc.question,
                answer: doc.answer,
                score,
            }),
            Err(e) => {
                debug!(faq_id = doc.id, error = %e, "Dropping FAQ from ranking");
                None
            }
        })
        .filter(|c| min_similarity.map_or(true, |floor| c.score >= floor))
        .collect();

    ranked.sort_by(|a, b| b.score.total_cmp(&a.score));
    ranked
}

/// Keep distances within the cutoff, nearest first
pub fn filter_by_distance(candidates: Vec<RetrievalCandidate>, max_distance: f32) -> Vec<RetrievalCandidate> {
    let mut kept: Vec<RetrievalCandidate> = candidates.into_iter().filter(|c| c.score <= max_distance).collect();
    kept.sort_by(|a, b| a.score.total_cmp(&b.score));
    kept
}

/// Drop repeated question texts, keeping the first (best) row
pub fn dedupe_by_question(candidates: Vec<RetrievalCandidate>) -> Vec<RetrievalCandidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(c.question.trim().to_lowercase()))
        .collect()
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn FaqStore>,
    policy: RetrievalPolicy,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, store: Arc<dyn FaqStore>, policy: RetrievalPolicy) -> Self {
        Self { embedder, store, policy }
    }

    pub fn policy(&self) -> &RetrievalPolicy {
        &self.policy
    }

    /// Embed text; every failure surfaces as an embedding error
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embedder.embed(text).await.map_err(|e| match e {
            AppError::EmbeddingError { .. } | AppError::EmbeddingTimeout { .. } => e,
            other => AppError::EmbeddingError {
                message: other.to_string(),
            },
        })
    }

    /// Rank the corpus against a query vector under the configured policy
    pub async fn rank(&self, query: &[f32]) -> Result<Vec<RetrievalCandidate>> {
        let ranked = match self.policy.mode {
            ScoreMode::Similarity { min_similarity } => {
                let docs = self.store.list_embedded().await?;
                rank_by_similarity(query, docs, min_similarity)
            }
            ScoreMode::Distance { max_distance } => {
                let nearest = self
                    .store
                    .nearest_by_distance(query, max_distance, self.policy.candidate_pool)
                    .await?;
                filter_by_distance(nearest, max_distance)
            }
        };

        let mut ranked = if self.policy.dedupe_questions {
            dedupe_by_question(ranked)
        } else {
            ranked
        };
        ranked.truncate(self.policy.top_k);
        Ok(ranked)
    }

    /// Embed the contextualized question and build the context block
    #[instrument(skip(self, keywords), fields(mode = self.policy.mode.label()))]
    pub async fn retrieve(
        &self,
        question: &str,
        active_enquiry: Option<&str>,
        keywords: &[String],
    ) -> Result<RetrievedContext> {
        let input = query_embedding_text(question, active_enquiry, keywords);
        let query = self.embed(&input).await?;

        let start = Instant::now();
        let candidates = self.rank(&query).await?;
        crate::metrics::record_retrieval(start.elapsed().as_secs_f64(), self.policy.mode.label(), candidates.len());

        debug!(
            candidates = candidates.len(),
            top_score = candidates.first().map(|c| c.score),
            "Retrieved FAQ context"
        );
        Ok(RetrievedContext::from_candidates(candidates))
    }
}
