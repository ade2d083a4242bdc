//! Embedding service abstraction
//!
//! Provides:
//! - `Embedder` trait used by retrieval
//! - `OpenAIEmbedder` over the `/embeddings` endpoint with retry and timeout
//! - `MockEmbedder`, deterministic and offline
//! - the text conventions shared by the query side and the FAQ producer

use crate::config::EmbeddingConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Trait for embedding generation
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate embedding for a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;
}

/// Text embedded for a stored FAQ entry
pub fn faq_embedding_text(question: &str, answer: &str) -> String {
    format!("Q: {}\nA: {}", question.trim(), answer.trim())
}

/// Text embedded for an incoming question.
///
/// Empty parts are omitted so a bare question embeds as `Q: ...` only.
pub fn query_embedding_text(question: &str, active_enquiry: Option<&str>, keywords: &[String]) -> String {
    let mut text = format!("Q: {}", question.trim());
    if let Some(topic) = active_enquiry.map(str::trim).filter(|t| !t.is_empty()) {
        text.push_str("\nActive Enquiry: ");
        text.push_str(topic);
    }
    if !keywords.is_empty() {
        text.push_str("\nKeywords: ");
        text.push_str(&keywords.join(", "));
    }
    text
}

/// OpenAI embedding client
pub struct OpenAIEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimension: usize,
    base_url: String,
    max_retries: u32,
    timeout: Duration,
}

#[derive(Serialize)]
struct OpenAIRequest<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
}

impl OpenAIEmbedder {
    pub fn new(api_key: String, config: &EmbeddingConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            dimension: config.dimension,
            base_url: config
                .api_base
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            max_retries: config.max_retries,
            timeout,
        })
    }

    async fn request_with_retry(&self, text: &str) -> Result<Vec<f32>> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(2),
            max_elapsed_time: Some(self.timeout * (self.max_retries + 1)),
            ..Default::default()
        };

        let mut attempt = 0u32;
        backoff::future::retry(policy, || {
            attempt += 1;
            let attempt = attempt;
            async move {
                self.make_request(text).await.map_err(|e| {
                    if e.is_transient() && attempt <= self.max_retries {
                        tracing::warn!(
                            attempt,
                            max_retries = self.max_retries,
                            error = %e,
                            "Embedding request failed, retrying"
                        );
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }

    async fn make_request(&self, text: &str) -> Result<Vec<f32>> {
        let url = format!("{}/embeddings", self.base_url);

        let request = OpenAIRequest {
            input: text,
            model: &self.model,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::EmbeddingTimeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    AppError::HttpClient(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() == 429 || status.is_server_error() {
                return Err(AppError::ServiceUnavailable {
                    message: format!("Embedding API error {}: {}", status, body),
                });
            }
            return Err(AppError::EmbeddingError {
                message: format!("API error {}: {}", status, body),
            });
        }

        let result: OpenAIResponse = response.json().await.map_err(|e| AppError::EmbeddingError {
            message: format!("Failed to parse response: {}", e),
        })?;

        result
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or_else(|| AppError::EmbeddingError {
                message: "Empty response".to_string(),
            })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let start = Instant::now();
        let result = self.request_with_retry(text).await;
        crate::metrics::record_embedding(start.elapsed().as_secs_f64(), &self.model, result.is_ok());

        // Retry exhaustion on a transient failure still surfaces as an embedding failure
        let embedding = result.map_err(|e| match e {
            AppError::EmbeddingError { .. } | AppError::EmbeddingTimeout { .. } => e,
            other => AppError::EmbeddingError {
                message: other.to_string(),
            },
        })?;

        if !crate::vector::validate_embedding(&embedding) {
            return Err(AppError::EmbeddingError {
                message: "Provider returned an empty or non-finite vector".to_string(),
            });
        }
        Ok(embedding)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Deterministic bag-of-words embedder.
///
/// Each lowercase word is hashed into one dimension, so texts sharing words
/// score higher than texts that share none. Good enough for ranking tests
/// and local runs without a provider.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    fn bucket(&self, word: &str) -> usize {
        // FNV-1a
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in word.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        (hash % self.dimension as u64) as usize
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let word = word.to_lowercase();
            embedding[self.bucket(&word)] += 1.0;
        }
        embedding
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Create an embedder based on configuration
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| AppError::Configuration {
                    message: "embedding.api_key is required for the openai provider".to_string(),
                })?;
            Ok(Arc::new(OpenAIEmbedder::new(key, config)?))
        }
        "mock" => Ok(Arc::new(MockEmbedder::new(config.dimension))),
        other => {
            tracing::warn!(provider = other, "Unknown embedding provider, using mock");
            Ok(Arc::new(MockEmbedder::new(config.dimension)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;

    #[tokio::test]
    async fn test_mock_embedder_dimension() {
        let embedder = MockEmbedder::new(64);
        let embedding = embedder.embed("test text").await.unwrap();
        assert_eq!(embedding.len(), 64);
        assert_eq!(embedder.dimension(), 64);
    }

    #[tokio::test]
    async fn test_mock_embedder_is_deterministic() {
        let embedder = MockEmbedder::new(128);
        let a = embedder.embed("Seaplane tours for kids").await.unwrap();
        let b = embedder.embed("seaplane TOURS for kids").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_mock_embedder_ranks_overlap_higher() {
        let embedder = MockEmbedder::new(256);
        let query = embedder.embed("seaplane booking").await.unwrap();
        let close = embedder.embed("How do I book a seaplane? booking").await.unwrap();
        let far = embedder.embed("What is the refund policy").await.unwrap();

        assert!(cosine_similarity(&query, &close).unwrap() > cosine_similarity(&query, &far).unwrap());
    }

    #[test]
    fn test_embedding_text_formats() {
        assert_eq!(faq_embedding_text(" Can I? ", "Yes."), "Q: Can I?\nA: Yes.");
        assert_eq!(
            query_embedding_text("Can kids fly?", Some("seaplane"), &["seaplane".into(), "kids".into()]),
            "Q: Can kids fly?\nActive Enquiry: seaplane\nKeywords: seaplane, kids"
        );
        assert_eq!(query_embedding_text("Hi", Some(" "), &[]), "Q: Hi");
    }

    #[test]
    fn test_create_embedder_requires_key() {
        let mut config = EmbeddingConfig::default();
        config.provider = "openai".to_string();
        config.api_key = None;
        assert!(matches!(
            create_embedder(&config),
            Err(AppError::Configuration { .. })
        ));

        config.provider = "mock".to_string();
        let embedder = create_embedder(&config).unwrap();
        assert_eq!(embedder.model_name(), "mock-embedding");
    }
}
