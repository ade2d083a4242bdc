//! Configuration management for FaqBot services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration (FAQ corpus, chat logs, realtime collections)
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Language model configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Session store configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Realtime (structured data) path configuration
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds (non-streaming endpoints)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Maximum concurrent requests
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL; empty runs the service on in-memory stores
    #[serde(default)]
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Per-query timeout in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, mock
    #[serde(default = "default_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Completion provider: openai, mock
    #[serde(default = "default_provider")]
    pub provider: String,

    /// API key for the completion service
    pub api_key: Option<String>,

    /// API base URL (for OpenAI-compatible endpoints)
    pub api_base: Option<String>,

    /// Chat model used for extraction, classification and answers
    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default)]
    pub temperature: f32,

    /// Token budget for streamed answers
    #[serde(default = "default_answer_max_tokens")]
    pub answer_max_tokens: u32,

    /// Timeout for one structured (JSON) call attempt in seconds
    #[serde(default = "default_extraction_timeout")]
    pub extraction_timeout_secs: u64,

    /// Timeout until the first streamed token arrives, in seconds
    #[serde(default = "default_first_token_timeout")]
    pub first_token_timeout_secs: u64,

    /// Maximum silence between two streamed tokens, in seconds
    #[serde(default = "default_token_idle_timeout")]
    pub token_idle_timeout_secs: u64,

    /// Maximum retries for structured calls
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

/// Scoring mode for FAQ retrieval
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScoreModeKind {
    /// In-memory cosine similarity, higher is better
    Similarity,
    /// Cosine distance (pgvector `<=>`), lower is better
    Distance,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Scoring mode
    #[serde(default = "default_score_mode")]
    pub mode: ScoreModeKind,

    /// Number of FAQ entries handed to the answer model
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Rows fetched before dedupe/threshold in distance mode
    #[serde(default = "default_candidate_pool")]
    pub candidate_pool: usize,

    /// Optional similarity floor (similarity mode only)
    pub min_similarity: Option<f32>,

    /// Distance cutoff (distance mode only)
    #[serde(default = "default_max_distance")]
    pub max_distance: f32,

    /// Collapse rows sharing the exact same question text
    #[serde(default = "default_true")]
    pub dedupe_questions: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Sessions idle longer than this are evicted, in seconds
    #[serde(default = "default_session_ttl")]
    pub idle_ttl_secs: u64,

    /// How often the eviction sweep runs, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Prior turns replayed on the general conversation path
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RealtimeConfig {
    /// Collections the query builder may target
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,

    /// Records sampled per collection for schema-aware prompting
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,

    /// Maximum rows returned by a realtime query
    #[serde(default = "default_row_limit")]
    pub row_limit: usize,

    /// Identifier field stripped from relayed rows
    #[serde(default = "default_id_field")]
    pub id_field: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error) or a full filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_true")]
    pub json_logging: bool,

    /// Service name for logs
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second (global)
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Longest pause between two retries of an outbound call
pub const RETRY_MAX_INTERVAL: Duration = Duration::from_secs(2);

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 1337 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_concurrent() -> usize { 100 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_query_timeout() -> u64 { 10 }
fn default_provider() -> String { "openai".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_dimension() -> usize { 1536 }
fn default_embedding_timeout() -> u64 { 15 }
fn default_retries() -> u32 { 2 }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_answer_max_tokens() -> u32 { 120 }
fn default_extraction_timeout() -> u64 { 20 }
fn default_first_token_timeout() -> u64 { 20 }
fn default_token_idle_timeout() -> u64 { 15 }
fn default_score_mode() -> ScoreModeKind { ScoreModeKind::Similarity }
fn default_top_k() -> usize { 5 }
fn default_candidate_pool() -> usize { 20 }
fn default_max_distance() -> f32 { 0.9 }
fn default_session_ttl() -> u64 { 1800 }
fn default_sweep_interval() -> u64 { 60 }
fn default_history_turns() -> usize { 3 }
fn default_collections() -> Vec<String> { vec!["bookings".to_string(), "tours".to_string()] }
fn default_sample_size() -> usize { 3 }
fn default_row_limit() -> usize { 20 }
fn default_id_field() -> String { "id".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_service_name() -> String { "faqbot".to_string() }
fn default_rate_limit() -> u32 { 20 }
fn default_burst() -> u32 { 40 }
fn default_true() -> bool { true }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__LLM__MODEL=gpt-4o
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("realtime.collections")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=10).contains(&self.retrieval.top_k) {
            return Err(ConfigError::Message(format!(
                "retrieval.top_k must be between 1 and 10, got {}",
                self.retrieval.top_k
            )));
        }
        if self.retrieval.max_distance <= 0.0 {
            return Err(ConfigError::Message(
                "retrieval.max_distance must be positive".to_string(),
            ));
        }
        if self.realtime.collections.iter().any(|c| c.trim().is_empty()) {
            return Err(ConfigError::Message(
                "realtime.collections must not contain empty names".to_string(),
            ));
        }
        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Whether a database is configured at all
    pub fn has_database(&self) -> bool {
        !self.database.url.trim().is_empty()
    }
}

impl LlmConfig {
    /// Per-attempt timeout for structured calls
    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    /// Whole-call budget for structured calls: every attempt plus the
    /// longest backoff pause before each retry
    pub fn extraction_budget(&self) -> Duration {
        self.extraction_timeout() * (self.max_retries + 1) + RETRY_MAX_INTERVAL * self.max_retries
    }

    pub fn first_token_timeout(&self) -> Duration {
        Duration::from_secs(self.first_token_timeout_secs)
    }

    pub fn token_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.token_idle_timeout_secs)
    }
}

impl SessionConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_retries(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            api_base: None,
            model: default_llm_model(),
            temperature: 0.0,
            answer_max_tokens: default_answer_max_tokens(),
            extraction_timeout_secs: default_extraction_timeout(),
            first_token_timeout_secs: default_first_token_timeout(),
            token_idle_timeout_secs: default_token_idle_timeout(),
            max_retries: default_retries(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            mode: default_score_mode(),
            top_k: default_top_k(),
            candidate_pool: default_candidate_pool(),
            min_similarity: None,
            max_distance: default_max_distance(),
            dedupe_questions: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl_secs: default_session_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            history_turns: default_history_turns(),
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            collections: default_collections(),
            sample_size: default_sample_size(),
            row_limit: default_row_limit(),
            id_field: default_id_field(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: true,
            service_name: default_service_name(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: true,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            retrieval: RetrievalConfig::default(),
            session: SessionConfig::default(),
            realtime: RealtimeConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.llm.answer_max_tokens, 120);
        assert_eq!(config.retrieval.mode, ScoreModeKind::Similarity);
        assert!(config.retrieval.min_similarity.is_none());
        assert!((config.retrieval.max_distance - 0.9).abs() < f32::EPSILON);
        assert!(!config.has_database());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_top_k() {
        let mut config = AppConfig::default();
        config.retrieval.top_k = 0;
        assert!(config.validate().is_err());
        config.retrieval.top_k = 11;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_extraction_budget_covers_retries() {
        let mut llm = LlmConfig::default();
        llm.extraction_timeout_secs = 1;
        llm.max_retries = 2;
        assert_eq!(llm.extraction_budget(), Duration::from_secs(7));
        assert!(llm.extraction_budget() > llm.extraction_timeout() * 2);

        llm.max_retries = 0;
        assert_eq!(llm.extraction_budget(), llm.extraction_timeout());
    }

    #[test]
    fn test_score_mode_deserializes_snake_case() {
        let mode: ScoreModeKind = serde_json::from_str("\"distance\"").unwrap();
        assert_eq!(mode, ScoreModeKind::Distance);
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "retrieval": { "mode": "distance", "top_k": 3 }
        }))
        .unwrap();
        assert_eq!(config.retrieval.top_k, 3);
        assert_eq!(config.retrieval.candidate_pool, 20);
        assert_eq!(config.session.idle_ttl_secs, 1800);
    }
}
