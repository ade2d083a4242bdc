//! FAQ Bot Common Library
//!
//! Shared code for the FAQ bot services including:
//! - Configuration management
//! - Error types and handling
//! - Vector math over stored embeddings
//! - Embedding and chat-completion clients
//! - Session state and the in-memory session store
//! - FAQ corpus, chat log and realtime record stores
//! - The conversation engine
//! - Metrics

pub mod config;
pub mod context;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod llm;
pub mod metrics;
pub mod session;
pub mod vector;

// Re-export commonly used types
pub use config::AppConfig;
pub use context::{ChatEngine, EngineDeps, StreamEvent};
pub use db::{DbPool, Repository};
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use llm::Completer;
pub use session::{ConversationContext, SessionState, SessionStore};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
