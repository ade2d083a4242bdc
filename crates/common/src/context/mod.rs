//! Conversation engine
//!
//! Provides:
//! - context extraction and the session merge policy
//! - FAQ retrieval over the embedded corpus
//! - streamed, closed-domain answer generation
//! - intent routing with realtime record queries
//! - `ChatEngine`, which ties the pieces into turns

pub mod engine;
pub mod events;
pub mod extractor;
pub mod intent;
pub mod query_builder;
pub mod retriever;
pub mod streamer;

pub use engine::{ChatEngine, EngineDeps};
pub use events::{EventSink, StreamEvent, DONE_SENTINEL};
pub use extractor::{apply_extraction, AppliedUpdate, ContextExtractor, Extraction};
pub use intent::{Intent, IntentRouter, RoutedTurn};
pub use query_builder::{FieldFilter, FilterOp, QueryBuilder, QueryDescriptor, SortDirection, SortSpec};
pub use retriever::{RetrievalPolicy, RetrievedContext, Retriever, ScoreMode, NO_RELEVANT_FAQS};
pub use streamer::{AnswerPrompt, AnswerStreamer, StreamSettings, FALLBACK_ANSWER};
