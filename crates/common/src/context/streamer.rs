//! Answer streaming
//!
//! Provides:
//! - closed-domain prompts over a retrieved FAQ context
//! - open prompts for the general conversation path
//! - token relay to an `EventSink` with first-token and idle timeouts,
//!   aborting the upstream request when the client goes away

use super::events::{EventSink, StreamEvent};
use super::retriever::NO_RELEVANT_FAQS;
use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use crate::llm::{ChatMessage, Completer, CompletionOptions};
use crate::session::SessionState;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// Exact reply when no FAQ is relevant
pub const FALLBACK_ANSWER: &str = "I couldn't find this information in our knowledge base.";

const FAQ_SYSTEM_PROMPT: &str = "You answer customer questions using only the FAQ CONTEXT provided.\n\
You may combine several FAQ entries, restate a policy as a direct answer, and give conditional \
guidance such as \"you can book if...\".\n\
You must not add facts that are not in the FAQ CONTEXT or use outside knowledge.\n\
If and only if the FAQ CONTEXT is exactly NO_RELEVANT_FAQS, reply with exactly: \
I couldn't find this information in our knowledge base.\n\
Keep the answer to two or three short sentences and finish with a complete sentence ending in a period.";

const GENERAL_SYSTEM_PROMPT: &str = "You are a friendly assistant for a travel and booking service. \
Reply briefly and naturally in two or three sentences. Use the known facts about the user when they help.";

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub temperature: f32,
    pub max_tokens: u32,
    pub first_token_timeout: Duration,
    pub idle_timeout: Duration,
}

impl From<&LlmConfig> for StreamSettings {
    fn from(config: &LlmConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_tokens: config.answer_max_tokens,
            first_token_timeout: config.first_token_timeout(),
            idle_timeout: config.token_idle_timeout(),
        }
    }
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self::from(&LlmConfig::default())
    }
}

/// Inputs of a closed-domain answer
#[derive(Debug, Clone, Copy)]
pub struct AnswerPrompt<'a> {
    pub context_block: &'a str,
    pub last_question: Option<&'a str>,
    pub last_answer: Option<&'a str>,
    pub facts: &'a serde_json::Value,
    pub question: &'a str,
}

impl<'a> AnswerPrompt<'a> {
    pub fn is_sentinel(&self) -> bool {
        self.context_block.trim() == NO_RELEVANT_FAQS
    }
}

pub struct AnswerStreamer {
    completer: Arc<dyn Completer>,
    settings: StreamSettings,
}

impl AnswerStreamer {
    pub fn new(completer: Arc<dyn Completer>, settings: StreamSettings) -> Self {
        Self { completer, settings }
    }

    pub fn faq_messages(prompt: &AnswerPrompt<'_>) -> Vec<ChatMessage> {
        let user = format!(
            "FAQ CONTEXT:\n{}\n\nPREVIOUS CONVERSATION:\nUser: {}\nAssistant: {}\n\nKNOWN FACTS: {}\n\nCURRENT QUESTION: {}",
            prompt.context_block,
            prompt.last_question.unwrap_or("None"),
            prompt.last_answer.unwrap_or("None"),
            prompt.facts,
            prompt.question
        );
        vec![ChatMessage::system(FAQ_SYSTEM_PROMPT), ChatMessage::user(user)]
    }

    /// Recent turns replayed as chat history, then the question
    pub fn general_messages(state: &SessionState, question: &str, history_turns: usize) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(format!(
            "{}\nKnown facts: {}",
            GENERAL_SYSTEM_PROMPT,
            state.facts.as_json()
        ))];
        for turn in state.recent_turns(history_turns) {
            messages.push(ChatMessage::user(turn.question.clone()));
            messages.push(ChatMessage::assistant(turn.answer.clone()));
        }
        messages.push(ChatMessage::user(question));
        messages
    }

    /// Stream a closed-domain answer. The sentinel context short-circuits to
    /// `FALLBACK_ANSWER` without a model call.
    #[instrument(skip_all)]
    pub async fn stream_faq(&self, prompt: AnswerPrompt<'_>, sink: &EventSink) -> Result<String> {
        if prompt.is_sentinel() {
            debug!("No relevant FAQs, sending fallback answer");
            sink.send(StreamEvent::token(FALLBACK_ANSWER)).await?;
            return Ok(FALLBACK_ANSWER.to_string());
        }
        self.relay(&Self::faq_messages(&prompt), sink).await
    }

    #[instrument(skip_all)]
    pub async fn stream_general(
        &self,
        state: &SessionState,
        question: &str,
        history_turns: usize,
        sink: &EventSink,
    ) -> Result<String> {
        self.relay(&Self::general_messages(state, question, history_turns), sink)
            .await
    }

    /// Forward tokens in arrival order and return the full answer.
    ///
    /// Returns `Cancelled` as soon as the receiver is dropped; the upstream
    /// stream is dropped with it.
    async fn relay(&self, messages: &[ChatMessage], sink: &EventSink) -> Result<String> {
        let start = Instant::now();
        let options = CompletionOptions::text(self.settings.temperature, self.settings.max_tokens);
        let result = self.relay_inner(messages, &options, sink).await;

        let success = result.is_ok() || matches!(result, Err(AppError::Cancelled));
        crate::metrics::record_generation(start.elapsed().as_secs_f64(), "stream", success);
        result
    }

    async fn relay_inner(&self, messages: &[ChatMessage], options: &CompletionOptions, sink: &EventSink) -> Result<String> {
        let first_token_timeout = self.settings.first_token_timeout;
        let mut stream = tokio::select! {
            biased;
            _ = sink.closed() => return Err(AppError::Cancelled),
            opened = tokio::time::timeout(first_token_timeout, self.completer.stream(messages, options)) => {
                opened.map_err(|_| AppError::GenerationTimeout {
                    timeout_ms: first_token_timeout.as_millis() as u64,
                })??
            }
        };

        let mut answer = String::new();
        let mut tokens = 0usize;

        loop {
            let wait = if tokens == 0 {
                first_token_timeout
            } else {
                self.settings.idle_timeout
            };

            let next = tokio::select! {
                biased;
                _ = sink.closed() => {
                    debug!(tokens, "Client disconnected, aborting generation");
                    crate::metrics::record_streamed_tokens(tokens);
                    return Err(AppError::Cancelled);
                }
                next = tokio::time::timeout(wait, stream.next()) => next,
            };

            match next {
                Err(_) => {
                    crate::metrics::record_streamed_tokens(tokens);
                    return Err(AppError::GenerationTimeout {
                        timeout_ms: wait.as_millis() as u64,
                    });
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    crate::metrics::record_streamed_tokens(tokens);
                    return Err(e);
                }
                Ok(Some(Ok(token))) => {
                    if token.is_empty() {
                        continue;
                    }
                    answer.push_str(&token);
                    tokens += 1;
                    sink.send(StreamEvent::token(token)).await?;
                }
            }
        }

        crate::metrics::record_streamed_tokens(tokens);
        debug!(tokens, chars = answer.len(), "Answer streamed");
        Ok(answer)
    }
}
