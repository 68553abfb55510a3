//! LLM capability adapters
//!
//! Uniform `chat`/`generate`, `embed` and `rerank` contracts over
//! OpenAI-compatible HTTP services, with retries, batching and concurrency
//! caps. Extractors and the retrieval engine depend on the traits, never on
//! the concrete backends.

pub mod chat;
pub mod embedding;
pub mod rerank;

pub use chat::{ChatMessage, ChatModel, OpenAiChatModel, Role};
pub use embedding::{Embedder, OpenAiEmbedder};
pub use rerank::{HttpReranker, RerankResult, Reranker};

use thiserror::Error;

/// LLM adapter errors.
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("generation error: {0}")]
    Generation(String),

    #[error("api error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request timed out")]
    Timeout,

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;
