//! Hybrid retrieval engine
//!
//! Dense + lexical retrieval with Reciprocal Rank Fusion, rerank
//! integration, group-aware aggregation, and the LLM-in-the-loop agentic
//! path with sufficiency judgment and multi-query expansion.

pub mod agentic;
pub mod engine;
pub mod fetch;
pub mod grouping;
pub mod rrf;
pub mod tokenize;

pub use agentic::{AgenticOptions, AgenticRetriever};
pub use engine::{RetrievalEngine, RetrieveOptions, Stores};
pub use fetch::{FetchMemResult, FetchService};
pub use grouping::{GroupedResult, group_by_group_id};
pub use rrf::{multi_rrf_fusion, reciprocal_rank_fusion};
pub use tokenize::tokenize_query;

use thiserror::Error;

/// Retrieval failures. Entry points catch these and return empty results
/// with `metadata.error` rather than propagating.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("store error: {0}")]
    Store(#[from] evermem_core::CoreError),

    #[error("llm error: {0}")]
    Llm(#[from] evermem_llm::LlmError),

    #[error("prompt error: {0}")]
    Prompt(#[from] evermem_config::ConfigError),
}

pub type Result<T> = std::result::Result<T, RetrievalError>;
