//! Memory extraction pipeline
//!
//! Consumes a stream of raw chat messages per group, detects conversation
//! boundaries, produces MemCells, and cascades to the derived artifacts:
//! episodes, event logs, and per-user/group profiles with strict evidence
//! provenance.

pub mod boundary;
pub mod cluster;
pub mod event_log;
pub mod episode;
pub mod group_profile;
pub mod importance;
pub mod json;
pub mod manager;
pub mod memcell;
pub mod profile;

pub use boundary::{BoundaryDetector, BoundaryResult};
pub use cluster::{ClusterAssignment, ClusterManager, ClusterOptions};
pub use episode::{EpisodeExtractRequest, EpisodeExtractor};
pub use event_log::EventLogExtractor;
pub use manager::{ExtractedMemory, MemoryManager, MemorizeRequest};
pub use memcell::{IncomingMessage, MemCellExtractRequest, MemCellExtractor};

use thiserror::Error;

/// Pipeline failures.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("LLM call failed: {0}")]
    LlmCallFailed(#[from] evermem_llm::LlmError),

    #[error("LLM output parsing failed: {0}")]
    LlmOutputParsing(String),

    #[error("LLM retries exhausted: {0}")]
    LlmRetryExhausted(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("store error: {0}")]
    Store(#[from] evermem_core::CoreError),

    #[error("prompt error: {0}")]
    Prompt(#[from] evermem_config::ConfigError),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
