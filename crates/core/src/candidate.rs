//! Uniform retrieval candidate shape
//!
//! Every backing store returns hits in its own format; adapters at the
//! repository boundary populate one `Candidate` product type so the engine
//! never probes record shapes at runtime.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Which retrieval branch(es) to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    Embedding,
    Bm25,
    Rrf,
}

impl RetrievalMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RetrievalMode::Embedding => "embedding",
            RetrievalMode::Bm25 => "bm25",
            RetrievalMode::Rrf => "rrf",
        }
    }

    pub fn wants_dense(self) -> bool {
        matches!(self, RetrievalMode::Embedding | RetrievalMode::Rrf)
    }

    pub fn wants_lexical(self) -> bool {
        matches!(self, RetrievalMode::Bm25 | RetrievalMode::Rrf)
    }
}

/// Which memory collection a retrieval targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Episode,
    EventLog,
    Foresight,
    Profile,
}

impl DataSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DataSource::Episode => "episode",
            DataSource::EventLog => "event_log",
            DataSource::Foresight => "foresight",
            DataSource::Profile => "profile",
        }
    }
}

/// A uniform record used during retrieval and returned to callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Candidate {
    pub score: f32,
    pub event_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub subject: String,
    /// Narrative content: `episode` for the episode source, `content` for
    /// foresight, joined `atomic_fact` for event logs.
    #[serde(default)]
    pub episode: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub evidence: String,
    #[serde(default)]
    pub atomic_fact: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<FixedOffset>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<FixedOffset>>,
}

impl Candidate {
    /// Text used when the candidate becomes a rerank document, preferring
    /// the richest field available.
    pub fn rerank_text(&self) -> &str {
        if !self.episode.is_empty() {
            &self.episode
        } else if !self.summary.is_empty() {
            &self.summary
        } else {
            &self.subject
        }
    }
}

/// Metadata describing one retrieval call, returned next to the candidates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalMetadata {
    pub retrieval_mode: String,
    #[serde(default)]
    pub data_source: String,
    #[serde(default)]
    pub embedding_candidates: usize,
    #[serde(default)]
    pub bm25_candidates: usize,
    #[serde(default)]
    pub final_count: usize,
    #[serde(default)]
    pub total_latency_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    // Agentic-loop extras.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_sufficient: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_info: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refined_queries: Option<Vec<String>>,
    #[serde(default)]
    pub round1_count: usize,
    #[serde(default)]
    pub round2_count: usize,
    #[serde(default)]
    pub is_multi_round: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

/// The `{memories, count, metadata}` shape every retrieval entry point
/// returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub memories: Vec<Candidate>,
    pub count: usize,
    pub metadata: RetrievalMetadata,
}

impl RetrievalResult {
    pub fn empty(mode: &str, source: &str) -> Self {
        Self {
            memories: Vec::new(),
            count: 0,
            metadata: RetrievalMetadata {
                retrieval_mode: mode.to_string(),
                data_source: source.to_string(),
                ..Default::default()
            },
        }
    }
}
