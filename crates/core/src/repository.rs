//! Repository contracts for the backing stores
//!
//! The retrieval engine and the derived-memory extractors consume these
//! traits, never concrete drivers. Driver glue (connection pooling, schema
//! management) lives with the embedding application.
//!
//! Dense scores are normalized at this boundary: implementations must return
//! cosine similarity regardless of the store's native metric.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::memory::{GroupProfile, Memory, UserProfile};
use crate::types::MemCell;
use crate::CoreError;

/// Query against a dense (vector) store.
#[derive(Debug, Clone, Default)]
pub struct DenseQuery {
    pub query_vector: Vec<f32>,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub start_time: Option<DateTime<FixedOffset>>,
    pub end_time: Option<DateTime<FixedOffset>>,
    /// Validity-window reference, used by foresight collections only.
    pub current_time: Option<DateTime<FixedOffset>>,
    pub limit: usize,
    /// Cosine similarity threshold.
    pub radius: Option<f32>,
}

/// One dense-store hit, already score-normalized to cosine similarity.
#[derive(Debug, Clone, Default)]
pub struct DenseHit {
    pub id: String,
    pub score: f32,
    pub user_id: String,
    pub group_id: String,
    pub timestamp: Option<DateTime<FixedOffset>>,
    /// Narrative payload: episode text, foresight content, or an atomic fact.
    pub content: String,
    pub evidence: String,
    pub metadata: BTreeMap<String, Value>,
    pub start_time: Option<DateTime<FixedOffset>>,
    pub end_time: Option<DateTime<FixedOffset>>,
}

#[async_trait]
pub trait DenseStore: Send + Sync {
    async fn vector_search(&self, query: DenseQuery) -> Result<Vec<DenseHit>, CoreError>;
}

/// Query against a lexical (BM25) store. `query` is already tokenized.
#[derive(Debug, Clone, Default)]
pub struct LexicalQuery {
    pub query: Vec<String>,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub size: usize,
    pub from: usize,
    pub date_range: Option<(Option<DateTime<FixedOffset>>, Option<DateTime<FixedOffset>>)>,
    pub current_time: Option<DateTime<FixedOffset>>,
}

/// One lexical-store hit.
#[derive(Debug, Clone, Default)]
pub struct LexicalHit {
    pub event_id: String,
    pub score: f32,
    pub user_id: String,
    pub group_id: String,
    pub timestamp: Option<DateTime<FixedOffset>>,
    pub episode: String,
    pub foresight: String,
    pub evidence: String,
    pub atomic_fact: String,
    pub metadata: BTreeMap<String, Value>,
}

#[async_trait]
pub trait LexicalStore: Send + Sync {
    async fn multi_search(&self, query: LexicalQuery) -> Result<Vec<LexicalHit>, CoreError>;
}

/// MemCell persistence.
#[async_trait]
pub trait MemCellStore: Send + Sync {
    async fn save(&self, memcell: &MemCell) -> Result<(), CoreError>;

    async fn get_by_event_ids(
        &self,
        event_ids: &[String],
    ) -> Result<HashMap<String, MemCell>, CoreError>;
}

/// Episode (Memory record) persistence.
#[async_trait]
pub trait EpisodeStore: Send + Sync {
    async fn save(&self, memory: &Memory) -> Result<(), CoreError>;
}

/// Per-user profile persistence. The latest-version query orders by
/// `version desc` within one `(user_id, group_id)` key.
#[async_trait]
pub trait UserProfileStore: Send + Sync {
    async fn save(&self, profile: &UserProfile) -> Result<(), CoreError>;

    async fn find_latest(
        &self,
        user_id: &str,
        group_id: &str,
    ) -> Result<Option<UserProfile>, CoreError>;

    async fn find_by_user(
        &self,
        user_id: &str,
        version_range: Option<(u64, u64)>,
        limit: usize,
    ) -> Result<Vec<UserProfile>, CoreError>;

    async fn batch_get_by_user_groups(
        &self,
        pairs: &[(String, String)],
    ) -> Result<HashMap<(String, String), UserProfile>, CoreError>;
}

/// Group profile persistence.
#[async_trait]
pub trait GroupProfileStore: Send + Sync {
    async fn save(&self, profile: &GroupProfile) -> Result<(), CoreError>;

    async fn find_by_group(&self, group_id: &str) -> Result<Option<GroupProfile>, CoreError>;
}
