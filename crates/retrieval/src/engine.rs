//! Lightweight hybrid retrieval
//!
//! One entry point dispatches on data source: profiles resolve by direct
//! lookup; episodes, event logs and foresights run dense and/or lexical
//! searches against their repositories, fused with RRF when both branches
//! are requested. Scores reaching this engine are always cosine similarity;
//! the repository adapters normalize store-specific metrics.

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use evermem_core::repository::{DenseHit, DenseQuery, LexicalHit, LexicalQuery};
use evermem_core::{
    Candidate, DataSource, DenseStore, LexicalStore, MemCellStore, RetrievalMetadata,
    RetrievalMode, UserProfileStore,
};
use evermem_core::candidate::RetrievalResult;
use evermem_llm::Embedder;

use crate::rrf::{reciprocal_rank_fusion, DEFAULT_RRF_K};
use crate::tokenize::tokenize_query;
use crate::{RetrievalError, Result};

const DENSE_LIMIT_MIN: usize = 1000;
const DENSE_LIMIT_MAX: usize = 16384;
const LEXICAL_SIZE_MIN: usize = 100;

/// Repository handles per data source.
#[derive(Clone)]
pub struct Stores {
    pub episode_dense: Arc<dyn DenseStore>,
    pub episode_lexical: Arc<dyn LexicalStore>,
    pub event_log_dense: Arc<dyn DenseStore>,
    pub event_log_lexical: Arc<dyn LexicalStore>,
    pub foresight_dense: Option<Arc<dyn DenseStore>>,
    pub foresight_lexical: Option<Arc<dyn LexicalStore>>,
    pub user_profiles: Arc<dyn UserProfileStore>,
    pub memcells: Arc<dyn MemCellStore>,
}

/// Parameters of one lightweight retrieval.
#[derive(Debug, Clone)]
pub struct RetrieveOptions {
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub time_range_days: i64,
    pub top_k: usize,
    pub retrieval_mode: RetrievalMode,
    pub data_source: DataSource,
    pub current_time: Option<DateTime<FixedOffset>>,
    /// Cosine similarity threshold for the dense branch.
    pub radius: Option<f32>,
}

impl Default for RetrieveOptions {
    fn default() -> Self {
        Self {
            user_id: None,
            group_id: None,
            time_range_days: 365,
            top_k: 20,
            retrieval_mode: RetrievalMode::Rrf,
            data_source: DataSource::Episode,
            current_time: None,
            radius: None,
        }
    }
}

/// The hybrid retrieval engine.
pub struct RetrievalEngine {
    stores: Stores,
    embedder: Arc<dyn Embedder>,
}

impl RetrievalEngine {
    pub fn new(stores: Stores, embedder: Arc<dyn Embedder>) -> Self {
        Self { stores, embedder }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Lightweight retrieval. Failures never propagate: the result carries
    /// `metadata.error` and an empty list instead.
    pub async fn retrieve_lightweight(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> RetrievalResult {
        let started = Instant::now();
        let result = match options.data_source {
            DataSource::Profile => self.retrieve_profile(options, started).await,
            _ => self.retrieve_from_stores(query, options, started).await,
        };
        match result {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "lightweight retrieval failed");
                let mut out = RetrievalResult::empty(
                    options.retrieval_mode.as_str(),
                    options.data_source.as_str(),
                );
                out.metadata.error = Some(e.to_string());
                out.metadata.total_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                out
            }
        }
    }

    /// Direct lookup of the latest profile version; the query is ignored.
    async fn retrieve_profile(
        &self,
        options: &RetrieveOptions,
        started: Instant,
    ) -> Result<RetrievalResult> {
        let (user_id, group_id) = match (&options.user_id, &options.group_id) {
            (Some(user_id), Some(group_id)) => (user_id, group_id),
            _ => {
                return Err(RetrievalError::InvalidParameter(
                    "user_id and group_id are required for the profile source".to_string(),
                ))
            }
        };

        let mut memories = Vec::new();
        if let Some(profile) = self
            .stores
            .user_profiles
            .find_latest(user_id, group_id)
            .await?
        {
            let mut metadata = std::collections::BTreeMap::new();
            metadata.insert(
                "profile".to_string(),
                serde_json::to_value(&profile).unwrap_or(Value::Null),
            );
            metadata.insert("version".to_string(), Value::from(profile.version));
            memories.push(Candidate {
                score: 1.0,
                event_id: format!("profile:{user_id}:{group_id}:{}", profile.version),
                user_id: user_id.clone(),
                group_id: group_id.clone(),
                timestamp: profile.updated_at,
                metadata,
                ..Default::default()
            });
        }
        memories.truncate(options.top_k);

        Ok(RetrievalResult {
            count: memories.len(),
            metadata: RetrievalMetadata {
                retrieval_mode: "direct".to_string(),
                data_source: "profile".to_string(),
                final_count: memories.len(),
                total_latency_ms: started.elapsed().as_secs_f64() * 1000.0,
                ..Default::default()
            },
            memories,
        })
    }

    fn dense_store(&self, source: DataSource) -> Option<Arc<dyn DenseStore>> {
        match source {
            DataSource::Episode => Some(Arc::clone(&self.stores.episode_dense)),
            DataSource::EventLog => Some(Arc::clone(&self.stores.event_log_dense)),
            DataSource::Foresight => self.stores.foresight_dense.clone(),
            DataSource::Profile => None,
        }
    }

    fn lexical_store(&self, source: DataSource) -> Option<Arc<dyn LexicalStore>> {
        match source {
            DataSource::Episode => Some(Arc::clone(&self.stores.episode_lexical)),
            DataSource::EventLog => Some(Arc::clone(&self.stores.event_log_lexical)),
            DataSource::Foresight => self.stores.foresight_lexical.clone(),
            DataSource::Profile => None,
        }
    }

    fn dense_hit_to_candidate(hit: DenseHit, source: DataSource) -> Candidate {
        let subject = hit
            .metadata
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let summary = hit
            .metadata
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Candidate {
            score: hit.score,
            event_id: hit.id,
            user_id: hit.user_id,
            group_id: hit.group_id,
            timestamp: hit.timestamp,
            subject,
            // The narrative field is filled from whatever the source
            // supplies: episode text, foresight content, or an atomic fact.
            episode: hit.content.clone(),
            summary,
            evidence: if source == DataSource::Foresight {
                hit.evidence
            } else {
                String::new()
            },
            atomic_fact: if source == DataSource::EventLog {
                hit.content
            } else {
                String::new()
            },
            metadata: hit.metadata,
            start_time: hit.start_time,
            end_time: hit.end_time,
        }
    }

    fn lexical_hit_to_candidate(hit: LexicalHit, source: DataSource) -> Candidate {
        let episode = match source {
            DataSource::Episode => hit.episode.clone(),
            DataSource::Foresight => hit.foresight.clone(),
            DataSource::EventLog => hit.atomic_fact.clone(),
            DataSource::Profile => String::new(),
        };
        let start_time = hit
            .metadata
            .get("start_time")
            .and_then(evermem_core::time::parse_flexible);
        let end_time = hit
            .metadata
            .get("end_time")
            .and_then(evermem_core::time::parse_flexible);
        Candidate {
            score: hit.score,
            event_id: hit.event_id,
            user_id: hit.user_id,
            group_id: hit.group_id,
            timestamp: hit.timestamp,
            subject: String::new(),
            episode,
            summary: String::new(),
            evidence: hit.evidence,
            atomic_fact: hit.atomic_fact,
            metadata: hit.metadata,
            start_time,
            end_time,
        }
    }

    async fn retrieve_from_stores(
        &self,
        query: &str,
        options: &RetrieveOptions,
        started: Instant,
    ) -> Result<RetrievalResult> {
        let source = options.data_source;
        let mode = options.retrieval_mode;

        // Dense branch.
        let mut dense_candidates: Vec<Candidate> = Vec::new();
        if mode.wants_dense() {
            let store = self.dense_store(source).ok_or_else(|| {
                RetrievalError::InvalidParameter(format!(
                    "no dense store configured for {}",
                    source.as_str()
                ))
            })?;
            let query_vector = self.embedder.embed_query(query, None).await?;
            let limit = (options.top_k * 200).clamp(DENSE_LIMIT_MIN, DENSE_LIMIT_MAX);
            tracing::debug!(
                data_source = source.as_str(),
                limit,
                radius = ?options.radius,
                "dense retrieval"
            );
            let hits = store
                .vector_search(DenseQuery {
                    query_vector,
                    user_id: options.user_id.clone(),
                    group_id: options.group_id.clone(),
                    start_time: None,
                    end_time: None,
                    current_time: if source == DataSource::Foresight {
                        options.current_time
                    } else {
                        None
                    },
                    limit,
                    radius: options.radius,
                })
                .await?;
            dense_candidates = hits
                .into_iter()
                .map(|hit| Self::dense_hit_to_candidate(hit, source))
                .collect();
            dense_candidates.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        let embedding_count = dense_candidates.len();

        // Lexical branch.
        let mut lexical_candidates: Vec<Candidate> = Vec::new();
        if mode.wants_lexical() {
            let store = self.lexical_store(source).ok_or_else(|| {
                RetrievalError::InvalidParameter(format!(
                    "no lexical store configured for {}",
                    source.as_str()
                ))
            })?;
            let tokens = tokenize_query(query);
            let size = (options.top_k * 10).max(LEXICAL_SIZE_MIN);
            tracing::debug!(
                data_source = source.as_str(),
                tokens = ?tokens,
                size,
                "lexical retrieval"
            );
            let hits = store
                .multi_search(LexicalQuery {
                    query: tokens,
                    user_id: options.user_id.clone(),
                    group_id: options.group_id.clone(),
                    size,
                    from: 0,
                    date_range: None,
                    // The validity filter only rides along when the caller
                    // supplied a reference time.
                    current_time: if source == DataSource::Foresight {
                        options.current_time
                    } else {
                        None
                    },
                })
                .await?;
            lexical_candidates = hits
                .into_iter()
                .map(|hit| Self::lexical_hit_to_candidate(hit, source))
                .collect();
        }
        let bm25_count = lexical_candidates.len();

        // Combine per mode.
        let mut memories = match mode {
            RetrievalMode::Embedding => {
                dense_candidates.truncate(options.top_k);
                dense_candidates
            }
            RetrievalMode::Bm25 => {
                lexical_candidates.truncate(options.top_k);
                lexical_candidates
            }
            RetrievalMode::Rrf => {
                let mut fused =
                    reciprocal_rank_fusion(&dense_candidates, &lexical_candidates, DEFAULT_RRF_K);
                fused.truncate(options.top_k);
                fused
            }
        };

        memories = Self::filter_foresight_by_time(memories, source, options.current_time);

        let metadata = RetrievalMetadata {
            retrieval_mode: mode.as_str().to_string(),
            data_source: source.as_str().to_string(),
            embedding_candidates: embedding_count,
            bm25_candidates: bm25_count,
            final_count: memories.len(),
            total_latency_ms: started.elapsed().as_secs_f64() * 1000.0,
            ..Default::default()
        };

        Ok(RetrievalResult {
            count: memories.len(),
            memories,
            metadata,
        })
    }

    /// Drop foresight candidates whose validity window excludes
    /// `current_time`.
    fn filter_foresight_by_time(
        memories: Vec<Candidate>,
        source: DataSource,
        current_time: Option<DateTime<FixedOffset>>,
    ) -> Vec<Candidate> {
        let Some(current) = current_time else {
            return memories;
        };
        if source != DataSource::Foresight {
            return memories;
        }
        memories
            .into_iter()
            .filter(|candidate| {
                if let Some(start) = candidate.start_time {
                    if start > current {
                        return false;
                    }
                }
                if let Some(end) = candidate.end_time {
                    if end < current {
                        return false;
                    }
                }
                true
            })
            .collect()
    }
}
