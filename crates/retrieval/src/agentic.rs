//! Agentic retrieval
//!
//! LLM-in-the-loop two-round retrieval: round-1 hybrid → rerank top-K → LLM
//! sufficiency judgment → if insufficient, LLM multi-query expansion →
//! parallel retrieval → merge → final rerank. One overall deadline caps the
//! whole run; every failure path lands on the lightweight RRF fallback with
//! `retrieval_mode = "agentic_fallback"`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use evermem_config::{PromptKey, PromptRegistry};
use evermem_core::candidate::RetrievalResult;
use evermem_core::Candidate;
use evermem_llm::{ChatModel, Reranker};
use evermem_memory::json;

use crate::engine::{RetrievalEngine, RetrieveOptions};
use evermem_core::{DataSource, RetrievalMode};

/// Agentic loop configuration.
#[derive(Debug, Clone)]
pub struct AgenticOptions {
    pub round1_top_n: usize,
    pub round1_rerank_top_n: usize,
    pub num_queries: usize,
    pub round2_per_query_top_n: usize,
    pub combined_total: usize,
    pub final_top_n: usize,
    pub use_reranker: bool,
    pub sufficiency_temperature: f32,
    pub multi_query_temperature: f32,
    pub enable_multi_query: bool,
    pub timeout: Duration,
    pub fallback_on_error: bool,
}

impl Default for AgenticOptions {
    fn default() -> Self {
        Self {
            round1_top_n: 20,
            round1_rerank_top_n: 5,
            num_queries: 3,
            round2_per_query_top_n: 50,
            combined_total: 40,
            final_top_n: 20,
            use_reranker: true,
            sufficiency_temperature: 0.0,
            multi_query_temperature: 0.4,
            enable_multi_query: true,
            timeout: Duration::from_secs(60),
            fallback_on_error: true,
        }
    }
}

#[derive(Debug, Clone)]
struct SufficiencyVerdict {
    is_sufficient: bool,
    reasoning: String,
    missing_info: Vec<String>,
    /// True when the judgment itself failed and "sufficient" is only the
    /// conservative default.
    degraded: bool,
}

/// The agentic retriever.
pub struct AgenticRetriever {
    engine: Arc<RetrievalEngine>,
    chat: Arc<dyn ChatModel>,
    prompts: Arc<PromptRegistry>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl AgenticRetriever {
    pub fn new(
        engine: Arc<RetrievalEngine>,
        chat: Arc<dyn ChatModel>,
        prompts: Arc<PromptRegistry>,
        reranker: Option<Arc<dyn Reranker>>,
    ) -> Self {
        Self {
            engine,
            chat,
            prompts,
            reranker,
        }
    }

    /// `[memory i]\ntime: …\ncontent: …\nrelevance: score` blocks for the
    /// judgment prompts.
    fn format_documents(candidates: &[Candidate]) -> String {
        candidates
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let time = c
                    .timestamp
                    .map(|ts| ts.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string());
                format!(
                    "[memory {}]\ntime: {}\ncontent: {}\nrelevance: {:.4}",
                    i + 1,
                    time,
                    c.rerank_text(),
                    c.score
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Rerank candidates down to `top_n`, or truncate when no reranker is
    /// configured. A rerank failure degrades to the original order.
    async fn rerank_top(
        &self,
        query: &str,
        candidates: &[Candidate],
        top_n: usize,
    ) -> Vec<Candidate> {
        let Some(reranker) = &self.reranker else {
            return candidates.iter().take(top_n).cloned().collect();
        };
        let documents: Vec<String> = candidates
            .iter()
            .map(|c| c.rerank_text().to_string())
            .collect();
        match reranker.rerank(query, &documents, None).await {
            Ok(results) => results
                .into_iter()
                .take(top_n)
                .filter_map(|r| {
                    candidates.get(r.index).map(|c| {
                        let mut c = c.clone();
                        c.score = r.relevance_score;
                        c
                    })
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "rerank failed, keeping original order");
                let mut sorted = candidates.to_vec();
                sorted.sort_by(|a, b| {
                    b.score
                        .partial_cmp(&a.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                sorted.truncate(top_n);
                sorted
            }
        }
    }

    /// Sufficiency judgment over the top candidates. Timeout or parse
    /// failure answers "sufficient" so the loop degrades to round-1.
    async fn check_sufficiency(
        &self,
        query: &str,
        top: &[Candidate],
        options: &AgenticOptions,
    ) -> SufficiencyVerdict {
        let conservative = SufficiencyVerdict {
            is_sufficient: true,
            reasoning: "sufficiency check unavailable, defaulting to sufficient".to_string(),
            missing_info: Vec::new(),
            degraded: true,
        };

        let documents = Self::format_documents(top);
        let prompt = match self.prompts.render(
            PromptKey::SufficiencyCheck,
            &[("query", query), ("documents", documents.as_str())],
        ) {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::warn!(error = %e, "sufficiency prompt render failed");
                return conservative;
            }
        };

        let reply = match self
            .chat
            .generate_with(&prompt, Some(options.sufficiency_temperature), None)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(error = %e, "sufficiency check failed, assuming sufficient");
                return conservative;
            }
        };
        let value = match json::parse_reply(&reply) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "sufficiency reply unparseable, assuming sufficient");
                return conservative;
            }
        };

        SufficiencyVerdict {
            is_sufficient: value["is_sufficient"].as_bool().unwrap_or(true),
            reasoning: value["reasoning"].as_str().unwrap_or_default().to_string(),
            missing_info: value["missing_information"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
            degraded: false,
        }
    }

    /// Multi-query expansion. Queries outside 5..=300 chars or equal to the
    /// original are dropped; an empty survivor set falls back to the
    /// original query.
    async fn generate_queries(
        &self,
        query: &str,
        top: &[Candidate],
        missing_info: &[String],
        options: &AgenticOptions,
    ) -> Vec<String> {
        let documents = Self::format_documents(top);
        let missing = missing_info.join(", ");
        let num = options.num_queries.to_string();
        let prompt = match self.prompts.render(
            PromptKey::MultiQueryGeneration,
            &[
                ("query", query),
                ("documents", documents.as_str()),
                ("missing_info", missing.as_str()),
                ("num_queries", num.as_str()),
            ],
        ) {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::warn!(error = %e, "multi-query prompt render failed");
                return vec![query.to_string()];
            }
        };

        let refined = match self
            .chat
            .generate_with(&prompt, Some(options.multi_query_temperature), None)
            .await
            .map_err(|e| e.to_string())
            .and_then(|reply| json::parse_reply(&reply).map_err(|e| e.to_string()))
        {
            Ok(value) => value["queries"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
            Err(e) => {
                tracing::warn!(error = %e, "multi-query generation failed");
                Vec::new()
            }
        };

        let filtered: Vec<String> = refined
            .into_iter()
            .filter(|q| {
                let len = q.chars().count();
                (5..=300).contains(&len) && q != query
            })
            .take(options.num_queries)
            .collect();
        if filtered.is_empty() {
            vec![query.to_string()]
        } else {
            filtered
        }
    }

    /// Agentic retrieval with fallback.
    pub async fn retrieve(
        &self,
        query: &str,
        base: &RetrieveOptions,
        options: &AgenticOptions,
    ) -> RetrievalResult {
        let started = Instant::now();
        let run = self.run(query, base, options, started);
        match tokio::time::timeout(options.timeout, run).await {
            Ok(Ok(result)) => result,
            Ok(Err(reason)) => {
                if options.fallback_on_error {
                    self.fallback(query, base, &reason, started).await
                } else {
                    let mut result = RetrievalResult::empty("agentic", "episode");
                    result.metadata.error = Some(reason);
                    result.metadata.total_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    result
                }
            }
            Err(_) => {
                self.fallback(query, base, "agentic retrieval timed out", started)
                    .await
            }
        }
    }

    async fn run(
        &self,
        query: &str,
        base: &RetrieveOptions,
        options: &AgenticOptions,
        started: Instant,
    ) -> std::result::Result<RetrievalResult, String> {
        tracing::info!(query = %query.chars().take(60).collect::<String>(), "agentic retrieval");

        // Round 1: hybrid RRF over episodes.
        let round1_options = RetrieveOptions {
            retrieval_mode: RetrievalMode::Rrf,
            data_source: DataSource::Episode,
            top_k: options.round1_top_n,
            ..base.clone()
        };
        let round1 = self.engine.retrieve_lightweight(query, &round1_options).await;
        if let Some(error) = &round1.metadata.error {
            return Err(format!("round 1 failed: {error}"));
        }
        let round1_memories = round1.memories.clone();
        tracing::info!(count = round1_memories.len(), "round 1 complete");

        let mut metadata = evermem_core::RetrievalMetadata {
            retrieval_mode: "agentic".to_string(),
            data_source: "episode".to_string(),
            round1_count: round1_memories.len(),
            ..Default::default()
        };

        if round1_memories.is_empty() {
            metadata.total_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            return Ok(RetrievalResult {
                memories: Vec::new(),
                count: 0,
                metadata,
            });
        }

        // Rerank round-1 down to the judgment window.
        let top_for_llm = if options.use_reranker {
            self.rerank_top(query, &round1_memories, options.round1_rerank_top_n)
                .await
        } else {
            round1_memories
                .iter()
                .take(options.round1_rerank_top_n)
                .cloned()
                .collect()
        };

        // Sufficiency judgment.
        let verdict = self.check_sufficiency(query, &top_for_llm, options).await;
        metadata.is_sufficient = Some(verdict.is_sufficient);
        metadata.reasoning = Some(verdict.reasoning.clone());
        metadata.missing_info = Some(verdict.missing_info.clone());
        tracing::info!(sufficient = verdict.is_sufficient, "sufficiency verdict");

        if verdict.is_sufficient {
            // A failed judgment degrades to round-1 and is labeled as a
            // fallback so callers can tell the two apart.
            if verdict.degraded {
                metadata.retrieval_mode = "agentic_fallback".to_string();
                metadata.fallback_reason = Some(verdict.reasoning.clone());
            }
            metadata.final_count = round1_memories.len();
            metadata.total_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            return Ok(RetrievalResult {
                count: round1_memories.len(),
                memories: round1_memories,
                metadata,
            });
        }

        // Round 2: refined queries in parallel.
        metadata.is_multi_round = true;
        let refined_queries = if options.enable_multi_query {
            self.generate_queries(query, &top_for_llm, &verdict.missing_info, options)
                .await
        } else {
            vec![query.to_string()]
        };
        metadata.refined_queries = Some(refined_queries.clone());
        tracing::info!(queries = refined_queries.len(), "round 2 starting");

        let round2_options = RetrieveOptions {
            retrieval_mode: RetrievalMode::Rrf,
            data_source: DataSource::Episode,
            top_k: options.round2_per_query_top_n,
            ..base.clone()
        };
        let round2_futures = refined_queries
            .iter()
            .map(|q| self.engine.retrieve_lightweight(q, &round2_options));
        let round2_results = futures::future::join_all(round2_futures).await;

        let mut round2_memories: Vec<Candidate> = Vec::new();
        for (i, result) in round2_results.into_iter().enumerate() {
            if let Some(error) = &result.metadata.error {
                tracing::error!(query_index = i, error = %error, "round 2 query failed");
                continue;
            }
            round2_memories.extend(result.memories);
        }

        // Merge: round-1 order preserved, unique round-2 appended up to the
        // combined cap.
        let round1_ids: std::collections::HashSet<&str> = round1_memories
            .iter()
            .map(|c| c.event_id.as_str())
            .collect();
        let mut combined = round1_memories.clone();
        let mut seen: std::collections::HashSet<String> = std::collections::HashSet::new();
        for candidate in round2_memories {
            if combined.len() >= options.combined_total {
                break;
            }
            if round1_ids.contains(candidate.event_id.as_str())
                || !seen.insert(candidate.event_id.clone())
            {
                continue;
            }
            combined.push(candidate);
        }
        metadata.round2_count = combined.len().saturating_sub(round1_memories.len());
        tracing::info!(
            round1 = round1_memories.len(),
            round2_unique = metadata.round2_count,
            total = combined.len(),
            "merge complete"
        );

        // Final rerank with the original query.
        let final_memories = if options.use_reranker && !combined.is_empty() {
            self.rerank_top(query, &combined, options.final_top_n).await
        } else {
            combined.truncate(options.final_top_n);
            combined
        };

        metadata.final_count = final_memories.len();
        metadata.total_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        Ok(RetrievalResult {
            count: final_memories.len(),
            memories: final_memories,
            metadata,
        })
    }

    /// Lightweight RRF fallback with the failure recorded on the metadata.
    async fn fallback(
        &self,
        query: &str,
        base: &RetrieveOptions,
        reason: &str,
        started: Instant,
    ) -> RetrievalResult {
        tracing::warn!(reason, "falling back to lightweight retrieval");
        let fallback_options = RetrieveOptions {
            retrieval_mode: RetrievalMode::Rrf,
            data_source: DataSource::Episode,
            ..base.clone()
        };
        let mut result = self
            .engine
            .retrieve_lightweight(query, &fallback_options)
            .await;
        result.metadata.retrieval_mode = "agentic_fallback".to_string();
        result.metadata.fallback_reason = Some(reason.to_string());
        if result.metadata.is_sufficient.is_none() {
            result.metadata.is_sufficient = Some(true);
        }
        result.metadata.is_multi_round = false;
        result.metadata.total_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use evermem_core::Locale;
    use evermem_llm::{LlmError, RerankResult};

    use crate::engine::tests::{dense_hit, engine_with, lexical_hit};

    struct ScriptedChat {
        sufficiency: String,
        multi_query: String,
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn generate_with(
            &self,
            prompt: &str,
            _temperature: Option<f32>,
            _max_tokens: Option<u32>,
        ) -> std::result::Result<String, LlmError> {
            if prompt.contains("alternative search queries") || prompt.contains("改进查询") {
                Ok(self.multi_query.clone())
            } else {
                Ok(self.sufficiency.clone())
            }
        }

        async fn chat(
            &self,
            _messages: &[evermem_llm::ChatMessage],
        ) -> std::result::Result<String, LlmError> {
            Ok(self.sufficiency.clone())
        }
    }

    struct FailingChat;

    #[async_trait]
    impl ChatModel for FailingChat {
        async fn generate_with(
            &self,
            _prompt: &str,
            _temperature: Option<f32>,
            _max_tokens: Option<u32>,
        ) -> std::result::Result<String, LlmError> {
            Err(LlmError::Timeout)
        }

        async fn chat(
            &self,
            _messages: &[evermem_llm::ChatMessage],
        ) -> std::result::Result<String, LlmError> {
            Err(LlmError::Timeout)
        }
    }

    struct IdentityReranker;

    #[async_trait]
    impl Reranker for IdentityReranker {
        async fn rerank(
            &self,
            _query: &str,
            documents: &[String],
            _instruction: Option<&str>,
        ) -> std::result::Result<Vec<RerankResult>, LlmError> {
            Ok((0..documents.len())
                .map(|i| RerankResult {
                    index: i,
                    relevance_score: 1.0 - i as f32 * 0.01,
                    rank: i,
                })
                .collect())
        }
    }

    fn retriever(chat: Arc<dyn ChatModel>) -> AgenticRetriever {
        let engine = Arc::new(engine_with(
            vec![
                dense_hit("d1", 0.9, "alpha memory"),
                dense_hit("d2", 0.8, "beta memory"),
            ],
            vec![lexical_hit("l1", 7.0, "gamma memory")],
            vec![],
        ));
        AgenticRetriever::new(
            engine,
            chat,
            Arc::new(PromptRegistry::new(Locale::En)),
            Some(Arc::new(IdentityReranker)),
        )
    }

    #[tokio::test]
    async fn sufficient_round1_returns_directly() {
        let chat = Arc::new(ScriptedChat {
            sufficiency:
                r#"{"is_sufficient": true, "reasoning": "plenty", "missing_information": []}"#
                    .to_string(),
            multi_query: "{}".to_string(),
        });
        let retriever = retriever(chat);
        let result = retriever
            .retrieve(
                "what is alpha",
                &RetrieveOptions::default(),
                &AgenticOptions::default(),
            )
            .await;
        assert_eq!(result.metadata.retrieval_mode, "agentic");
        assert_eq!(result.metadata.is_sufficient, Some(true));
        assert!(!result.metadata.is_multi_round);
        assert_eq!(result.metadata.round1_count, 3);
        assert_eq!(result.count, 3);
    }

    #[tokio::test]
    async fn insufficient_triggers_round_two() {
        let chat = Arc::new(ScriptedChat {
            sufficiency: r#"{"is_sufficient": false, "reasoning": "missing dates", "missing_information": ["dates"]}"#.to_string(),
            multi_query: r#"{"queries": ["when did alpha happen", "alpha timeline details"], "reasoning": "angles"}"#.to_string(),
        });
        let retriever = retriever(chat);
        let result = retriever
            .retrieve(
                "what is alpha",
                &RetrieveOptions::default(),
                &AgenticOptions::default(),
            )
            .await;
        assert!(result.metadata.is_multi_round);
        assert_eq!(
            result.metadata.refined_queries.as_ref().unwrap().len(),
            2
        );
        assert_eq!(result.metadata.is_sufficient, Some(false));
        assert!(result.count > 0);
    }

    #[tokio::test]
    async fn llm_failure_degrades_to_labeled_fallback() {
        let retriever = retriever(Arc::new(FailingChat));
        let result = retriever
            .retrieve(
                "query",
                &RetrieveOptions::default(),
                &AgenticOptions::default(),
            )
            .await;
        // Sufficiency call failed: conservative sufficient, round-1
        // returned, labeled as a fallback.
        assert_eq!(result.metadata.is_sufficient, Some(true));
        assert!(!result.metadata.is_multi_round);
        assert_eq!(result.metadata.retrieval_mode, "agentic_fallback");
        assert!(result.metadata.fallback_reason.is_some());
        assert_eq!(result.count, 3);
    }

    #[tokio::test]
    async fn refined_queries_filter_out_bad_candidates() {
        let chat = Arc::new(ScriptedChat {
            sufficiency: r#"{"is_sufficient": false, "reasoning": "", "missing_information": []}"#
                .to_string(),
            // One too short, one equal to the original, one valid.
            multi_query: r#"{"queries": ["ok?", "what is alpha", "alpha release timeline"], "reasoning": ""}"#
                .to_string(),
        });
        let retriever = retriever(chat);
        let result = retriever
            .retrieve(
                "what is alpha",
                &RetrieveOptions::default(),
                &AgenticOptions::default(),
            )
            .await;
        assert_eq!(
            result.metadata.refined_queries,
            Some(vec!["alpha release timeline".to_string()])
        );
    }
}
