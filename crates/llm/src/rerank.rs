//! Rerank backend
//!
//! Documents are wrapped in the Qwen-Reranker chat template and scored by an
//! external service. Inputs are split into batches issued in parallel; a
//! failed batch contributes sentinel scores of -100.0 so the surviving
//! batches still rank.

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use evermem_config::{Provider, RerankSettings};

use crate::{LlmError, Result};

const QWEN_PREFIX: &str = "<|im_start|>system\nJudge whether the Document meets the requirements based on the Query and the Instruct provided. Note that the answer can only be \"yes\" or \"no\".<|im_end|>\n<|im_start|>user\n";
const QWEN_SUFFIX: &str = "<|im_end|>\n<|im_start|>assistant\n<think>\n\n</think>\n\n";
const DEFAULT_INSTRUCTION: &str = "Given a question and a passage, determine if the passage contains information relevant to answering the question.";
const FAILED_BATCH_SCORE: f32 = -100.0;

/// One reranked document: original index, relevance score, final rank.
#[derive(Debug, Clone, PartialEq)]
pub struct RerankResult {
    pub index: usize,
    pub relevance_score: f32,
    pub rank: usize,
}

/// Rerank capability.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score `documents` against `query` and return them ordered by
    /// descending relevance.
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        instruction: Option<&str>,
    ) -> Result<Vec<RerankResult>>;
}

/// HTTP reranker for DeepInfra and vLLM score endpoints.
pub struct HttpReranker {
    client: reqwest::Client,
    settings: RerankSettings,
    base_url: String,
    api_key: String,
    semaphore: Arc<Semaphore>,
}

impl HttpReranker {
    pub fn new(settings: RerankSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        let base_url = settings.effective_base_url();
        let api_key = settings.effective_api_key();
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_requests.max(1)));
        tracing::info!(
            provider = settings.provider.as_str(),
            model = %settings.model,
            base_url = %base_url,
            "reranker initialized"
        );
        Ok(Self {
            client,
            settings,
            base_url,
            api_key,
            semaphore,
        })
    }

    /// Qwen-Reranker chat-template wrapping for one batch.
    fn format_texts(
        &self,
        query: &str,
        documents: &[String],
        instruction: Option<&str>,
    ) -> (Vec<String>, Vec<String>) {
        let instruction = instruction.unwrap_or(DEFAULT_INSTRUCTION);
        let formatted_query =
            format!("{QWEN_PREFIX}<Instruct>: {instruction}\n<Query>: {query}\n");
        let formatted_docs = documents
            .iter()
            .map(|doc| format!("<Document>: {doc}{QWEN_SUFFIX}"))
            .collect();
        (vec![formatted_query; documents.len()], formatted_docs)
    }

    fn request_url(&self) -> String {
        let url = self.base_url.trim_end_matches('/').to_string();
        match self.settings.provider {
            Provider::Deepinfra if !url.ends_with(&self.settings.model) => {
                format!("{url}/{}", self.settings.model)
            }
            _ => url,
        }
    }

    async fn score_batch(
        &self,
        query: &str,
        documents: &[String],
        instruction: Option<&str>,
    ) -> Result<Vec<f32>> {
        let (queries, docs) = self.format_texts(query, documents, instruction);
        let body = match self.settings.provider {
            Provider::Deepinfra => json!({ "queries": queries, "documents": docs }),
            Provider::Vllm => json!({
                "model": self.settings.model,
                "text_1": queries,
                "text_2": docs,
            }),
        };

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| LlmError::Generation(e.to_string()))?;

        let mut backoff = Duration::from_secs(1);
        let attempts = self.settings.max_retries.max(1);
        let mut last_err = LlmError::Generation("no attempt made".to_string());

        for attempt in 0..attempts {
            let response = self
                .client
                .post(self.request_url())
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let value: Value = resp.json().await?;
                    return Ok(self.parse_scores(&value));
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    tracing::warn!(status, attempt, "rerank request returned error status");
                    last_err = LlmError::Api { status, body: text };
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "rerank request failed");
                    last_err = e.into();
                }
            }

            if attempt + 1 < attempts {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(last_err)
    }

    /// Normalize the provider response into a score-per-document list.
    fn parse_scores(&self, body: &Value) -> Vec<f32> {
        match self.settings.provider {
            Provider::Deepinfra => {
                if let Some(results) = body.get("results").and_then(Value::as_array) {
                    let mut indexed: Vec<(usize, f32)> = results
                        .iter()
                        .map(|item| {
                            let idx =
                                item.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                            let score = item
                                .get("relevance_score")
                                .and_then(Value::as_f64)
                                .unwrap_or(0.0) as f32;
                            (idx, score)
                        })
                        .collect();
                    indexed.sort_by_key(|(idx, _)| *idx);
                    indexed.into_iter().map(|(_, score)| score).collect()
                } else {
                    extract_plain_scores(body)
                }
            }
            Provider::Vllm => {
                if let Some(data) = body.get("data").and_then(Value::as_array) {
                    data.iter()
                        .map(|item| {
                            item.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32
                        })
                        .collect()
                } else {
                    extract_plain_scores(body)
                }
            }
        }
    }
}

fn extract_plain_scores(body: &Value) -> Vec<f32> {
    body.get("scores")
        .and_then(Value::as_array)
        .map(|scores| {
            scores
                .iter()
                .map(|s| s.as_f64().unwrap_or(0.0) as f32)
                .collect()
        })
        .unwrap_or_default()
}

/// Sort scores descending and attach original indices + ranks.
fn ranked(scores: Vec<f32>) -> Vec<RerankResult> {
    let mut indexed: Vec<(usize, f32)> = scores.into_iter().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed
        .into_iter()
        .enumerate()
        .map(|(rank, (index, relevance_score))| RerankResult {
            index,
            relevance_score,
            rank,
        })
        .collect()
}

#[async_trait]
impl Reranker for HttpReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: &[String],
        instruction: Option<&str>,
    ) -> Result<Vec<RerankResult>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let batch_size = self.settings.batch_size.max(1);
        let batches: Vec<&[String]> = documents.chunks(batch_size).collect();
        let futures = batches
            .iter()
            .map(|batch| self.score_batch(query, batch, instruction));
        let batch_results = join_all(futures).await;

        let mut all_scores = Vec::with_capacity(documents.len());
        for (i, result) in batch_results.into_iter().enumerate() {
            match result {
                Ok(mut scores) => {
                    // Pad a short batch so alignment with documents holds.
                    scores.resize(batches[i].len(), 0.0);
                    all_scores.extend(scores);
                }
                Err(e) => {
                    tracing::error!(batch = i, error = %e, "rerank batch failed");
                    all_scores.extend(std::iter::repeat(FAILED_BATCH_SCORE).take(batches[i].len()));
                }
            }
        }
        all_scores.truncate(documents.len());

        Ok(ranked(all_scores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranked_orders_by_score_descending() {
        let results = ranked(vec![0.1, 0.9, 0.5]);
        assert_eq!(results[0].index, 1);
        assert_eq!(results[0].rank, 0);
        assert_eq!(results[1].index, 2);
        assert_eq!(results[2].index, 0);
        assert_eq!(results[2].rank, 2);
    }

    #[test]
    fn qwen_wrapping_contains_template_markers() {
        let reranker = HttpReranker::new(RerankSettings::default()).unwrap();
        let docs = vec!["doc one".to_string(), "doc two".to_string()];
        let (queries, formatted) = reranker.format_texts("my query", &docs, None);
        assert_eq!(queries.len(), 2);
        assert!(queries[0].contains("<Query>: my query"));
        assert!(formatted[0].starts_with("<Document>: doc one"));
        assert!(formatted[0].ends_with(QWEN_SUFFIX));
    }

    #[test]
    fn deepinfra_results_are_sorted_back_to_input_order() {
        let reranker = HttpReranker::new(RerankSettings::default()).unwrap();
        let body = json!({
            "results": [
                {"index": 1, "relevance_score": 0.8},
                {"index": 0, "relevance_score": 0.3}
            ]
        });
        assert_eq!(reranker.parse_scores(&body), vec![0.3, 0.8]);
    }

    #[test]
    fn vllm_scores_come_from_data_array() {
        let reranker = HttpReranker::new(RerankSettings {
            provider: Provider::Vllm,
            ..Default::default()
        })
        .unwrap();
        let body = json!({"data": [{"score": 0.25}, {"score": 0.75}]});
        assert_eq!(reranker.parse_scores(&body), vec![0.25, 0.75]);
    }
}
