//! Embedding backend
//!
//! Batches inputs up to `batch_size`, caps concurrent requests with a
//! semaphore, and wraps query-side texts in the instruction format the
//! embedding models expect. vLLM endpoints do not accept the `dimensions`
//! parameter, so truncation to the configured dimensionality happens client
//! side, followed by re-normalization.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use evermem_config::{Provider, VectorizeSettings};

use crate::{LlmError, Result};

const DEFAULT_QUERY_INSTRUCTION: &str =
    "Given a search query, retrieve relevant passages that answer the query";

/// Embedding capability.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one document-side text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed one query-side text, wrapped with an instruction.
    async fn embed_query(&self, text: &str, instruction: Option<&str>) -> Result<Vec<f32>>;

    /// Embed a batch of document-side texts, preserving order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn model_name(&self) -> &str;
}

/// OpenAI-compatible `/embeddings` backend.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    settings: VectorizeSettings,
    base_url: String,
    api_key: String,
    semaphore: Arc<Semaphore>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(settings: VectorizeSettings) -> Result<Self> {
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
            "embedder initialized"
        );
        Ok(Self {
            client,
            settings,
            base_url,
            api_key,
            semaphore,
        })
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.settings.model.is_empty() {
            return Err(LlmError::Configuration(
                "embedding model is not configured".to_string(),
            ));
        }

        let mut body = json!({
            "model": self.settings.model,
            "input": inputs,
            "encoding_format": self.settings.encoding_format,
        });
        // vLLM rejects the dimensions parameter; truncation happens below.
        if self.settings.dimensions > 0 && self.settings.provider != Provider::Vllm {
            body["dimensions"] = json!(self.settings.dimensions);
        }

        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
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
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: EmbeddingResponse = resp.json().await?;
                    if parsed.data.is_empty() {
                        return Err(LlmError::InvalidResponse(
                            "embedding response has no data".to_string(),
                        ));
                    }
                    return Ok(parsed
                        .data
                        .into_iter()
                        .map(|d| self.normalize(d.embedding))
                        .collect());
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    tracing::warn!(status, attempt, "embedding request returned error status");
                    last_err = LlmError::Api { status, body: text };
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "embedding request failed");
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

    /// Truncate to the configured dimensionality and re-normalize so cosine
    /// similarity stays meaningful.
    fn normalize(&self, mut embedding: Vec<f32>) -> Vec<f32> {
        let dims = self.settings.dimensions;
        if dims > 0 && embedding.len() > dims {
            embedding.truncate(dims);
            let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
            if norm > 0.0 {
                for v in &mut embedding {
                    *v /= norm;
                }
            }
        }
        embedding
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut result = self.request(&[text.to_string()]).await?;
        Ok(result.remove(0))
    }

    async fn embed_query(&self, text: &str, instruction: Option<&str>) -> Result<Vec<f32>> {
        let instruction = instruction.unwrap_or(DEFAULT_QUERY_INSTRUCTION);
        let wrapped = format!("Instruct: {instruction}\nQuery: {text}");
        let mut result = self.request(&[wrapped]).await?;
        Ok(result.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let batch_size = self.settings.batch_size.max(1);
        if texts.len() <= batch_size {
            return self.request(texts).await;
        }

        let mut embeddings = Vec::with_capacity(texts.len());
        for (i, chunk) in texts.chunks(batch_size).enumerate() {
            embeddings.extend(self.request(chunk).await?);
            // Pace consecutive batches to stay under provider rate limits.
            if (i + 1) * batch_size < texts.len() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        Ok(embeddings)
    }

    fn model_name(&self) -> &str {
        &self.settings.model
    }
}
