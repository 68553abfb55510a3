//! Chat / generation backend
//!
//! `ChatModel` is the capability the extractors consume. `OpenAiChatModel`
//! talks to any OpenAI-compatible `/chat/completions` endpoint with bounded
//! retries and a process-wide concurrency cap.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use evermem_config::LlmSettings;

use crate::{LlmError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Chat/generation capability.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Single-prompt generation.
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_with(prompt, None, None).await
    }

    /// Generation with per-call temperature/max_tokens overrides.
    async fn generate_with(
        &self,
        prompt: &str,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<String>;

    /// Multi-message chat completion.
    async fn chat(&self, messages: &[ChatMessage]) -> Result<String>;
}

/// OpenAI-compatible chat backend.
#[derive(Debug)]
pub struct OpenAiChatModel {
    client: reqwest::Client,
    settings: LlmSettings,
    semaphore: Arc<Semaphore>,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

impl OpenAiChatModel {
    pub fn new(settings: LlmSettings) -> Result<Self> {
        if settings.base_url.is_empty() {
            return Err(LlmError::Configuration(
                "LLM_BASE_URL is not configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        let semaphore = Arc::new(Semaphore::new(settings.max_concurrent_requests.max(1)));
        tracing::info!(
            model = %settings.model,
            base_url = %settings.base_url,
            max_concurrent = settings.max_concurrent_requests,
            "chat model initialized"
        );
        Ok(Self {
            client,
            settings,
            semaphore,
        })
    }

    fn endpoint(&self) -> String {
        let base = self.settings.base_url.trim_end_matches('/');
        format!("{base}/chat/completions")
    }

    async fn request(&self, body: &CompletionRequest<'_>) -> Result<String> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| LlmError::Generation(e.to_string()))?;

        let mut backoff = Duration::from_millis(500);
        let attempts = self.settings.max_retries.max(1);
        let mut last_err = LlmError::Generation("no attempt made".to_string());

        for attempt in 0..attempts {
            let response = self
                .client
                .post(self.endpoint())
                .bearer_auth(&self.settings.api_key)
                .json(body)
                .send()
                .await;

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let parsed: CompletionResponse = resp.json().await?;
                    let content = parsed
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| {
                            LlmError::InvalidResponse("empty choices in completion".to_string())
                        })?;
                    return Ok(content);
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let text = resp.text().await.unwrap_or_default();
                    tracing::warn!(status, attempt, "chat completion returned error status");
                    last_err = LlmError::Api { status, body: text };
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "chat completion request failed");
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
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn generate_with(
        &self,
        prompt: &str,
        temperature: Option<f32>,
        max_tokens: Option<u32>,
    ) -> Result<String> {
        let messages = [ChatMessage::user(prompt)];
        let body = CompletionRequest {
            model: &self.settings.model,
            messages: &messages,
            temperature: temperature.unwrap_or(self.settings.temperature),
            max_tokens: max_tokens.unwrap_or(self.settings.max_tokens),
        };
        self.request(&body).await
    }

    async fn chat(&self, messages: &[ChatMessage]) -> Result<String> {
        let body = CompletionRequest {
            model: &self.settings.model,
            messages,
            temperature: self.settings.temperature,
            max_tokens: self.settings.max_tokens,
        };
        self.request(&body).await
    }
}
