//! Main settings module

use config::{Config, Environment};
use evermem_core::Locale;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// OpenAI-compatible service provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Deepinfra,
    Vllm,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Deepinfra => "deepinfra",
            Provider::Vllm => "vllm",
        }
    }
}

/// Chat/generation capability configuration (`LLM_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

fn default_llm_provider() -> String {
    "openai".to_string()
}

fn default_llm_model() -> String {
    "Qwen3-235B".to_string()
}

fn default_llm_temperature() -> f32 {
    0.3
}

fn default_llm_max_tokens() -> u32 {
    16384
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_batch_size() -> usize {
    10
}

fn default_max_concurrent() -> usize {
    5
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            base_url: String::new(),
            api_key: String::new(),
            temperature: default_llm_temperature(),
            max_tokens: default_llm_max_tokens(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

/// Embedding capability configuration (`VECTORIZE_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorizeSettings {
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_vectorize_model")]
    pub model: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_encoding_format")]
    pub encoding_format: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
}

fn default_vectorize_model() -> String {
    "Qwen/Qwen3-Embedding-4B".to_string()
}

fn default_encoding_format() -> String {
    "float".to_string()
}

fn default_dimensions() -> usize {
    1024
}

impl Default for VectorizeSettings {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            api_key: String::new(),
            base_url: String::new(),
            model: default_vectorize_model(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            batch_size: default_batch_size(),
            max_concurrent_requests: default_max_concurrent(),
            encoding_format: default_encoding_format(),
            dimensions: default_dimensions(),
        }
    }
}

impl VectorizeSettings {
    /// Provider default endpoint when `base_url` is empty.
    pub fn effective_base_url(&self) -> String {
        if !self.base_url.is_empty() {
            let url = self.base_url.clone();
            if url.starts_with("http://") || url.starts_with("https://") {
                return url;
            }
            return format!("https://{url}");
        }
        match self.provider {
            Provider::Deepinfra => "https://api.deepinfra.com/v1/openai".to_string(),
            Provider::Vllm => "http://localhost:8000/v1".to_string(),
        }
    }

    /// vLLM accepts an empty key; the client still has to send something.
    pub fn effective_api_key(&self) -> String {
        if self.api_key.is_empty() && self.provider == Provider::Vllm {
            "EMPTY".to_string()
        } else {
            self.api_key.clone()
        }
    }
}

/// Rerank capability configuration (`RERANK_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankSettings {
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_rerank_model")]
    pub model: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,
}

fn default_rerank_model() -> String {
    "Qwen/Qwen3-Reranker-4B".to_string()
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            api_key: String::new(),
            base_url: String::new(),
            model: default_rerank_model(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            batch_size: default_batch_size(),
            max_concurrent_requests: default_max_concurrent(),
        }
    }
}

impl RerankSettings {
    pub fn effective_base_url(&self) -> String {
        if !self.base_url.is_empty() {
            return self.base_url.clone();
        }
        match self.provider {
            Provider::Deepinfra => "https://api.deepinfra.com/v1/inference".to_string(),
            Provider::Vllm => "http://localhost:12000/score".to_string(),
        }
    }

    pub fn effective_api_key(&self) -> String {
        if self.api_key.is_empty() && self.provider == Provider::Vllm {
            "EMPTY".to_string()
        } else {
            self.api_key.clone()
        }
    }
}

/// Partition-queue configuration (`REDIS_QUEUE_*`, `GLOBAL_REDIS_PREFIX`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default)]
    pub global_prefix: String,
    /// `json` | `msgpack`
    #[serde(default = "default_serialization_mode")]
    pub serialization_mode: String,
    #[serde(default = "default_max_total_messages")]
    pub max_total_messages: u64,
    #[serde(default = "default_expire_seconds")]
    pub expire_seconds: u64,
    #[serde(default = "default_expire_seconds")]
    pub activity_expire_seconds: u64,
    #[serde(default = "default_enable_metrics")]
    pub enable_metrics: bool,
    #[serde(default = "default_log_interval")]
    pub log_interval_seconds: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

fn default_key_prefix() -> String {
    "default".to_string()
}

fn default_serialization_mode() -> String {
    "json".to_string()
}

fn default_max_total_messages() -> u64 {
    20_000
}

fn default_expire_seconds() -> u64 {
    24 * 3600
}

fn default_enable_metrics() -> bool {
    true
}

fn default_log_interval() -> u64 {
    600
}

fn default_cleanup_interval() -> u64 {
    300
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            global_prefix: String::new(),
            serialization_mode: default_serialization_mode(),
            max_total_messages: default_max_total_messages(),
            expire_seconds: default_expire_seconds(),
            activity_expire_seconds: default_expire_seconds(),
            enable_metrics: default_enable_metrics(),
            log_interval_seconds: default_log_interval(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

/// Top-level application settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub memory_language: Option<String>,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub vectorize: VectorizeSettings,
    #[serde(default)]
    pub rerank: RerankSettings,
    #[serde(default)]
    pub queue: QueueSettings,
}

impl Settings {
    /// Load from environment variables. Each section maps through a prefix:
    /// `LLM_MODEL`, `VECTORIZE_BATCH_SIZE`, `RERANK_PROVIDER`,
    /// `REDIS_QUEUE_KEY_PREFIX`, `MEMORY_LANGUAGE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let llm: LlmSettings = section("LLM")?;
        let vectorize: VectorizeSettings = section("VECTORIZE")?;
        let rerank: RerankSettings = section("RERANK")?;
        let queue: QueueSettings = section("REDIS_QUEUE")?;
        let memory_language = std::env::var("MEMORY_LANGUAGE").ok();

        let settings = Self {
            memory_language,
            llm,
            vectorize,
            rerank,
            queue,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Locale selected by `MEMORY_LANGUAGE`; unknown values fall back to
    /// English with a warning.
    pub fn locale(&self) -> Locale {
        match self.memory_language.as_deref() {
            Some("zh") => Locale::Zh,
            Some("en") | None => Locale::En,
            Some(other) => {
                tracing::warn!(language = other, "unknown MEMORY_LANGUAGE, using en");
                Locale::En
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vectorize.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "VECTORIZE_BATCH_SIZE must be positive".to_string(),
            ));
        }
        if self.rerank.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "RERANK_BATCH_SIZE must be positive".to_string(),
            ));
        }
        match self.queue.serialization_mode.as_str() {
            "json" | "msgpack" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "REDIS_QUEUE_SERIALIZATION_MODE must be json or msgpack, got {other}"
                )))
            }
        }
        Ok(())
    }
}

fn section<T: serde::de::DeserializeOwned>(prefix: &str) -> Result<T, ConfigError> {
    let cfg = Config::builder()
        .add_source(Environment::with_prefix(prefix).try_parsing(true))
        .build()?;
    Ok(cfg.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let settings = Settings::default();
        assert_eq!(settings.vectorize.batch_size, 10);
        assert_eq!(settings.vectorize.max_concurrent_requests, 5);
        assert_eq!(settings.rerank.model, "Qwen/Qwen3-Reranker-4B");
        assert_eq!(settings.queue.max_total_messages, 20_000);
        assert_eq!(settings.queue.cleanup_interval_seconds, 300);
        assert_eq!(settings.locale(), Locale::En);
    }

    #[test]
    fn unknown_language_falls_back_to_english() {
        let settings = Settings {
            memory_language: Some("fr".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.locale(), Locale::En);

        let settings = Settings {
            memory_language: Some("zh".to_string()),
            ..Default::default()
        };
        assert_eq!(settings.locale(), Locale::Zh);
    }

    #[test]
    fn serialization_mode_is_validated() {
        let mut settings = Settings::default();
        settings.queue.serialization_mode = "bson".to_string();
        assert!(settings.validate().is_err());
        settings.queue.serialization_mode = "msgpack".to_string();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn provider_base_url_defaults() {
        let v = VectorizeSettings::default();
        assert_eq!(v.effective_base_url(), "https://api.deepinfra.com/v1/openai");
        let r = RerankSettings {
            provider: Provider::Vllm,
            ..Default::default()
        };
        assert_eq!(r.effective_base_url(), "http://localhost:12000/score");
        assert_eq!(r.effective_api_key(), "EMPTY");
    }
}
