//! Configuration for evermem
//!
//! Every option of the configuration surface is an environment variable with
//! a serde default; `Settings::from_env()` builds the whole tree and
//! `Settings::validate()` fail-fasts on inconsistencies. Prompt templates are
//! data selected by locale at startup, never regenerated per request.

mod prompts;
mod settings;

pub use prompts::{PromptKey, PromptRegistry};
pub use settings::{
    LlmSettings, Provider, QueueSettings, RerankSettings, Settings, VectorizeSettings,
};

use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing prompt template: locale={locale}, key={key}")]
    MissingPrompt { locale: String, key: String },

    #[error("config load error: {0}")]
    Load(#[from] config::ConfigError),
}
