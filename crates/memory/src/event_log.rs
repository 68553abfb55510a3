//! Event log extraction
//!
//! Converts an episode narrative into atomic facts optimized for lexical
//! retrieval, then batch-embeds the facts so `fact_embeddings` stays aligned
//! one-to-one with `atomic_fact`.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use evermem_config::{PromptKey, PromptRegistry};
use evermem_core::time;
use evermem_core::EventLog;
use evermem_llm::{ChatModel, Embedder};

use crate::json;
use crate::{MemoryError, Result};

const MAX_PARSE_RETRIES: u32 = 5;

/// Event log extractor.
pub struct EventLogExtractor {
    chat: Arc<dyn ChatModel>,
    embedder: Arc<dyn Embedder>,
    prompts: Arc<PromptRegistry>,
}

impl EventLogExtractor {
    pub fn new(
        chat: Arc<dyn ChatModel>,
        embedder: Arc<dyn Embedder>,
        prompts: Arc<PromptRegistry>,
    ) -> Self {
        Self {
            chat,
            embedder,
            prompts,
        }
    }

    pub async fn extract(
        &self,
        episode_text: &str,
        timestamp: DateTime<FixedOffset>,
    ) -> Result<EventLog> {
        let time_str = time::format_event_time(&timestamp);
        let prompt = self.prompts.render(
            PromptKey::EventLog,
            &[("episode_text", episode_text), ("time", time_str.as_str())],
        )?;

        let value = json::generate_json(
            &self.chat,
            &self.prompts,
            &prompt,
            MAX_PARSE_RETRIES,
            |v| {
                let log = v
                    .get("event_log")
                    .ok_or_else(|| "missing event_log field".to_string())?;
                let time_ok = log
                    .get("time")
                    .and_then(|t| t.as_str())
                    .map(|t| !t.is_empty())
                    .unwrap_or(false);
                if !time_ok {
                    return Err("missing time field in event_log".to_string());
                }
                match log.get("atomic_fact").and_then(|f| f.as_array()) {
                    Some(facts) if !facts.is_empty() => Ok(()),
                    Some(_) => Err("atomic_fact list is empty".to_string()),
                    None => Err("atomic_fact is not a list".to_string()),
                }
            },
        )
        .await?;

        let log = &value["event_log"];
        let facts: Vec<String> = log["atomic_fact"]
            .as_array()
            .unwrap_or(&Vec::new())
            .iter()
            .filter_map(|f| f.as_str().map(str::to_string))
            .collect();
        if facts.is_empty() {
            return Err(MemoryError::LlmOutputParsing(
                "atomic facts were not strings".to_string(),
            ));
        }

        let fact_embeddings = self.embedder.embed_batch(&facts).await?;
        if fact_embeddings.len() != facts.len() {
            return Err(MemoryError::LlmOutputParsing(format!(
                "embedding count {} does not match fact count {}",
                fact_embeddings.len(),
                facts.len()
            )));
        }

        let event_log = EventLog {
            time: log["time"].as_str().unwrap_or(&time_str).to_string(),
            atomic_fact: facts,
            fact_embeddings,
        };
        tracing::debug!(facts = event_log.atomic_fact.len(), "event log extracted");
        Ok(event_log)
    }

    /// Extract logs for a batch of `(episode_text, timestamp)` pairs
    /// concurrently; a failed slot yields `None` rather than failing the
    /// batch.
    pub async fn extract_batch(
        &self,
        episodes: &[(String, DateTime<FixedOffset>)],
    ) -> Vec<Option<EventLog>> {
        let futures = episodes
            .iter()
            .map(|(text, ts)| self.extract(text, *ts));
        let results = futures::future::join_all(futures).await;
        results
            .into_iter()
            .enumerate()
            .map(|(i, result)| match result {
                Ok(log) => Some(log),
                Err(e) => {
                    tracing::error!(index = i, error = %e, "batch event log extraction failed");
                    None
                }
            })
            .collect()
    }
}
