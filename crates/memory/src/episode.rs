//! Episode extraction
//!
//! Turns a closed MemCell into a single prose narrative. Group episodes
//! (`user_id = None`) use the group prompt and describe the whole
//! conversation; personal episodes take one participant's point of view.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use evermem_config::{PromptKey, PromptRegistry};
use evermem_core::time;
use evermem_core::{MemCell, Memory, MemoryType, RawDataType};
use evermem_llm::{ChatModel, Embedder};

use crate::json;
use crate::{MemoryError, Result};

const MAX_PARSE_RETRIES: u32 = 5;

/// Request for one episode over one MemCell.
#[derive(Debug, Clone)]
pub struct EpisodeExtractRequest {
    pub memcell: MemCell,
    /// `None` extracts the group episode.
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub custom_instructions: Option<String>,
}

/// Episode extractor.
pub struct EpisodeExtractor {
    chat: Arc<dyn ChatModel>,
    embedder: Arc<dyn Embedder>,
    prompts: Arc<PromptRegistry>,
}

impl EpisodeExtractor {
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

    /// JSON-shaped rendering of the conversation for the prompt.
    fn conversation_json_text(memcell: &MemCell) -> String {
        memcell
            .original_data
            .iter()
            .map(|msg| {
                serde_json::json!({
                    "timestamp": msg.timestamp.to_rfc3339(),
                    "speaker": msg.speaker_name,
                    "content": msg.content,
                })
                .to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// speaker_id -> speaker_name across messages and mentions.
    fn speaker_names(memcell: &MemCell) -> HashMap<String, String> {
        let mut names = HashMap::new();
        for msg in &memcell.original_data {
            if !msg.speaker_id.is_empty() && !msg.speaker_name.is_empty() {
                names.insert(msg.speaker_id.clone(), msg.speaker_name.clone());
            }
            for refer in &msg.refer_list {
                if !refer.id.is_empty() && !refer.name.is_empty() {
                    names.entry(refer.id.clone()).or_insert(refer.name.clone());
                }
            }
        }
        names
    }

    pub async fn extract(&self, request: &EpisodeExtractRequest) -> Result<Memory> {
        let memcell = &request.memcell;
        if memcell.data_type != RawDataType::Conversation {
            return Err(MemoryError::InvalidRequest(format!(
                "episode extraction only supports conversations, got {}",
                memcell.data_type.as_str()
            )));
        }

        let start_time = memcell.timestamp;
        let start_time_str = time::format_episode_time(&start_time);
        let conversation = Self::conversation_json_text(memcell);
        let custom = request.custom_instructions.clone().unwrap_or_default();

        let names = Self::speaker_names(memcell);
        let (prompt_key, user_name) = match &request.user_id {
            None => (PromptKey::EpisodeGroup, None),
            Some(user_id) => {
                let name = names.get(user_id).cloned().unwrap_or_else(|| user_id.clone());
                (PromptKey::EpisodePersonal, Some(name))
            }
        };

        let mut params: Vec<(&str, &str)> = vec![
            ("conversation", conversation.as_str()),
            ("conversation_start_time", start_time_str.as_str()),
            ("custom_instructions", custom.as_str()),
        ];
        if let Some(name) = &user_name {
            params.push(("user_name", name.as_str()));
        }
        let prompt = self.prompts.render(prompt_key, &params)?;

        let value = json::generate_json(
            &self.chat,
            &self.prompts,
            &prompt,
            MAX_PARSE_RETRIES,
            |v| {
                let has_title = v.get("title").and_then(|t| t.as_str()).map(|t| !t.is_empty());
                let has_content = v
                    .get("content")
                    .and_then(|c| c.as_str())
                    .map(|c| !c.is_empty());
                match (has_title, has_content) {
                    (Some(true), Some(true)) => Ok(()),
                    _ => Err("missing title or content".to_string()),
                }
            },
        )
        .await?;

        let title = value["title"].as_str().unwrap_or_default().to_string();
        let content = value["content"].as_str().unwrap_or_default().to_string();
        let summary = match value["summary"].as_str() {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => content.chars().take(200).collect(),
        };

        let mut memory = Memory {
            memory_type: MemoryType::EpisodicMemory,
            user_id: request.user_id.clone(),
            user_name,
            group_id: request.group_id.clone(),
            timestamp: start_time,
            subject: title,
            summary,
            episode: content.clone(),
            participants: memcell.participants.clone(),
            data_type: memcell.data_type,
            memcell_event_id_list: vec![memcell.event_id.clone()],
            event_log: None,
            extend: BTreeMap::new(),
        };

        // Embedding over the narrative; a failure leaves the episode usable
        // for lexical retrieval only.
        match self.embedder.embed(&content).await {
            Ok(vector) => {
                let model = self.embedder.model_name().to_string();
                memory.set_embedding(vector, &model);
            }
            Err(e) => tracing::error!(error = %e, "episode embedding failed"),
        }

        tracing::debug!(subject = %memory.subject, "episode extracted");
        Ok(memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use evermem_core::{Locale, MsgType, RawMessage};
    use evermem_llm::LlmError;

    struct FixedChat(String);

    #[async_trait]
    impl ChatModel for FixedChat {
        async fn generate_with(
            &self,
            _prompt: &str,
            _temperature: Option<f32>,
            _max_tokens: Option<u32>,
        ) -> std::result::Result<String, LlmError> {
            Ok(self.0.clone())
        }

        async fn chat(
            &self,
            _messages: &[evermem_llm::ChatMessage],
        ) -> std::result::Result<String, LlmError> {
            Ok(self.0.clone())
        }
    }

    struct FixedEmbedder;

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, LlmError> {
            Ok(vec![0.1, 0.2, 0.3])
        }

        async fn embed_query(
            &self,
            _text: &str,
            _instruction: Option<&str>,
        ) -> std::result::Result<Vec<f32>, LlmError> {
            Ok(vec![0.1, 0.2, 0.3])
        }

        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> std::result::Result<Vec<Vec<f32>>, LlmError> {
            Ok(texts.iter().map(|_| vec![0.1, 0.2, 0.3]).collect())
        }

        fn model_name(&self) -> &str {
            "test-embedding-model"
        }
    }

    fn memcell() -> MemCell {
        MemCell {
            event_id: "cell-1".to_string(),
            user_id_list: vec!["u1".to_string()],
            group_id: Some("g1".to_string()),
            participants: vec!["u1".to_string(), "u2".to_string()],
            original_data: vec![RawMessage {
                speaker_id: "u1".to_string(),
                speaker_name: "Alice".to_string(),
                content: "let's ship v2 tomorrow".to_string(),
                timestamp: DateTime::parse_from_rfc3339("2024-03-10T14:00:00+08:00").unwrap(),
                refer_list: vec![],
                msg_type: MsgType::Text,
                data_id: None,
            }],
            timestamp: DateTime::parse_from_rfc3339("2024-03-10T14:00:00+08:00").unwrap(),
            data_type: RawDataType::Conversation,
            summary: "shipping v2".to_string(),
            episode: None,
            event_log: None,
            extend: BTreeMap::new(),
        }
    }

    fn extractor(reply: &str) -> EpisodeExtractor {
        EpisodeExtractor::new(
            Arc::new(FixedChat(reply.to_string())),
            Arc::new(FixedEmbedder),
            Arc::new(PromptRegistry::new(Locale::En)),
        )
    }

    #[tokio::test]
    async fn group_episode_carries_no_user() {
        let extractor = extractor(
            r#"{"title": "Shipping v2 planning", "summary": "Alice plans v2.", "content": "Alice proposed shipping v2 the next day."}"#,
        );
        let request = EpisodeExtractRequest {
            memcell: memcell(),
            user_id: None,
            group_id: Some("g1".to_string()),
            custom_instructions: None,
        };
        let memory = extractor.extract(&request).await.unwrap();
        assert!(memory.user_id.is_none());
        assert_eq!(memory.memcell_event_id_list, vec!["cell-1"]);
        assert_eq!(memory.subject, "Shipping v2 planning");
        assert!(memory.embedding().is_some());
        assert_eq!(
            memory.extend.get("vector_model").and_then(|v| v.as_str()),
            Some("test-embedding-model")
        );
    }

    #[tokio::test]
    async fn personal_episode_resolves_user_name() {
        let extractor = extractor(
            r#"{"title": "Alice pushes the release", "content": "Alice drove the v2 release discussion."}"#,
        );
        let request = EpisodeExtractRequest {
            memcell: memcell(),
            user_id: Some("u1".to_string()),
            group_id: Some("g1".to_string()),
            custom_instructions: None,
        };
        let memory = extractor.extract(&request).await.unwrap();
        assert_eq!(memory.user_id.as_deref(), Some("u1"));
        assert_eq!(memory.user_name.as_deref(), Some("Alice"));
        // summary missing -> first 200 chars of content
        assert_eq!(memory.summary, "Alice drove the v2 release discussion.");
    }

    #[tokio::test]
    async fn fenced_reply_parses() {
        let extractor = extractor(
            "```json\n{\"title\": \"T\", \"summary\": \"S\", \"content\": \"C\"}\n```",
        );
        let request = EpisodeExtractRequest {
            memcell: memcell(),
            user_id: None,
            group_id: None,
            custom_instructions: None,
        };
        let memory = extractor.extract(&request).await.unwrap();
        assert_eq!(memory.subject, "T");
        assert_eq!(memory.episode, "C");
    }

    #[tokio::test]
    async fn missing_title_fails_after_retries() {
        let extractor = extractor(r#"{"summary": "S", "content": "C"}"#);
        let request = EpisodeExtractRequest {
            memcell: memcell(),
            user_id: None,
            group_id: None,
            custom_instructions: None,
        };
        let err = extractor.extract(&request).await.unwrap_err();
        assert!(matches!(err, MemoryError::LlmRetryExhausted(_)));
    }
}
