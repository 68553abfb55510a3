//! Group profile LLM analysis
//!
//! Content analysis (subject, summary, topics) and behavior analysis
//! (roles) run as two parallel LLM calls with one retry each; a failed call
//! falls back to the existing profile so a bad batch never wipes state.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use evermem_config::{PromptKey, PromptRegistry};
use evermem_core::{time, GroupProfile, MemCell};
use evermem_llm::ChatModel;

use super::roles::process_roles;
use super::topics::{self, DEFAULT_MAX_TOPICS};
use crate::json;
use crate::profile::conversation::{combined_conversation_text, user_name_map};
use crate::Result;

const ANALYSIS_ATTEMPTS: u32 = 2;

/// One batch of MemCells for a group, plus the profile of the previous pass.
#[derive(Debug, Clone, Default)]
pub struct GroupProfileExtractRequest {
    pub memcells: Vec<MemCell>,
    pub group_id: String,
    pub group_name: Option<String>,
    pub existing_profile: Option<GroupProfile>,
}

/// Group profile extractor.
pub struct GroupProfileExtractor {
    chat: Arc<dyn ChatModel>,
    prompts: Arc<PromptRegistry>,
    max_topics: usize,
}

impl GroupProfileExtractor {
    pub fn new(chat: Arc<dyn ChatModel>, prompts: Arc<PromptRegistry>) -> Self {
        Self {
            chat,
            prompts,
            max_topics: DEFAULT_MAX_TOPICS,
        }
    }

    pub fn with_max_topics(mut self, max_topics: usize) -> Self {
        self.max_topics = max_topics.max(1);
        self
    }

    async fn run_analysis(&self, key: PromptKey, params: &[(&str, &str)]) -> Option<Value> {
        let prompt = match self.prompts.render(key, params) {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::error!(error = %e, "group analysis prompt render failed");
                return None;
            }
        };
        match json::generate_json(&self.chat, &self.prompts, &prompt, ANALYSIS_ATTEMPTS, |_| {
            Ok(())
        })
        .await
        {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(error = %e, "group analysis failed, keeping existing profile");
                None
            }
        }
    }

    pub async fn extract(&self, request: &GroupProfileExtractRequest) -> Result<GroupProfile> {
        let existing = request.existing_profile.clone().unwrap_or(GroupProfile {
            group_id: request.group_id.clone(),
            ..Default::default()
        });
        if request.memcells.is_empty() {
            return Ok(existing);
        }

        let names = user_name_map(&request.memcells, &[]);
        let conversation = combined_conversation_text(&request.memcells, &names);
        let valid_ids: HashSet<String> = request
            .memcells
            .iter()
            .map(|c| c.event_id.clone())
            .collect();

        let existing_profile_json = serde_json::json!({
            "subject": existing.subject,
            "summary": existing.summary,
            "topics": existing.topics,
        })
        .to_string();
        let existing_roles_json = serde_json::to_string(&existing.roles).unwrap_or_default();

        let content_params = [
            ("conversation", conversation.as_str()),
            ("existing_profile", existing_profile_json.as_str()),
        ];
        let behavior_params = [
            ("conversation", conversation.as_str()),
            ("existing_roles", existing_roles_json.as_str()),
        ];
        let (content, behavior) = tokio::join!(
            self.run_analysis(PromptKey::GroupContentAnalysis, &content_params),
            self.run_analysis(PromptKey::GroupBehaviorAnalysis, &behavior_params),
        );

        // Names known to historical role assignments backfill the batch map.
        let mut speaker_names: HashMap<String, String> = names;
        for assignments in existing.roles.values() {
            for assignment in assignments {
                if !assignment.user_name.is_empty() {
                    speaker_names
                        .entry(assignment.user_id.clone())
                        .or_insert(assignment.user_name.clone());
                }
            }
        }

        let (subject, summary, topics) = match content {
            Some(value) => {
                let subject = value
                    .get("subject")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| existing.subject.clone());
                let summary = value
                    .get("summary")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| existing.summary.clone());
                let llm_topics = value
                    .get("topics")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let topics = topics::apply_incremental_updates(
                    &llm_topics,
                    &existing.topics,
                    &request.memcells,
                    &valid_ids,
                    self.max_topics,
                );
                (subject, summary, topics)
            }
            None => (
                existing.subject.clone(),
                existing.summary.clone(),
                existing.topics.clone(),
            ),
        };

        let roles = match behavior {
            Some(value) => {
                let llm_roles = value.get("roles").cloned().unwrap_or(Value::Null);
                process_roles(
                    &llm_roles,
                    &existing.roles,
                    &speaker_names,
                    &request.memcells,
                    &valid_ids,
                )
            }
            None => existing.roles.clone(),
        };

        Ok(GroupProfile {
            group_id: request.group_id.clone(),
            subject,
            summary,
            topics,
            roles,
            updated_at: Some(time::now_local()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use evermem_core::{Locale, MsgType, RawDataType, RawMessage, TopicConfidence};
    use evermem_llm::LlmError;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct RoutedChat;

    #[async_trait]
    impl ChatModel for RoutedChat {
        async fn generate_with(
            &self,
            prompt: &str,
            _temperature: Option<f32>,
            _max_tokens: Option<u32>,
        ) -> std::result::Result<String, LlmError> {
            let reply = if prompt.contains("assign roles") || prompt.contains("固定集合中分配角色") {
                json!({"roles": {
                    "leader": [{"speaker": "u1", "confidence": "strong", "evidences": ["A"]}]
                }})
            } else {
                json!({
                    "subject": "platform team",
                    "summary": "building the ingestion platform",
                    "topics": [{
                        "name": "ingestion rewrite",
                        "summary": "rewriting the pipeline",
                        "status": "implementing",
                        "confidence": "strong",
                        "evidences": ["A"],
                        "update_type": "new"
                    }]
                })
            };
            Ok(reply.to_string())
        }

        async fn chat(
            &self,
            _messages: &[evermem_llm::ChatMessage],
        ) -> std::result::Result<String, LlmError> {
            Ok("{}".to_string())
        }
    }

    fn memcell() -> MemCell {
        let ts = DateTime::parse_from_rfc3339("2024-03-10T10:00:00+08:00").unwrap();
        MemCell {
            event_id: "A".to_string(),
            user_id_list: vec![],
            group_id: Some("g1".to_string()),
            participants: vec!["u1".to_string()],
            original_data: vec![RawMessage {
                speaker_id: "u1".to_string(),
                speaker_name: "Alice".to_string(),
                content: "the rewrite is underway".to_string(),
                timestamp: ts,
                refer_list: vec![],
                msg_type: MsgType::Text,
                data_id: None,
            }],
            timestamp: ts,
            data_type: RawDataType::Conversation,
            summary: String::new(),
            episode: None,
            event_log: None,
            extend: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn parallel_analyses_build_the_profile() {
        let extractor = GroupProfileExtractor::new(
            Arc::new(RoutedChat),
            Arc::new(PromptRegistry::new(Locale::En)),
        );
        let request = GroupProfileExtractRequest {
            memcells: vec![memcell()],
            group_id: "g1".to_string(),
            group_name: None,
            existing_profile: None,
        };
        let profile = extractor.extract(&request).await.unwrap();
        assert_eq!(profile.subject, "platform team");
        assert_eq!(profile.topics.len(), 1);
        assert_eq!(profile.topics[0].evidences, vec!["A"]);
        let leaders = &profile.roles["leader"];
        assert_eq!(leaders[0].user_id, "u1");
        assert_eq!(leaders[0].user_name, "Alice");
        assert_eq!(leaders[0].confidence, TopicConfidence::Strong);
    }

    #[tokio::test]
    async fn empty_batch_returns_existing_profile() {
        let extractor = GroupProfileExtractor::new(
            Arc::new(RoutedChat),
            Arc::new(PromptRegistry::new(Locale::En)),
        );
        let existing = GroupProfile {
            group_id: "g1".to_string(),
            subject: "kept".to_string(),
            ..Default::default()
        };
        let request = GroupProfileExtractRequest {
            memcells: vec![],
            group_id: "g1".to_string(),
            group_name: None,
            existing_profile: Some(existing),
        };
        let profile = extractor.extract(&request).await.unwrap();
        assert_eq!(profile.subject, "kept");
    }
}
