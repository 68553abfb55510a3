//! Evidence completion
//!
//! Extraction sometimes returns entries without their `evidences` lists.
//! Those profiles are re-presented to the model together with the same
//! conversation text; the response overlays evidences onto matching entries
//! and nothing else.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use evermem_config::{PromptKey, PromptRegistry};
use evermem_llm::ChatModel;

use super::evidence::merge_evidences_recursive;
use crate::json;
use crate::Result;

const COMPLETION_ATTEMPTS: u32 = 2;

/// True when any entry in the profile carries a value but no evidences.
pub fn has_missing_evidences(value: &Value) -> bool {
    match value {
        Value::Object(map) => {
            let has_value = map
                .get("value")
                .map(|v| !v.is_null() && v.as_str().map(|s| !s.is_empty()).unwrap_or(true))
                .unwrap_or(false);
            if has_value {
                let missing = map
                    .get("evidences")
                    .map(|e| e.as_array().map(|a| a.is_empty()).unwrap_or(true))
                    .unwrap_or(true);
                if missing {
                    return true;
                }
            }
            map.values().any(has_missing_evidences)
        }
        Value::Array(items) => items.iter().any(has_missing_evidences),
        _ => false,
    }
}

/// Ask the model to fill missing evidences across a batch of per-user
/// profile payloads, then overlay the validated results in place.
pub async fn complete_missing_evidences(
    chat: &Arc<dyn ChatModel>,
    prompts: &PromptRegistry,
    conversation_text: &str,
    profiles: &mut [Value],
    valid_ids: &HashSet<String>,
    date_map: &HashMap<String, String>,
) -> Result<()> {
    let incomplete: Vec<&Value> = profiles
        .iter()
        .filter(|p| has_missing_evidences(p))
        .map(|p| &*p)
        .collect();
    if incomplete.is_empty() {
        return Ok(());
    }
    tracing::info!(count = incomplete.len(), "completing missing evidences");

    let payload = serde_json::to_string(&incomplete).unwrap_or_else(|_| "[]".to_string());
    let prompt = prompts.render(
        PromptKey::EvidenceCompletion,
        &[
            ("conversation", conversation_text),
            ("user_profiles_without_evidences", payload.as_str()),
        ],
    )?;

    let completed = match json::generate_json(chat, prompts, &prompt, COMPLETION_ATTEMPTS, |v| {
        if v.is_array() || v.get("user_profiles").is_some() || v.get("user_id").is_some() {
            Ok(())
        } else {
            Err("completion payload has no profiles".to_string())
        }
    })
    .await
    {
        Ok(value) => value,
        Err(e) => {
            // Completion is best-effort; unevidenced entries get pruned by
            // the sanitizer anyway.
            tracing::warn!(error = %e, "evidence completion failed");
            return Ok(());
        }
    };

    let completed_profiles: Vec<Value> = if let Some(list) = completed.as_array() {
        list.clone()
    } else if let Some(list) = completed.get("user_profiles").and_then(Value::as_array) {
        list.clone()
    } else {
        vec![completed]
    };

    for completed_profile in &completed_profiles {
        let Some(user_id) = completed_profile.get("user_id").and_then(Value::as_str) else {
            continue;
        };
        if let Some(original) = profiles
            .iter_mut()
            .find(|p| p.get("user_id").and_then(Value::as_str) == Some(user_id))
        {
            merge_evidences_recursive(original, completed_profile, valid_ids, date_map);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use evermem_core::Locale;
    use evermem_llm::LlmError;
    use serde_json::json;

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

    #[test]
    fn detects_entries_with_value_but_no_evidences() {
        assert!(has_missing_evidences(&json!({
            "user_id": "u1",
            "hard_skills": [{"value": "Rust", "evidences": []}]
        })));
        assert!(has_missing_evidences(&json!({
            "hard_skills": [{"value": "Rust"}]
        })));
        assert!(!has_missing_evidences(&json!({
            "hard_skills": [{"value": "Rust", "evidences": ["2024-03-10|A"]}]
        })));
        assert!(!has_missing_evidences(&json!({"user_id": "u1"})));
    }

    #[tokio::test]
    async fn completion_fills_evidences_on_matching_entries() {
        let reply = json!({
            "user_profiles": [{
                "user_id": "u1",
                "hard_skills": [{"value": "Rust", "evidences": ["A"]}]
            }]
        })
        .to_string();
        let chat: Arc<dyn ChatModel> = Arc::new(FixedChat(reply));
        let prompts = PromptRegistry::new(Locale::En);
        let mut profiles = vec![json!({
            "user_id": "u1",
            "hard_skills": [{"value": "Rust", "evidences": []}]
        })];
        let valid: HashSet<String> = ["A".to_string()].into();
        let date_map = HashMap::from([("A".to_string(), "2024-03-10".to_string())]);

        complete_missing_evidences(&chat, &prompts, "text", &mut profiles, &valid, &date_map)
            .await
            .unwrap();
        assert_eq!(
            profiles[0]["hard_skills"][0]["evidences"],
            json!(["2024-03-10|A"])
        );
    }

    #[tokio::test]
    async fn completion_failure_is_non_fatal() {
        let chat: Arc<dyn ChatModel> = Arc::new(FixedChat("garbage".to_string()));
        let prompts = PromptRegistry::new(Locale::En);
        let mut profiles = vec![json!({
            "user_id": "u1",
            "hard_skills": [{"value": "Rust", "evidences": []}]
        })];
        let valid = HashSet::new();
        let date_map = HashMap::new();
        complete_missing_evidences(&chat, &prompts, "text", &mut profiles, &valid, &date_map)
            .await
            .unwrap();
        // Entry untouched; the sanitizer will prune it later.
        assert_eq!(profiles[0]["hard_skills"][0]["evidences"], json!([]));
    }
}
