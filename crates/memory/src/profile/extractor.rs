//! Profile extraction orchestration
//!
//! Three extraction passes run over the same conversation text, merge into
//! one payload per user, get their evidences completed, and are sanitized
//! against the batch before becoming the next profile version.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use evermem_config::{PromptKey, PromptRegistry};
use evermem_core::{time, MemCell, UserProfile, ValueEntry};
use evermem_llm::ChatModel;

use super::completion::complete_missing_evidences;
use super::conversation::{combined_conversation_text, conversation_date_map, user_name_map};
use super::evidence::{filter_opinion_tendency, remove_entries_without_evidence};
use super::projects::{convert_projects, merge_projects};
use super::values::{extract_values_with_evidence, merge_keep_highest_level, merge_value_lists};
use crate::importance;
use crate::json;
use crate::Result;

const EXTRACTION_ATTEMPTS: u32 = 2;

/// One batch: a group's MemCells over a time window plus the profiles the
/// previous pass produced.
#[derive(Debug, Clone, Default)]
pub struct ProfileExtractRequest {
    pub memcells: Vec<MemCell>,
    pub user_id_list: Vec<String>,
    pub group_id: String,
    pub group_name: Option<String>,
    pub old_profiles: Vec<UserProfile>,
    pub scenario: Option<String>,
}

/// Per-user profile extractor.
pub struct ProfileExtractor {
    chat: Arc<dyn ChatModel>,
    prompts: Arc<PromptRegistry>,
}

impl ProfileExtractor {
    pub fn new(chat: Arc<dyn ChatModel>, prompts: Arc<PromptRegistry>) -> Self {
        Self { chat, prompts }
    }

    /// Strip evidences so old profiles can ride the prompt compactly.
    fn profile_without_evidences(profile: &UserProfile) -> Value {
        fn strip(value: &mut Value) {
            match value {
                Value::Object(map) => {
                    map.remove("evidences");
                    for inner in map.values_mut() {
                        strip(inner);
                    }
                }
                Value::Array(items) => items.iter_mut().for_each(strip),
                _ => {}
            }
        }
        let mut value = serde_json::to_value(profile).unwrap_or(Value::Null);
        strip(&mut value);
        value
    }

    async fn run_part(&self, key: PromptKey, conversation: &str, old_profiles: &str) -> Vec<Value> {
        let prompt = match self.prompts.render(
            key,
            &[
                ("conversation", conversation),
                ("participants_profile", old_profiles),
            ],
        ) {
            Ok(prompt) => prompt,
            Err(e) => {
                tracing::error!(error = %e, "profile prompt render failed");
                return Vec::new();
            }
        };
        match json::generate_json(&self.chat, &self.prompts, &prompt, EXTRACTION_ATTEMPTS, |v| {
            if v.get("user_profiles").and_then(Value::as_array).is_some() {
                Ok(())
            } else {
                Err("missing user_profiles array".to_string())
            }
        })
        .await
        {
            Ok(value) => value["user_profiles"].as_array().cloned().unwrap_or_default(),
            Err(e) => {
                tracing::error!(error = %e, "profile extraction part failed");
                Vec::new()
            }
        }
    }

    /// Union the three part payloads per user. Later parts fill fields the
    /// earlier ones did not produce.
    fn merge_parts(parts: Vec<Vec<Value>>) -> Vec<Value> {
        let mut by_user: Vec<(String, Map<String, Value>)> = Vec::new();
        for part in parts {
            for profile in part {
                let Some(user_id) = profile.get("user_id").and_then(Value::as_str) else {
                    continue;
                };
                let user_id = user_id.to_string();
                let idx = match by_user.iter().position(|(id, _)| *id == user_id) {
                    Some(idx) => idx,
                    None => {
                        by_user.push((user_id.clone(), Map::new()));
                        by_user.len() - 1
                    }
                };
                if let Value::Object(fields) = profile {
                    let slot = &mut by_user[idx].1;
                    for (key, value) in fields {
                        slot.entry(key).or_insert(value);
                    }
                }
            }
        }
        by_user
            .into_iter()
            .map(|(_, map)| Value::Object(map))
            .collect()
    }

    /// MemCell ids of the batch the user actually participated in: the set
    /// an evidence must fall into to survive sanitization.
    fn valid_ids_for_user(memcells: &[MemCell], user_id: &str) -> HashSet<String> {
        memcells
            .iter()
            .filter(|cell| cell.participants.iter().any(|p| p == user_id))
            .map(|cell| cell.event_id.clone())
            .collect()
    }

    fn drop_unevidenced(field: Option<Vec<ValueEntry>>) -> Option<Vec<ValueEntry>> {
        let entries: Vec<ValueEntry> = field?
            .into_iter()
            .filter(|entry| !entry.evidences.is_empty())
            .collect();
        if entries.is_empty() {
            None
        } else {
            Some(entries)
        }
    }

    /// Convert one sanitized payload into a typed profile.
    fn payload_to_profile(
        &self,
        mut payload: Value,
        request: &ProfileExtractRequest,
        names: &HashMap<String, String>,
        date_map: &HashMap<String, String>,
    ) -> Option<UserProfile> {
        let user_id = payload.get("user_id")?.as_str()?.to_string();
        let valid_ids = Self::valid_ids_for_user(&request.memcells, &user_id);

        if let Some(tendency) = payload.get_mut("opinion_tendency") {
            filter_opinion_tendency(tendency);
        }

        let extract = |field: &str| -> Option<Vec<ValueEntry>> {
            let raw = payload.get(field)?;
            Self::drop_unevidenced(extract_values_with_evidence(
                raw,
                field,
                Some(&valid_ids),
                date_map,
            ))
        };

        // `tendency` unions the taxonomy output with opinion tendencies the
        // type filter let through.
        let tendency = merge_value_lists(
            extract("tendency").as_ref(),
            extract("opinion_tendency").as_ref(),
        );

        let projects = payload
            .get("projects_participated")
            .and_then(|raw| convert_projects(raw, Some(&valid_ids), date_map));

        let reasoning = payload
            .get("output_reasoning")
            .and_then(Value::as_str)
            .map(|text| {
                let base_date = request
                    .memcells
                    .iter()
                    .map(|c| c.timestamp)
                    .max()
                    .map(|ts| ts.format("%Y-%m-%d").to_string())
                    .unwrap_or_default();
                super::conversation::annotate_relative_dates(text, &base_date)
            });

        Some(UserProfile {
            user_name: names.get(&user_id).cloned(),
            group_id: request.group_id.clone(),
            scenario: request.scenario.clone(),
            hard_skills: extract("hard_skills"),
            soft_skills: extract("soft_skills"),
            motivation_system: extract("motivation_system"),
            fear_system: extract("fear_system"),
            value_system: extract("value_system"),
            humor_use: extract("humor_use"),
            colloquialism: extract("colloquialism"),
            personality: extract("personality"),
            way_of_decision_making: extract("way_of_decision_making"),
            working_habit_preference: extract("working_habit_preference"),
            interests: extract("interests"),
            tendency,
            user_goal: extract("user_goal"),
            work_responsibility: extract("work_responsibility"),
            projects_participated: projects,
            output_reasoning: reasoning,
            group_importance_evidence: None,
            version: 0,
            cluster_ids: Vec::new(),
            memcell_count: request.memcells.len() as u64,
            updated_at: Some(time::now_local()),
            user_id,
        })
    }

    /// Fold the prior version into the fresh extraction: level fields keep
    /// the highest grade, plain fields union evidences (historical first),
    /// projects merge by identity. Historical evidences were validated when
    /// they were first stored, so they are trusted here.
    fn merge_with_prior(fresh: UserProfile, prior: &UserProfile) -> UserProfile {
        let level = |old: Option<&Vec<ValueEntry>>, new: Option<&Vec<ValueEntry>>| {
            merge_keep_highest_level(&[old, new])
        };
        UserProfile {
            hard_skills: level(prior.hard_skills.as_ref(), fresh.hard_skills.as_ref()),
            soft_skills: level(prior.soft_skills.as_ref(), fresh.soft_skills.as_ref()),
            motivation_system: level(
                prior.motivation_system.as_ref(),
                fresh.motivation_system.as_ref(),
            ),
            fear_system: level(prior.fear_system.as_ref(), fresh.fear_system.as_ref()),
            value_system: level(prior.value_system.as_ref(), fresh.value_system.as_ref()),
            humor_use: level(prior.humor_use.as_ref(), fresh.humor_use.as_ref()),
            colloquialism: level(prior.colloquialism.as_ref(), fresh.colloquialism.as_ref()),
            personality: merge_value_lists(prior.personality.as_ref(), fresh.personality.as_ref()),
            way_of_decision_making: merge_value_lists(
                prior.way_of_decision_making.as_ref(),
                fresh.way_of_decision_making.as_ref(),
            ),
            working_habit_preference: merge_value_lists(
                prior.working_habit_preference.as_ref(),
                fresh.working_habit_preference.as_ref(),
            ),
            interests: merge_value_lists(prior.interests.as_ref(), fresh.interests.as_ref()),
            tendency: merge_value_lists(prior.tendency.as_ref(), fresh.tendency.as_ref()),
            user_goal: merge_value_lists(prior.user_goal.as_ref(), fresh.user_goal.as_ref()),
            work_responsibility: merge_value_lists(
                prior.work_responsibility.as_ref(),
                fresh.work_responsibility.as_ref(),
            ),
            projects_participated: merge_projects(
                prior.projects_participated.as_ref(),
                fresh.projects_participated.as_ref(),
            ),
            version: prior.version + 1,
            memcell_count: prior.memcell_count + fresh.memcell_count,
            cluster_ids: prior.cluster_ids.clone(),
            user_name: fresh.user_name.clone().or_else(|| prior.user_name.clone()),
            ..fresh
        }
    }

    pub async fn extract(&self, request: &ProfileExtractRequest) -> Result<Vec<UserProfile>> {
        if request.memcells.is_empty() {
            return Ok(Vec::new());
        }

        let names = user_name_map(&request.memcells, &request.old_profiles);
        let conversation = combined_conversation_text(&request.memcells, &names);
        let date_map = conversation_date_map(&request.memcells);
        let all_batch_ids: HashSet<String> = request
            .memcells
            .iter()
            .map(|c| c.event_id.clone())
            .collect();

        let old_payload = serde_json::to_string(
            &request
                .old_profiles
                .iter()
                .map(Self::profile_without_evidences)
                .collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| "[]".to_string());

        let (part1, part2, part3) = tokio::join!(
            self.run_part(PromptKey::ProfilePart1, &conversation, &old_payload),
            self.run_part(PromptKey::ProfilePart2, &conversation, &old_payload),
            self.run_part(PromptKey::ProfilePart3, &conversation, &old_payload),
        );

        let mut payloads = Self::merge_parts(vec![part1, part2, part3]);
        if payloads.is_empty() {
            tracing::warn!(group_id = %request.group_id, "profile extraction produced no users");
            return Ok(Vec::new());
        }

        complete_missing_evidences(
            &self.chat,
            &self.prompts,
            &conversation,
            &mut payloads,
            &all_batch_ids,
            &date_map,
        )
        .await?;

        // Entries still lacking evidence after completion are dropped
        // before the payload becomes typed.
        let payloads: Vec<Value> = payloads
            .into_iter()
            .filter_map(remove_entries_without_evidence)
            .collect();

        let batch_evidence = importance::aggregate_batch(&request.memcells, &request.group_id);

        let mut profiles = Vec::new();
        for payload in payloads {
            let Some(profile) = self.payload_to_profile(payload, request, &names, &date_map)
            else {
                continue;
            };
            let prior = request
                .old_profiles
                .iter()
                .find(|p| p.user_id == profile.user_id && p.group_id == request.group_id);
            let mut merged = match prior {
                Some(prior) => Self::merge_with_prior(profile, prior),
                None => {
                    let mut profile = profile;
                    profile.version = 1;
                    profile
                }
            };
            merged.group_importance_evidence = importance::merge_importance(
                prior.and_then(|p| p.group_importance_evidence.clone()),
                &batch_evidence,
                &merged.user_id,
            );
            profiles.push(merged);
        }

        tracing::debug!(
            group_id = %request.group_id,
            users = profiles.len(),
            "profile batch extracted"
        );
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use evermem_core::{Locale, MsgType, RawDataType, RawMessage};
    use evermem_llm::LlmError;
    use serde_json::json;
    use std::collections::BTreeMap;

    /// Returns part replies in rotation keyed by prompt content.
    struct PartChat;

    #[async_trait]
    impl ChatModel for PartChat {
        async fn generate_with(
            &self,
            prompt: &str,
            _temperature: Option<f32>,
            _max_tokens: Option<u32>,
        ) -> std::result::Result<String, LlmError> {
            // Route on distinctive fragments of each prompt template.
            let reply = if prompt.contains("hard_skills") {
                json!({"user_profiles": [{
                    "user_id": "u1",
                    "hard_skills": [
                        {"value": "Python", "level": "high", "evidences": ["2024-03-10|A", "2024-03-11|C"]}
                    ]
                }]})
            } else if prompt.contains("projects_participated") {
                json!({"user_profiles": [{
                    "user_id": "u1",
                    "opinion_tendency": [
                        {"value": "ship weekly", "type": "suggestion", "evidences": ["A"]},
                        {"value": "irrelevant", "type": "fact", "evidences": ["A"]}
                    ]
                }]})
            } else if prompt.contains("interests") && prompt.contains("tendency") {
                json!({"user_profiles": [{
                    "user_id": "u1",
                    "interests": [{"value": "jazz", "evidences": ["A"]}]
                }]})
            } else {
                // evidence completion / repair
                json!({"user_profiles": []})
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

    fn memcell(event_id: &str, ts: &str, participants: &[&str]) -> MemCell {
        MemCell {
            event_id: event_id.to_string(),
            user_id_list: vec![],
            group_id: Some("g1".to_string()),
            participants: participants.iter().map(|s| s.to_string()).collect(),
            original_data: vec![RawMessage {
                speaker_id: "u1".to_string(),
                speaker_name: "Alice".to_string(),
                content: "I wrote the Python ingestion service".to_string(),
                timestamp: DateTime::parse_from_rfc3339(ts).unwrap(),
                refer_list: vec![],
                msg_type: MsgType::Text,
                data_id: None,
            }],
            timestamp: DateTime::parse_from_rfc3339(ts).unwrap(),
            data_type: RawDataType::Conversation,
            summary: String::new(),
            episode: None,
            event_log: None,
            extend: BTreeMap::new(),
        }
    }

    fn request() -> ProfileExtractRequest {
        ProfileExtractRequest {
            memcells: vec![
                memcell("A", "2024-03-10T10:00:00+08:00", &["u1", "u2"]),
                memcell("B", "2024-03-11T10:00:00+08:00", &["u1"]),
            ],
            user_id_list: vec!["u1".to_string()],
            group_id: "g1".to_string(),
            group_name: None,
            old_profiles: vec![],
            scenario: None,
        }
    }

    #[tokio::test]
    async fn extraction_sanitizes_evidence_to_the_batch() {
        let extractor = ProfileExtractor::new(
            Arc::new(PartChat),
            Arc::new(PromptRegistry::new(Locale::En)),
        );
        let profiles = extractor.extract(&request()).await.unwrap();
        assert_eq!(profiles.len(), 1);
        let profile = &profiles[0];
        assert_eq!(profile.user_id, "u1");
        assert_eq!(profile.version, 1);

        // C is not in the batch: only the A evidence survives.
        let skills = profile.hard_skills.as_ref().unwrap();
        assert_eq!(skills[0].evidences, vec!["2024-03-10|A"]);

        // Opinion tendency filtered by type and merged into tendency.
        let tendency = profile.tendency.as_ref().unwrap();
        assert_eq!(tendency.len(), 1);
        assert_eq!(tendency[0].value, "ship weekly");

        // Importance evidence attached from the batch statistics.
        let gie = profile.group_importance_evidence.as_ref().unwrap();
        assert_eq!(gie.evidence_list.len(), 1);
        assert_eq!(gie.evidence_list[0].speak_count, 2);
    }

    #[tokio::test]
    async fn prior_version_bumps_and_merges() {
        let extractor = ProfileExtractor::new(
            Arc::new(PartChat),
            Arc::new(PromptRegistry::new(Locale::En)),
        );
        let mut req = request();
        req.old_profiles = vec![UserProfile {
            user_id: "u1".to_string(),
            group_id: "g1".to_string(),
            version: 3,
            hard_skills: Some(vec![ValueEntry {
                value: "Python".to_string(),
                level: Some("medium".to_string()),
                evidences: vec!["2024-02-01|old".to_string()],
            }]),
            ..Default::default()
        }];
        let profiles = extractor.extract(&req).await.unwrap();
        let profile = &profiles[0];
        assert_eq!(profile.version, 4);
        let skills = profile.hard_skills.as_ref().unwrap();
        // Historical evidence inherited, level promoted to high.
        assert!(skills[0].evidences.contains(&"2024-02-01|old".to_string()));
        assert!(skills[0].evidences.contains(&"2024-03-10|A".to_string()));
        assert_eq!(skills[0].level.as_deref(), Some("high"));
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let extractor = ProfileExtractor::new(
            Arc::new(PartChat),
            Arc::new(PromptRegistry::new(Locale::En)),
        );
        let profiles = extractor
            .extract(&ProfileExtractRequest::default())
            .await
            .unwrap();
        assert!(profiles.is_empty());
    }
}
