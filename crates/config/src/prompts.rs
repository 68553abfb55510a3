//! Localized prompt registry
//!
//! Templates are data, loaded once at startup for the configured locale.
//! `validate()` checks that every known key is present before the engine
//! starts serving, mirroring the error-catalog check.

use evermem_core::Locale;
use std::collections::HashMap;

use crate::ConfigError;

/// Every prompt the pipeline may render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKey {
    BoundaryDetection,
    EpisodePersonal,
    EpisodeGroup,
    EventLog,
    ProfilePart1,
    ProfilePart2,
    ProfilePart3,
    EvidenceCompletion,
    JsonRepair,
    GroupContentAnalysis,
    GroupBehaviorAnalysis,
    SufficiencyCheck,
    MultiQueryGeneration,
}

impl PromptKey {
    pub const ALL: [PromptKey; 13] = [
        PromptKey::BoundaryDetection,
        PromptKey::EpisodePersonal,
        PromptKey::EpisodeGroup,
        PromptKey::EventLog,
        PromptKey::ProfilePart1,
        PromptKey::ProfilePart2,
        PromptKey::ProfilePart3,
        PromptKey::EvidenceCompletion,
        PromptKey::JsonRepair,
        PromptKey::GroupContentAnalysis,
        PromptKey::GroupBehaviorAnalysis,
        PromptKey::SufficiencyCheck,
        PromptKey::MultiQueryGeneration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PromptKey::BoundaryDetection => "boundary_detection",
            PromptKey::EpisodePersonal => "episode_personal",
            PromptKey::EpisodeGroup => "episode_group",
            PromptKey::EventLog => "event_log",
            PromptKey::ProfilePart1 => "profile_part1",
            PromptKey::ProfilePart2 => "profile_part2",
            PromptKey::ProfilePart3 => "profile_part3",
            PromptKey::EvidenceCompletion => "evidence_completion",
            PromptKey::JsonRepair => "json_repair",
            PromptKey::GroupContentAnalysis => "group_content_analysis",
            PromptKey::GroupBehaviorAnalysis => "group_behavior_analysis",
            PromptKey::SufficiencyCheck => "sufficiency_check",
            PromptKey::MultiQueryGeneration => "multi_query_generation",
        }
    }
}

/// Registry of templates for one locale.
pub struct PromptRegistry {
    locale: Locale,
    templates: HashMap<PromptKey, &'static str>,
}

impl PromptRegistry {
    pub fn new(locale: Locale) -> Self {
        let templates = match locale {
            Locale::En => english_templates(),
            Locale::Zh => chinese_templates(),
        };
        Self { locale, templates }
    }

    pub fn locale(&self) -> Locale {
        self.locale
    }

    /// Fail-fast check that all known keys are loaded.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for key in PromptKey::ALL {
            if !self.templates.contains_key(&key) {
                return Err(ConfigError::MissingPrompt {
                    locale: self.locale.as_str().to_string(),
                    key: key.as_str().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, key: PromptKey) -> Result<&'static str, ConfigError> {
        self.templates
            .get(&key)
            .copied()
            .ok_or_else(|| ConfigError::MissingPrompt {
                locale: self.locale.as_str().to_string(),
                key: key.as_str().to_string(),
            })
    }

    /// Substitute `{name}` placeholders with the given values.
    pub fn render(&self, key: PromptKey, params: &[(&str, &str)]) -> Result<String, ConfigError> {
        let mut text = self.get(key)?.to_string();
        for (name, value) in params {
            text = text.replace(&format!("{{{name}}}"), value);
        }
        Ok(text)
    }
}

fn english_templates() -> HashMap<PromptKey, &'static str> {
    let mut map = HashMap::new();
    map.insert(
        PromptKey::BoundaryDetection,
        r#"You are watching a group conversation and must decide whether the current topic has ended.

Conversation so far:
{conversation_history}

New messages:
{new_messages}

{time_gap_info}

Decide whether the conversation above forms a complete, closed topic. Respond with a single JSON object:
{"should_end": true/false, "should_wait": true/false, "reasoning": "...", "confidence": 0.0-1.0, "topic_summary": "one-sentence summary of the closed topic, empty if not ended"}"#,
    );
    map.insert(
        PromptKey::EpisodePersonal,
        r#"Write an episodic memory from {user_name}'s point of view.

The conversation started at {conversation_start_time}:
{conversation}

{custom_instructions}

Respond with JSON: {"title": "10-20 word title", "summary": "at most 200 characters", "content": "detailed third-person narrative focused on {user_name}"}"#,
    );
    map.insert(
        PromptKey::EpisodeGroup,
        r#"Write an episodic memory describing this group conversation as a whole.

The conversation started at {conversation_start_time}:
{conversation}

{custom_instructions}

Respond with JSON: {"title": "10-20 word title", "summary": "at most 200 characters", "content": "detailed third-person narrative of the whole conversation"}"#,
    );
    map.insert(
        PromptKey::EventLog,
        r#"Extract atomic facts from the episode below. Each fact must be one complete, self-contained sentence that can be understood without the others.

Episode (which happened at {time}):
{episode_text}

Respond with JSON: {"event_log": {"time": "{time}", "atomic_fact": ["fact 1", "fact 2"]}}"#,
    );
    map.insert(
        PromptKey::ProfilePart1,
        r#"Analyze the conversations below and extract, per participant: hard_skills, soft_skills, motivation_system, fear_system, value_system, humor_use, colloquialism, personality, way_of_decision_making, working_habit_preference.

Conversations (each slice is delimited by its MEMCELL_ID):
{conversation}

Known profiles (for incremental refinement):
{participants_profile}

For every extracted entry include "evidences": a list of the conversation_id values that support it, and a "level" of high/medium/low where the field is graded. Respond with JSON: {"user_profiles": [{"user_id": "...", ...fields...}]}"#,
    );
    map.insert(
        PromptKey::ProfilePart2,
        r#"Analyze the conversations below and extract, per participant: work_responsibility, opinion_tendency (type must be one of stance / suggestion / his own opinion), user_goal, and projects_participated (with project_id, project_name, entry_date, subtasks, user_objective, contributions, user_concerns; subtask entries carry type=taskbyhimself, contribution entries carry type=result).

Conversations:
{conversation}

Known profiles:
{participants_profile}

Every nested entry must carry its own "evidences" list of conversation_id values. Respond with JSON: {"user_profiles": [{"user_id": "...", ...fields...}]}"#,
    );
    map.insert(
        PromptKey::ProfilePart3,
        r#"Analyze the conversations below and extract, per participant, preference dimensions aligned to the closed taxonomy: interests and tendency.

Conversations:
{conversation}

Known profiles:
{participants_profile}

Each entry needs a "value" from the taxonomy and an "evidences" list of conversation_id values. Respond with JSON: {"user_profiles": [{"user_id": "...", "interests": [...], "tendency": [...]}]}"#,
    );
    map.insert(
        PromptKey::EvidenceCompletion,
        r#"The profile entries below are missing their "evidences" lists. Using the conversations, fill in only the evidences; do not change any other field.

Conversations:
{conversation}

Profiles with missing evidences:
{user_profiles_without_evidences}

Respond with the same JSON structure, with each entry's "evidences" populated with the supporting conversation_id values."#,
    );
    map.insert(
        PromptKey::JsonRepair,
        r#"The following text was supposed to be valid JSON but is malformed. Output the corrected JSON only, with no commentary.

{malformed_output}"#,
    );
    map.insert(
        PromptKey::GroupContentAnalysis,
        r#"Analyze what this group is working on.

Conversations (delimited by MEMCELL_ID):
{conversation}

Existing group profile:
{existing_profile}

Respond with JSON: {"subject": "...", "summary": "...", "topics": [{"name": "...", "summary": "...", "status": "exploring|implementing|implemented", "confidence": "strong|weak", "evidences": ["memcell ids"], "update_type": "new|update", "old_topic_id": "id when update_type=update"}]}"#,
    );
    map.insert(
        PromptKey::GroupBehaviorAnalysis,
        r#"Analyze how participants behave in this group and assign roles from the closed set: leader, coordinator, contributor, reviewer, observer, domain_expert.

Conversations (delimited by MEMCELL_ID):
{conversation}

Existing roles:
{existing_roles}

Respond with JSON: {"roles": {"role_name": [{"speaker": "user_id", "confidence": "strong|weak", "evidences": ["memcell ids"]}]}}"#,
    );
    map.insert(
        PromptKey::SufficiencyCheck,
        r#"A user asked: {query}

Retrieved memories:
{documents}

Are these memories sufficient to answer the question? Respond with JSON: {"is_sufficient": true/false, "reasoning": "...", "missing_information": ["what is missing, if anything"]}"#,
    );
    map.insert(
        PromptKey::MultiQueryGeneration,
        r#"A user asked: {query}

The memories retrieved so far:
{documents}

Missing information: {missing_info}

Write {num_queries} alternative search queries, each approaching the missing information from a different angle. Respond with JSON: {"queries": ["...", "..."], "reasoning": "..."}"#,
    );
    map
}

fn chinese_templates() -> HashMap<PromptKey, &'static str> {
    let mut map = HashMap::new();
    map.insert(
        PromptKey::BoundaryDetection,
        r#"你正在观察一段群聊，需要判断当前话题是否已经结束。

历史对话：
{conversation_history}

新消息：
{new_messages}

{time_gap_info}

判断以上对话是否构成一个完整、已结束的话题。仅输出一个 JSON 对象：
{"should_end": true/false, "should_wait": true/false, "reasoning": "...", "confidence": 0.0-1.0, "topic_summary": "话题一句话总结，未结束则为空"}"#,
    );
    map.insert(
        PromptKey::EpisodePersonal,
        r#"以 {user_name} 的视角撰写一段情景记忆。

对话开始于 {conversation_start_time}：
{conversation}

{custom_instructions}

输出 JSON：{"title": "10-20 词标题", "summary": "不超过 200 字", "content": "以第三人称撰写、聚焦 {user_name} 的详细叙述"}"#,
    );
    map.insert(
        PromptKey::EpisodeGroup,
        r#"为整段群聊撰写一段情景记忆。

对话开始于 {conversation_start_time}：
{conversation}

{custom_instructions}

输出 JSON：{"title": "10-20 词标题", "summary": "不超过 200 字", "content": "第三人称撰写的完整叙述"}"#,
    );
    map.insert(
        PromptKey::EventLog,
        r#"从下面的情景记忆中提取原子事实，每条事实必须是一个独立完整的句子。

情景（发生于 {time}）：
{episode_text}

输出 JSON：{"event_log": {"time": "{time}", "atomic_fact": ["事实 1", "事实 2"]}}"#,
    );
    map.insert(
        PromptKey::ProfilePart1,
        r#"分析以下对话，为每位参与者提取：hard_skills、soft_skills、motivation_system、fear_system、value_system、humor_use、colloquialism、personality、way_of_decision_making、working_habit_preference。

对话（每段以 MEMCELL_ID 分隔）：
{conversation}

已知画像：
{participants_profile}

每个条目都要带 "evidences"（支撑它的 conversation_id 列表），分级字段带 "level"（high/medium/low）。输出 JSON：{"user_profiles": [{"user_id": "...", ...}]}"#,
    );
    map.insert(
        PromptKey::ProfilePart2,
        r#"分析以下对话，为每位参与者提取：work_responsibility、opinion_tendency（type 只能是 stance / suggestion / his own opinion）、user_goal、projects_participated（含 project_id、project_name、entry_date、subtasks、user_objective、contributions、user_concerns；subtasks 条目 type=taskbyhimself，contributions 条目 type=result）。

对话：
{conversation}

已知画像：
{participants_profile}

每个嵌套条目都要有自己的 "evidences"。输出 JSON：{"user_profiles": [{"user_id": "...", ...}]}"#,
    );
    map.insert(
        PromptKey::ProfilePart3,
        r#"分析以下对话，按既定偏好维度为每位参与者提取 interests 与 tendency。

对话：
{conversation}

已知画像：
{participants_profile}

每个条目需要 "value" 与 "evidences"。输出 JSON：{"user_profiles": [{"user_id": "...", "interests": [...], "tendency": [...]}]}"#,
    );
    map.insert(
        PromptKey::EvidenceCompletion,
        r#"以下画像条目缺少 "evidences"。请根据对话补全 evidences，不要修改其他字段。

对话：
{conversation}

缺少 evidences 的画像：
{user_profiles_without_evidences}

以相同的 JSON 结构输出，并为每个条目填上支撑它的 conversation_id 列表。"#,
    );
    map.insert(
        PromptKey::JsonRepair,
        r#"下面的文本本应是合法 JSON 但格式有误。只输出修复后的 JSON，不要任何说明。

{malformed_output}"#,
    );
    map.insert(
        PromptKey::GroupContentAnalysis,
        r#"分析这个群正在做什么。

对话（以 MEMCELL_ID 分隔）：
{conversation}

现有群画像：
{existing_profile}

输出 JSON：{"subject": "...", "summary": "...", "topics": [{"name": "...", "summary": "...", "status": "exploring|implementing|implemented", "confidence": "strong|weak", "evidences": ["memcell ids"], "update_type": "new|update", "old_topic_id": "update 时填写"}]}"#,
    );
    map.insert(
        PromptKey::GroupBehaviorAnalysis,
        r#"分析群内成员的行为，并从固定集合中分配角色：leader、coordinator、contributor、reviewer、observer、domain_expert。

对话（以 MEMCELL_ID 分隔）：
{conversation}

现有角色：
{existing_roles}

输出 JSON：{"roles": {"角色名": [{"speaker": "user_id", "confidence": "strong|weak", "evidences": ["memcell ids"]}]}}"#,
    );
    map.insert(
        PromptKey::SufficiencyCheck,
        r#"用户的问题是：{query}

检索到的记忆：
{documents}

这些记忆是否足以回答问题？输出 JSON：{"is_sufficient": true/false, "reasoning": "...", "missing_information": ["缺少的信息"]}"#,
    );
    map.insert(
        PromptKey::MultiQueryGeneration,
        r#"用户的问题是：{query}

目前检索到的记忆：
{documents}

缺少的信息：{missing_info}

请写出 {num_queries} 条互补的改进查询，从不同角度覆盖缺少的信息。输出 JSON：{"queries": ["...", "..."], "reasoning": "..."}"#,
    );
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_locales_validate() {
        PromptRegistry::new(Locale::En).validate().unwrap();
        PromptRegistry::new(Locale::Zh).validate().unwrap();
    }

    #[test]
    fn render_substitutes_placeholders() {
        let registry = PromptRegistry::new(Locale::En);
        let rendered = registry
            .render(
                PromptKey::SufficiencyCheck,
                &[("query", "what does Alice like"), ("documents", "[memory 1]")],
            )
            .unwrap();
        assert!(rendered.contains("what does Alice like"));
        assert!(rendered.contains("[memory 1]"));
        assert!(!rendered.contains("{query}"));
    }

    #[test]
    fn every_key_resolves() {
        let registry = PromptRegistry::new(Locale::En);
        for key in PromptKey::ALL {
            assert!(!registry.get(key).unwrap().is_empty());
        }
    }
}
