//! Derived memory records
//!
//! Episodes, event logs, user profiles and group profiles are all views
//! derived from MemCells. Evidence strings point back at the MemCell a claim
//! came from, formatted `YYYY-MM-DD|conversation_id`.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::{EventLog, RawDataType};

/// The kinds of derived memory the pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    EpisodicMemory,
    EventLog,
    Profile,
    GroupProfile,
    Foresight,
}

/// A single prose narrative over one MemCell.
///
/// Personal episodes carry the `user_id` whose point of view the narrative
/// takes; group episodes have `user_id = None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub memory_type: MemoryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub timestamp: DateTime<FixedOffset>,
    /// 10-20 word title of the narrative.
    pub subject: String,
    /// At most 200 characters.
    pub summary: String,
    /// Detailed third-person narrative.
    pub episode: String,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(rename = "type")]
    pub data_type: RawDataType,
    /// Event ids of the MemCells this memory was derived from.
    pub memcell_event_id_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_log: Option<EventLog>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extend: BTreeMap<String, Value>,
}

impl Memory {
    pub fn embedding(&self) -> Option<Vec<f32>> {
        let value = self.extend.get("embedding")?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn set_embedding(&mut self, embedding: Vec<f32>, model: &str) {
        self.extend.insert(
            "embedding".to_string(),
            serde_json::to_value(embedding).unwrap_or(Value::Null),
        );
        self.extend
            .insert("vector_model".to_string(), Value::String(model.to_string()));
    }
}

/// One value/evidence pair inside a profile field, optionally graded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValueEntry {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    #[serde(default)]
    pub evidences: Vec<String>,
}

/// Evidence-bearing list field of a user profile.
pub type ProfileField = Option<Vec<ValueEntry>>;

/// A project the user participated in, with evidence on every nested entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectInfo {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub project_name: String,
    /// `YYYY-MM-DD`, empty when unknown.
    #[serde(default)]
    pub entry_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtasks: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_objective: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributions: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_concerns: ProfileField,
}

/// One batch worth of activity statistics for a user in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportanceEvidence {
    pub user_id: String,
    pub group_id: String,
    pub speak_count: u64,
    pub refer_count: u64,
    pub conversation_count: u64,
}

/// Sliding window of per-batch statistics, capped at 10 entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupImportanceEvidence {
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub evidence_list: Vec<ImportanceEvidence>,
    #[serde(default)]
    pub is_important: bool,
}

/// Per-user incremental profile, possibly scoped to a group.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_skills: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_skills: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motivation_system: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fear_system: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_system: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humor_use: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub colloquialism: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub personality: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub way_of_decision_making: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_habit_preference: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interests: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tendency: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_goal: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_responsibility: ProfileField,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projects_participated: Option<Vec<ProjectInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_importance_evidence: Option<GroupImportanceEvidence>,
    /// Monotone per `(user_id, group_id)`.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub cluster_ids: Vec<String>,
    #[serde(default)]
    pub memcell_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<FixedOffset>>,
}

impl UserProfile {
    /// Iterate over the level-bearing fields by name (used by merge logic).
    pub const LEVEL_FIELDS: [&'static str; 7] = [
        "hard_skills",
        "soft_skills",
        "motivation_system",
        "fear_system",
        "value_system",
        "humor_use",
        "colloquialism",
    ];

    pub fn field(&self, name: &str) -> Option<&Vec<ValueEntry>> {
        let field = match name {
            "hard_skills" => &self.hard_skills,
            "soft_skills" => &self.soft_skills,
            "motivation_system" => &self.motivation_system,
            "fear_system" => &self.fear_system,
            "value_system" => &self.value_system,
            "humor_use" => &self.humor_use,
            "colloquialism" => &self.colloquialism,
            "personality" => &self.personality,
            "way_of_decision_making" => &self.way_of_decision_making,
            "working_habit_preference" => &self.working_habit_preference,
            "interests" => &self.interests,
            "tendency" => &self.tendency,
            "user_goal" => &self.user_goal,
            "work_responsibility" => &self.work_responsibility,
            _ => return None,
        };
        field.as_ref()
    }
}

/// Lifecycle state of a group topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicStatus {
    Exploring,
    Implementing,
    Implemented,
}

impl Default for TopicStatus {
    fn default() -> Self {
        TopicStatus::Exploring
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicConfidence {
    Strong,
    Weak,
}

impl Default for TopicConfidence {
    fn default() -> Self {
        TopicConfidence::Weak
    }
}

/// One active topic inside a group profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub status: TopicStatus,
    #[serde(default)]
    pub confidence: TopicConfidence,
    /// MemCell event ids backing the topic, capped at 10.
    #[serde(default)]
    pub evidences: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub update_type: String,
}

/// Closed set of roles the behavior analysis may assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupRole {
    Leader,
    Coordinator,
    Contributor,
    Reviewer,
    Observer,
    DomainExpert,
}

impl GroupRole {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupRole::Leader => "leader",
            GroupRole::Coordinator => "coordinator",
            GroupRole::Contributor => "contributor",
            GroupRole::Reviewer => "reviewer",
            GroupRole::Observer => "observer",
            GroupRole::DomainExpert => "domain_expert",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "leader" => Some(GroupRole::Leader),
            "coordinator" => Some(GroupRole::Coordinator),
            "contributor" => Some(GroupRole::Contributor),
            "reviewer" => Some(GroupRole::Reviewer),
            "observer" => Some(GroupRole::Observer),
            "domain_expert" => Some(GroupRole::DomainExpert),
            _ => None,
        }
    }

    pub const ALL: [GroupRole; 6] = [
        GroupRole::Leader,
        GroupRole::Coordinator,
        GroupRole::Contributor,
        GroupRole::Reviewer,
        GroupRole::Observer,
        GroupRole::DomainExpert,
    ];
}

/// One user's assignment to a role, with evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub user_id: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub confidence: TopicConfidence,
    /// MemCell event ids, capped at 50.
    #[serde(default)]
    pub evidences: Vec<String>,
}

/// Group-wide, multi-user profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupProfile {
    pub group_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub topics: Vec<TopicInfo>,
    /// role name -> assignments, sorted strong-first then by user name.
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<RoleAssignment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<FixedOffset>>,
}
