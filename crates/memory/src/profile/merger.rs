//! Cross-group profile merging
//!
//! A user seen in several groups gets one merged profile: graded fields keep
//! the highest level, plain fields union their evidences, projects always
//! merge across every group. Groups whose importance evidence says the user
//! is not invested are excluded from everything except projects.

use chrono::NaiveDate;

use evermem_core::{ProjectInfo, UserProfile, ValueEntry};

use super::projects::merge_projects;
use super::values::{merge_keep_highest_level, merge_value_lists};
use crate::{MemoryError, Result};

const MAX_EVIDENCES: usize = 10;

/// Cap an evidence list at 10, preferring to drop entries without a
/// parseable date, then the oldest. Relative order is preserved.
pub fn truncate_evidences(evidences: &[String]) -> Vec<String> {
    let mut entries: Vec<String> = evidences
        .iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    if entries.len() <= MAX_EVIDENCES {
        return entries;
    }

    let parse_date = |entry: &str| -> Option<NaiveDate> {
        let prefix = entry.split('|').next()?.trim();
        NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
    };

    while entries.len() > MAX_EVIDENCES {
        if let Some(pos) = entries.iter().position(|e| parse_date(e).is_none()) {
            entries.remove(pos);
            continue;
        }
        let oldest = entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| parse_date(e))
            .map(|(i, _)| i);
        match oldest {
            Some(pos) => {
                entries.remove(pos);
            }
            None => break,
        }
    }
    entries
}

fn truncate_field(field: Option<Vec<ValueEntry>>) -> Option<Vec<ValueEntry>> {
    field.map(|entries| {
        entries
            .into_iter()
            .map(|mut entry| {
                entry.evidences = truncate_evidences(&entry.evidences);
                entry
            })
            .collect()
    })
}

fn truncate_projects(projects: Option<Vec<ProjectInfo>>) -> Option<Vec<ProjectInfo>> {
    projects.map(|list| {
        list.into_iter()
            .map(|mut project| {
                project.subtasks = truncate_field(project.subtasks);
                project.user_objective = truncate_field(project.user_objective);
                project.contributions = truncate_field(project.contributions);
                project.user_concerns = truncate_field(project.user_concerns);
                project
            })
            .collect()
    })
}

/// Merges per-group profiles of a single user.
pub struct ProfileMerger;

impl ProfileMerger {
    /// Merge every profile of `user_id` across groups into one.
    pub fn merge_group_profiles(
        group_profiles: &[UserProfile],
        user_id: &str,
    ) -> Result<UserProfile> {
        let all_matching: Vec<&UserProfile> = group_profiles
            .iter()
            .filter(|p| p.user_id == user_id)
            .collect();
        if all_matching.is_empty() {
            return Err(MemoryError::InvalidRequest(format!(
                "no profile found for user {user_id} when merging"
            )));
        }

        let important: Vec<&UserProfile> = all_matching
            .iter()
            .copied()
            .filter(|p| {
                p.group_importance_evidence
                    .as_ref()
                    .map(|gie| gie.is_important)
                    .unwrap_or(true)
            })
            .collect();
        let matching = if important.is_empty() {
            all_matching.clone()
        } else {
            important
        };

        let level_merge = |select: fn(&UserProfile) -> Option<&Vec<ValueEntry>>| {
            let sources: Vec<Option<&Vec<ValueEntry>>> =
                matching.iter().map(|p| select(p)).collect();
            truncate_field(merge_keep_highest_level(&sources))
        };
        let plain_merge = |select: fn(&UserProfile) -> Option<&Vec<ValueEntry>>| {
            let mut result: Option<Vec<ValueEntry>> = None;
            for profile in &matching {
                result = merge_value_lists(result.as_ref(), select(profile));
            }
            truncate_field(result)
        };

        // Projects always use every matching profile, importance or not.
        let mut projects: Option<Vec<ProjectInfo>> = None;
        for profile in &all_matching {
            projects = merge_projects(projects.as_ref(), profile.projects_participated.as_ref());
        }

        let reasoning_parts: Vec<String> = matching
            .iter()
            .filter_map(|p| p.output_reasoning.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let output_reasoning = if reasoning_parts.is_empty() {
            None
        } else {
            Some(reasoning_parts.join("$"))
        };

        let user_name = matching
            .iter()
            .rev()
            .find_map(|p| p.user_name.clone().filter(|n| !n.is_empty()));

        let group_ids: Vec<&str> = matching
            .iter()
            .map(|p| p.group_id.as_str())
            .filter(|g| !g.is_empty())
            .collect();
        let merged_group_id = if group_ids.is_empty() {
            matching[0].group_id.clone()
        } else {
            group_ids.join(",")
        };

        let updated_at = matching.iter().rev().find_map(|p| p.updated_at);
        let scenario = matching.iter().find_map(|p| p.scenario.clone());

        Ok(UserProfile {
            user_id: user_id.to_string(),
            group_id: merged_group_id,
            user_name,
            scenario,
            hard_skills: level_merge(|p| p.hard_skills.as_ref()),
            soft_skills: level_merge(|p| p.soft_skills.as_ref()),
            motivation_system: level_merge(|p| p.motivation_system.as_ref()),
            fear_system: level_merge(|p| p.fear_system.as_ref()),
            value_system: level_merge(|p| p.value_system.as_ref()),
            humor_use: level_merge(|p| p.humor_use.as_ref()),
            colloquialism: level_merge(|p| p.colloquialism.as_ref()),
            personality: plain_merge(|p| p.personality.as_ref()),
            way_of_decision_making: plain_merge(|p| p.way_of_decision_making.as_ref()),
            working_habit_preference: plain_merge(|p| p.working_habit_preference.as_ref()),
            interests: plain_merge(|p| p.interests.as_ref()),
            tendency: plain_merge(|p| p.tendency.as_ref()),
            user_goal: plain_merge(|p| p.user_goal.as_ref()),
            work_responsibility: plain_merge(|p| p.work_responsibility.as_ref()),
            projects_participated: truncate_projects(projects),
            output_reasoning,
            group_importance_evidence: None,
            version: matching.iter().map(|p| p.version).max().unwrap_or(0),
            cluster_ids: Vec::new(),
            memcell_count: matching.iter().map(|p| p.memcell_count).sum(),
            updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evermem_core::GroupImportanceEvidence;

    fn entry(value: &str, level: Option<&str>, evidences: &[&str]) -> ValueEntry {
        ValueEntry {
            value: value.to_string(),
            level: level.map(str::to_string),
            evidences: evidences.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn profile(group: &str, important: bool) -> UserProfile {
        UserProfile {
            user_id: "u1".to_string(),
            group_id: group.to_string(),
            user_name: Some("Alice".to_string()),
            group_importance_evidence: Some(GroupImportanceEvidence {
                group_id: group.to_string(),
                evidence_list: vec![],
                is_important: important,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn truncation_drops_undated_first_then_oldest() {
        let mut evidences: Vec<String> = (1..=10)
            .map(|d| format!("2024-03-{d:02}|c{d}"))
            .collect();
        evidences.insert(3, "undated-evidence".to_string());
        evidences.push("2024-02-01|old".to_string());

        let out = truncate_evidences(&evidences);
        assert_eq!(out.len(), 10);
        assert!(!out.iter().any(|e| e == "undated-evidence"));
        assert!(!out.iter().any(|e| e == "2024-02-01|old"));
        // Relative order of the survivors is untouched.
        assert_eq!(out[0], "2024-03-01|c1");
        assert_eq!(out[9], "2024-03-10|c10");
    }

    #[test]
    fn short_lists_pass_through() {
        let evidences = vec!["2024-03-10|a".to_string(), "x".to_string()];
        assert_eq!(truncate_evidences(&evidences), evidences);
    }

    #[test]
    fn unimportant_groups_are_excluded_except_projects() {
        let mut important = profile("g1", true);
        important.hard_skills = Some(vec![entry("Rust", Some("high"), &["2024-03-10|A"])]);

        let mut unimportant = profile("g2", false);
        unimportant.hard_skills = Some(vec![entry("Go", Some("high"), &["2024-03-11|B"])]);
        unimportant.projects_participated = Some(vec![ProjectInfo {
            project_id: "p1".to_string(),
            project_name: "Apollo".to_string(),
            ..Default::default()
        }]);

        let merged =
            ProfileMerger::merge_group_profiles(&[important, unimportant], "u1").unwrap();
        let skills = merged.hard_skills.unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].value, "Rust");
        // Projects come from all matching profiles.
        assert_eq!(merged.projects_participated.unwrap()[0].project_id, "p1");
        assert_eq!(merged.group_id, "g1");
    }

    #[test]
    fn all_unimportant_falls_back_to_everything() {
        let mut a = profile("g1", false);
        a.hard_skills = Some(vec![entry("Rust", Some("low"), &["2024-03-10|A"])]);
        let mut b = profile("g2", false);
        b.hard_skills = Some(vec![entry("Rust", Some("expert"), &["2024-03-11|B"])]);

        let merged = ProfileMerger::merge_group_profiles(&[a, b], "u1").unwrap();
        let skills = merged.hard_skills.unwrap();
        assert_eq!(skills[0].level.as_deref(), Some("expert"));
        assert_eq!(skills[0].evidences.len(), 2);
        assert_eq!(merged.group_id, "g1,g2");
    }

    #[test]
    fn unknown_user_is_an_error() {
        let err = ProfileMerger::merge_group_profiles(&[profile("g1", true)], "u9").unwrap_err();
        assert!(matches!(err, MemoryError::InvalidRequest(_)));
    }
}
