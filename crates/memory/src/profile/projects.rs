//! Project participation normalization
//!
//! Projects merge by `project_id` first, then `project_name`; child lists
//! merge by evidence union. Subtasks keep only entries the user did
//! themselves, contributions keep only concrete results.

use chrono::NaiveDate;
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use evermem_core::ProjectInfo;

use super::values::{extract_values_with_evidence, merge_value_lists};

/// Entry types kept during sanitization.
const SUBTASK_TYPE: &str = "taskbyhimself";
const CONTRIBUTION_TYPE: &str = "result";

fn normalize_entry_date(value: Option<&Value>) -> String {
    let entry_date = value
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if entry_date.is_empty() {
        return String::new();
    }
    match NaiveDate::parse_from_str(entry_date, "%Y-%m-%d") {
        Ok(_) => entry_date.to_string(),
        Err(_) => {
            tracing::debug!(entry_date, "invalid project entry_date, resetting");
            String::new()
        }
    }
}

/// Keep only typed entries the sanitization rules allow, before evidence
/// extraction.
fn filter_typed_entries(raw: &Value, allowed_type: &str) -> Value {
    match raw {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .filter(|item| {
                    let keep = item
                        .get("type")
                        .and_then(Value::as_str)
                        .map(|t| t == allowed_type)
                        .unwrap_or(false);
                    if !keep {
                        tracing::info!(
                            value = %item.get("value").and_then(serde_json::Value::as_str).unwrap_or(""),
                            expected = allowed_type,
                            "dropping project entry with wrong type"
                        );
                    }
                    keep
                })
                .cloned()
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Convert the LLM's `projects_participated` payload into typed projects,
/// applying type filters and evidence validation.
pub fn convert_projects(
    raw: &Value,
    valid_ids: Option<&HashSet<String>>,
    date_map: &HashMap<String, String>,
) -> Option<Vec<ProjectInfo>> {
    let items = raw.as_array()?;
    let mut projects = Vec::new();
    for item in items {
        if !item.is_object() {
            continue;
        }
        let project_id = item
            .get("project_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        let project_name = item
            .get("project_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        let extract = |field: &str, type_filter: Option<&str>| {
            let raw_field = item.get(field).cloned().unwrap_or(Value::Null);
            let filtered = match type_filter {
                Some(t) => filter_typed_entries(&raw_field, t),
                None => raw_field,
            };
            extract_values_with_evidence(&filtered, field, valid_ids, date_map)
        };

        projects.push(ProjectInfo {
            project_id,
            project_name,
            entry_date: normalize_entry_date(item.get("entry_date")),
            subtasks: extract("subtasks", Some(SUBTASK_TYPE)),
            user_objective: extract("user_objective", None),
            contributions: extract("contributions", Some(CONTRIBUTION_TYPE)),
            user_concerns: extract("user_concerns", None),
        });
    }
    if projects.is_empty() {
        None
    } else {
        Some(projects)
    }
}

/// Merge project lists, deduplicating by project id then name.
pub fn merge_projects(
    existing: Option<&Vec<ProjectInfo>>,
    incoming: Option<&Vec<ProjectInfo>>,
) -> Option<Vec<ProjectInfo>> {
    let mut merged: Vec<ProjectInfo> = existing.cloned().unwrap_or_default();

    for project in incoming.into_iter().flatten() {
        let matched = merged.iter_mut().find(|existing_project| {
            if !project.project_id.is_empty() && !existing_project.project_id.is_empty() {
                project.project_id == existing_project.project_id
            } else if !project.project_name.is_empty() && !existing_project.project_name.is_empty()
            {
                project.project_name == existing_project.project_name
            } else {
                false
            }
        });
        match matched {
            Some(existing_project) => {
                if existing_project.entry_date.is_empty() {
                    existing_project.entry_date = project.entry_date.clone();
                }
                existing_project.subtasks =
                    merge_value_lists(existing_project.subtasks.as_ref(), project.subtasks.as_ref());
                existing_project.user_objective = merge_value_lists(
                    existing_project.user_objective.as_ref(),
                    project.user_objective.as_ref(),
                );
                existing_project.contributions = merge_value_lists(
                    existing_project.contributions.as_ref(),
                    project.contributions.as_ref(),
                );
                existing_project.user_concerns = merge_value_lists(
                    existing_project.user_concerns.as_ref(),
                    project.user_concerns.as_ref(),
                );
            }
            None => merged.push(project.clone()),
        }
    }

    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evermem_core::ValueEntry;
    use serde_json::json;

    #[test]
    fn conversion_filters_subtasks_and_contributions_by_type() {
        let date_map = HashMap::from([("A".to_string(), "2024-03-10".to_string())]);
        let valid: HashSet<String> = ["A".to_string()].into();
        let raw = json!([{
            "project_id": "p1",
            "project_name": "Apollo",
            "entry_date": "2024-01-15",
            "subtasks": [
                {"value": "wrote the parser", "type": "taskbyhimself", "evidences": ["A"]},
                {"value": "planned by team", "type": "teamtask", "evidences": ["A"]}
            ],
            "contributions": [
                {"value": "shipped v1", "type": "result", "evidences": ["A"]},
                {"value": "working on v2", "type": "ongoing", "evidences": ["A"]}
            ]
        }]);
        let projects = convert_projects(&raw, Some(&valid), &date_map).unwrap();
        assert_eq!(projects.len(), 1);
        let project = &projects[0];
        assert_eq!(project.entry_date, "2024-01-15");
        assert_eq!(project.subtasks.as_ref().unwrap().len(), 1);
        assert_eq!(project.subtasks.as_ref().unwrap()[0].value, "wrote the parser");
        assert_eq!(project.contributions.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn invalid_entry_date_resets_to_empty() {
        let raw = json!([{"project_id": "p1", "project_name": "X", "entry_date": "soon"}]);
        let projects = convert_projects(&raw, None, &HashMap::new()).unwrap();
        assert_eq!(projects[0].entry_date, "");
    }

    fn project(id: &str, name: &str, subtask: &str, evidence: &str) -> ProjectInfo {
        ProjectInfo {
            project_id: id.to_string(),
            project_name: name.to_string(),
            entry_date: String::new(),
            subtasks: Some(vec![ValueEntry {
                value: subtask.to_string(),
                level: None,
                evidences: vec![evidence.to_string()],
            }]),
            user_objective: None,
            contributions: None,
            user_concerns: None,
        }
    }

    #[test]
    fn merge_matches_by_id_then_name() {
        let a = vec![project("p1", "Apollo", "parser", "2024-03-10|A")];
        let b = vec![
            project("p1", "Apollo renamed", "codegen", "2024-03-11|B"),
            project("", "Zeus", "infra", "2024-03-11|B"),
        ];
        let merged = merge_projects(Some(&a), Some(&b)).unwrap();
        assert_eq!(merged.len(), 2);
        let apollo = &merged[0];
        let subtasks = apollo.subtasks.as_ref().unwrap();
        assert_eq!(subtasks.len(), 2);

        // Name-based match when ids are absent.
        let c = vec![project("", "Zeus", "infra", "2024-03-12|C")];
        let merged2 = merge_projects(Some(&merged), Some(&c)).unwrap();
        assert_eq!(merged2.len(), 2);
        let zeus = merged2.iter().find(|p| p.project_name == "Zeus").unwrap();
        assert_eq!(
            zeus.subtasks.as_ref().unwrap()[0].evidences,
            vec!["2024-03-11|B", "2024-03-12|C"]
        );
    }
}
