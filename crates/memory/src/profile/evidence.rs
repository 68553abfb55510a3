//! Evidence utilities shared across profile normalization
//!
//! Evidence strings have the shape `YYYY-MM-DD|conversation_id`. The LLM
//! emits them in several looser forms; everything here normalizes, validates
//! against the current batch, and prunes entries left without support.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// `opinion_tendency` entry types that survive sanitization.
pub const ALLOWED_OPINION_TYPES: [&str; 3] = ["stance", "suggestion", "his own opinion"];

/// Coerce an arbitrary value into a deduplicated list of trimmed strings.
pub fn ensure_str_list(value: &Value) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |text: String| {
        let trimmed = text.trim().to_string();
        if !trimmed.is_empty() && !out.contains(&trimmed) {
            out.push(trimmed);
        }
    };
    match value {
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Null => {}
                    Value::String(s) => push(s.clone()),
                    other => push(other.to_string()),
                }
            }
        }
        Value::String(s) => push(s.clone()),
        Value::Null => {}
        other => push(other.to_string()),
    }
    out
}

/// Extract the conversation id from a formatted (or half-formatted)
/// evidence entry.
pub fn conversation_id_from_evidence(evidence: &str) -> Option<String> {
    let mut entry = evidence.trim();
    if entry.is_empty() {
        return None;
    }
    if let Some((_, tail)) = entry.rsplit_once('|') {
        entry = tail.trim();
    }
    if let Some((_, tail)) = entry.rsplit_once("conversation_id:") {
        entry = tail;
    }
    let cleaned = entry.trim_matches(|c: char| c == '[' || c == ']' || c.is_whitespace());
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Format one evidence entry as `YYYY-MM-DD|conversation_id` using the
/// batch's id→date map. Entries already carrying a date pass through.
pub fn format_evidence_entry(
    value: &str,
    date_map: &HashMap<String, String>,
) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.contains('|') {
        return Some(trimmed.to_string());
    }
    let conversation_id = conversation_id_from_evidence(trimmed)?;
    match date_map.get(&conversation_id) {
        Some(date) => Some(format!("{date}|{conversation_id}")),
        None => Some(conversation_id),
    }
}

/// Validate + format a raw evidences value into final strings. Unknown
/// conversation ids are dropped with a warning; known ones get their date
/// prefix.
pub fn format_and_validate_evidences(
    evidences: &Value,
    valid_ids: &HashSet<String>,
    date_map: &HashMap<String, String>,
) -> Vec<String> {
    let mut formatted = Vec::new();
    for entry in ensure_str_list(evidences) {
        let conversation_id = match conversation_id_from_evidence(&entry) {
            Some(id) => id,
            None => continue,
        };
        if !valid_ids.contains(&conversation_id) {
            tracing::warn!(conversation_id = %conversation_id, "evidence references unknown conversation");
            continue;
        }
        if let Some(value) = format_evidence_entry(&conversation_id, date_map) {
            if !formatted.contains(&value) {
                formatted.push(value);
            }
        }
    }
    formatted
}

fn strip_evidences(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() != "evidences")
                .map(|(k, v)| (k.clone(), strip_evidences(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_evidences).collect()),
        other => other.clone(),
    }
}

/// Structural signature of an entry minus its evidences, used to match
/// completed entries back to originals.
fn item_identifier(item: &Value) -> Option<String> {
    if !item.is_object() {
        return None;
    }
    let stripped = strip_evidences(item);
    serde_json::to_string(&stripped).ok()
}

const MATCH_VALUE_KEYS: [&str; 7] = [
    "value",
    "skill",
    "project_id",
    "project_name",
    "user_id",
    "name",
    "title",
];

/// Locate the original list item a completed entry corresponds to: first by
/// structural signature, then by any shared value key.
fn find_matching_index(items: &[Value], completed: &Value) -> Option<usize> {
    if !completed.is_object() {
        return None;
    }
    if let Some(identifier) = item_identifier(completed) {
        for (i, candidate) in items.iter().enumerate() {
            if item_identifier(candidate).as_deref() == Some(identifier.as_str()) {
                return Some(i);
            }
        }
    }
    for key in MATCH_VALUE_KEYS {
        let needle = match completed.get(key) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
            Some(Value::Null) | None => continue,
            Some(other) => other.to_string(),
        };
        for (i, candidate) in items.iter().enumerate() {
            let existing = match candidate.get(key) {
                Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
                Some(Value::Null) | None => continue,
                Some(other) => other.to_string(),
            };
            if existing == needle {
                return Some(i);
            }
        }
    }
    None
}

/// Overlay only the `evidences` lists from a completion payload onto the
/// original profile, matching entries structurally.
pub fn merge_evidences_recursive(
    original: &mut Value,
    completed: &Value,
    valid_ids: &HashSet<String>,
    date_map: &HashMap<String, String>,
) {
    match (original, completed) {
        (Value::Object(orig_map), Value::Object(comp_map)) => {
            if let Some(evidences) = comp_map.get("evidences") {
                if evidences.is_array() {
                    let formatted = format_and_validate_evidences(evidences, valid_ids, date_map);
                    if !formatted.is_empty() {
                        orig_map.insert(
                            "evidences".to_string(),
                            Value::Array(formatted.into_iter().map(Value::String).collect()),
                        );
                    }
                }
            }
            for (key, comp_value) in comp_map {
                if key == "evidences" {
                    continue;
                }
                if let Some(orig_value) = orig_map.get_mut(key) {
                    merge_evidences_recursive(orig_value, comp_value, valid_ids, date_map);
                }
            }
        }
        (Value::Array(orig_items), Value::Array(comp_items)) => {
            for comp_item in comp_items {
                if let Some(idx) = find_matching_index(orig_items, comp_item) {
                    merge_evidences_recursive(&mut orig_items[idx], comp_item, valid_ids, date_map);
                }
            }
        }
        _ => {}
    }
}

/// Recursively drop entries whose evidences normalized to empty. Returns
/// `None` when the whole branch should be removed.
pub fn remove_entries_without_evidence(value: Value) -> Option<Value> {
    match value {
        Value::Object(map) => {
            let mut cleaned = Map::new();
            let mut evidences: Option<Vec<String>> = None;
            for (key, inner) in map {
                if key == "evidences" {
                    evidences = Some(ensure_str_list(&inner));
                    continue;
                }
                if let Some(kept) = remove_entries_without_evidence(inner) {
                    cleaned.insert(key, kept);
                }
            }
            if let Some(list) = evidences {
                if list.is_empty() {
                    return None;
                }
                cleaned.insert(
                    "evidences".to_string(),
                    Value::Array(list.into_iter().map(Value::String).collect()),
                );
            }
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        Value::Array(items) => {
            let kept: Vec<Value> = items
                .into_iter()
                .filter_map(remove_entries_without_evidence)
                .collect();
            Some(Value::Array(kept))
        }
        other => Some(other),
    }
}

/// Keep only `opinion_tendency` entries with an allowed type.
pub fn filter_opinion_tendency(entries: &mut Value) {
    if let Value::Array(items) = entries {
        items.retain(|item| {
            let keep = item
                .get("type")
                .and_then(Value::as_str)
                .map(|t| ALLOWED_OPINION_TYPES.contains(&t.trim().to_lowercase().as_str()))
                .unwrap_or(false);
            if !keep {
                tracing::info!(
                    value = %item.get("value").and_then(serde_json::Value::as_str).unwrap_or(""),
                    "dropping opinion_tendency entry with disallowed type"
                );
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date_map() -> HashMap<String, String> {
        HashMap::from([
            ("A".to_string(), "2024-03-10".to_string()),
            ("B".to_string(), "2024-03-11".to_string()),
        ])
    }

    #[test]
    fn ensure_str_list_dedups_and_trims() {
        let value = json!([" a ", "b", "a", null, 7]);
        assert_eq!(ensure_str_list(&value), vec!["a", "b", "7"]);
        assert_eq!(ensure_str_list(&json!("solo")), vec!["solo"]);
        assert!(ensure_str_list(&json!(null)).is_empty());
    }

    #[test]
    fn conversation_id_strips_date_and_markers() {
        assert_eq!(
            conversation_id_from_evidence("2024-03-10|abc").as_deref(),
            Some("abc")
        );
        assert_eq!(
            conversation_id_from_evidence("conversation_id: [xyz]").as_deref(),
            Some("xyz")
        );
        assert_eq!(conversation_id_from_evidence("  "), None);
    }

    #[test]
    fn validation_drops_ids_outside_the_batch() {
        let valid: HashSet<String> = ["A".to_string()].into();
        let evidences = json!(["2024-03-10|A", "2024-03-11|C"]);
        let out = format_and_validate_evidences(&evidences, &valid, &date_map());
        assert_eq!(out, vec!["2024-03-10|A"]);
    }

    #[test]
    fn formatting_adds_date_prefix_from_map() {
        let valid: HashSet<String> = ["B".to_string()].into();
        let out = format_and_validate_evidences(&json!(["B"]), &valid, &date_map());
        assert_eq!(out, vec!["2024-03-11|B"]);
    }

    #[test]
    fn completion_overlays_only_evidences() {
        let mut original = json!({
            "hard_skills": [
                {"value": "Python", "level": "high", "evidences": []},
                {"value": "Rust", "level": "medium", "evidences": ["2024-03-10|A"]}
            ]
        });
        let completed = json!({
            "hard_skills": [
                {"value": "Python", "level": "low", "evidences": ["A"]}
            ]
        });
        let valid: HashSet<String> = ["A".to_string()].into();
        merge_evidences_recursive(&mut original, &completed, &valid, &date_map());
        let skills = original["hard_skills"].as_array().unwrap();
        assert_eq!(skills[0]["evidences"], json!(["2024-03-10|A"]));
        // Level untouched: completion only fills evidences.
        assert_eq!(skills[0]["level"], json!("high"));
        assert_eq!(skills[1]["evidences"], json!(["2024-03-10|A"]));
    }

    #[test]
    fn entries_without_evidence_are_pruned_recursively() {
        let value = json!({
            "hard_skills": [
                {"value": "Python", "evidences": ["2024-03-10|A"]},
                {"value": "Go", "evidences": []}
            ]
        });
        let cleaned = remove_entries_without_evidence(value).unwrap();
        let skills = cleaned["hard_skills"].as_array().unwrap();
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0]["value"], json!("Python"));
    }

    #[test]
    fn opinion_tendency_filter_keeps_allowed_types() {
        let mut entries = json!([
            {"value": "ship weekly", "type": "suggestion", "evidences": ["A"]},
            {"value": "likes cats", "type": "fact", "evidences": ["A"]},
            {"value": "agrees", "type": "Stance", "evidences": ["A"]}
        ]);
        filter_opinion_tendency(&mut entries);
        let items = entries.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["type"], json!("suggestion"));
    }
}
