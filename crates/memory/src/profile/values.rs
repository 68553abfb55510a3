//! Value/evidence list normalization and merging
//!
//! Scalar profile fields are lists of `{value, level?, evidences}`. Merging
//! deduplicates by value; graded fields keep the highest level seen
//! (expert/high/strong/advanced > medium/intermediate > low/basic/…).

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use evermem_core::ValueEntry;

use super::evidence::{conversation_id_from_evidence, ensure_str_list, format_evidence_entry};

/// Priority of a level string; unknown levels rank lowest.
pub fn level_priority(level: &str) -> u8 {
    match level.trim().to_lowercase().as_str() {
        "high" | "advanced" | "strong" | "expert" => 3,
        "medium" | "intermediate" => 2,
        "low" | "basic" | "beginner" | "familiar" | "weak" => 1,
        _ => 0,
    }
}

/// The higher of two levels, preserving the original casing of the winner.
fn higher_level(a: Option<&str>, b: Option<&str>) -> Option<String> {
    match (a, b) {
        (None, None) => None,
        (Some(a), None) => Some(a.trim().to_string()).filter(|s| !s.is_empty()),
        (None, Some(b)) => Some(b.trim().to_string()).filter(|s| !s.is_empty()),
        (Some(a), Some(b)) => {
            let winner = if level_priority(a) >= level_priority(b) { a } else { b };
            Some(winner.trim().to_string()).filter(|s| !s.is_empty())
        }
    }
}

fn merge_into(
    merged: &mut Vec<ValueEntry>,
    index: &mut HashMap<String, usize>,
    source: &[ValueEntry],
    keep_highest_level: bool,
) {
    for item in source {
        let key = item.value.trim().to_string();
        if key.is_empty() {
            continue;
        }
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            merged.push(ValueEntry {
                value: key.clone(),
                level: None,
                evidences: Vec::new(),
            });
            merged.len() - 1
        });
        let entry = &mut merged[slot];
        for ev in &item.evidences {
            if !ev.is_empty() && !entry.evidences.contains(ev) {
                entry.evidences.push(ev.clone());
            }
        }
        if keep_highest_level {
            entry.level = higher_level(entry.level.as_deref(), item.level.as_deref());
        } else if let Some(level) = item
            .level
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty())
        {
            entry.level = Some(level.to_string());
        }
    }
}

/// Merge any number of lists keeping the highest level per value.
pub fn merge_keep_highest_level(
    sources: &[Option<&Vec<ValueEntry>>],
) -> Option<Vec<ValueEntry>> {
    let mut merged = Vec::new();
    let mut index = HashMap::new();
    for source in sources.iter().flatten() {
        merge_into(&mut merged, &mut index, source, true);
    }
    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}

/// Merge two lists by evidence union; the incoming level, when present,
/// overwrites.
pub fn merge_value_lists(
    existing: Option<&Vec<ValueEntry>>,
    incoming: Option<&Vec<ValueEntry>>,
) -> Option<Vec<ValueEntry>> {
    let mut merged = Vec::new();
    let mut index = HashMap::new();
    if let Some(existing) = existing {
        merge_into(&mut merged, &mut index, existing, false);
    }
    if let Some(incoming) = incoming {
        merge_into(&mut merged, &mut index, incoming, false);
    }
    if merged.is_empty() {
        None
    } else {
        Some(merged)
    }
}

/// Extract `{value, level?, evidences}` entries from the heterogeneous
/// shapes the LLM produces for one field: an object with `value`, a map of
/// value → evidences, a list of either, or a bare string. Evidences are
/// validated against the batch and date-formatted.
pub fn extract_values_with_evidence(
    raw: &Value,
    field_name: &str,
    valid_ids: Option<&HashSet<String>>,
    date_map: &HashMap<String, String>,
) -> Option<Vec<ValueEntry>> {
    let mut entries: Vec<ValueEntry> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    let mut add = |value: &Value, evidences: Option<&Value>, level: Option<&Value>| {
        let value_str = match value {
            Value::String(s) => s.trim().to_string(),
            Value::Null => return,
            other => other.to_string(),
        };
        if value_str.is_empty() {
            return;
        }

        let mut formatted: Vec<String> = Vec::new();
        if let Some(evidences) = evidences {
            for item in ensure_str_list(evidences) {
                let Some(entry) = format_evidence_entry(&item, date_map) else {
                    continue;
                };
                if let Some(valid) = valid_ids {
                    match conversation_id_from_evidence(&entry) {
                        Some(id) if valid.contains(&id) => {}
                        other => {
                            tracing::debug!(
                                conversation_id = ?other,
                                field = field_name,
                                "dropping evidence with unknown conversation id"
                            );
                            continue;
                        }
                    }
                }
                if !formatted.contains(&entry) {
                    formatted.push(entry);
                }
            }
        }
        let level_str = level
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string);

        let slot = *index.entry(value_str.clone()).or_insert_with(|| {
            if formatted.is_empty() {
                tracing::info!(value = %value_str, field = field_name, "LLM entry arrived without evidences");
            }
            entries.push(ValueEntry {
                value: value_str.clone(),
                level: None,
                evidences: Vec::new(),
            });
            entries.len() - 1
        });
        let entry = &mut entries[slot];
        if level_str.is_some() {
            entry.level = level_str;
        }
        for ev in formatted {
            if !entry.evidences.contains(&ev) {
                entry.evidences.push(ev);
            }
        }
    };

    match raw {
        Value::Object(map) => {
            if map.contains_key("value") {
                add(
                    map.get("value").unwrap_or(&Value::Null),
                    map.get("evidences"),
                    map.get("level"),
                );
            } else {
                for (key, evidences) in map {
                    if key == "evidences" {
                        continue;
                    }
                    add(&Value::String(key.clone()), Some(evidences), map.get("level"));
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(map) => {
                        if map.contains_key("value") {
                            add(
                                map.get("value").unwrap_or(&Value::Null),
                                map.get("evidences"),
                                map.get("level"),
                            );
                        } else {
                            let shared_evidences = map.get("evidences");
                            let mut processed = false;
                            for (key, value) in map {
                                if key == "evidences" {
                                    continue;
                                }
                                add(
                                    &Value::String(key.clone()),
                                    shared_evidences.or(Some(value)),
                                    map.get("level"),
                                );
                                processed = true;
                            }
                            if !processed {
                                add(item, None, map.get("level"));
                            }
                        }
                    }
                    Value::String(_) => add(item, None, None),
                    Value::Null => {}
                    other => add(other, None, None),
                }
            }
        }
        Value::Null => {}
        other => add(other, None, None),
    }

    if entries.is_empty() {
        None
    } else {
        Some(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(value: &str, level: Option<&str>, evidences: &[&str]) -> ValueEntry {
        ValueEntry {
            value: value.to_string(),
            level: level.map(str::to_string),
            evidences: evidences.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn level_ordering_matches_the_priority_table() {
        assert!(level_priority("expert") > level_priority("medium"));
        assert!(level_priority("Intermediate") > level_priority("beginner"));
        assert!(level_priority("weak") > level_priority(""));
        assert_eq!(level_priority("mystery"), 0);
    }

    #[test]
    fn keep_highest_level_merges_evidences() {
        let a = vec![entry("Python", Some("high"), &["2024-03-10|A"])];
        let b = vec![entry("Python", Some("medium"), &["2024-03-11|B"])];
        let merged = merge_keep_highest_level(&[Some(&a), Some(&b)]).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].level.as_deref(), Some("high"));
        assert_eq!(merged[0].evidences, vec!["2024-03-10|A", "2024-03-11|B"]);
    }

    #[test]
    fn plain_merge_unions_evidence_in_insertion_order() {
        let a = vec![entry("calm", None, &["2024-03-10|A"])];
        let b = vec![
            entry("calm", None, &["2024-03-10|A", "2024-03-11|B"]),
            entry("direct", None, &["2024-03-11|B"]),
        ];
        let merged = merge_value_lists(Some(&a), Some(&b)).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].value, "calm");
        assert_eq!(merged[0].evidences, vec!["2024-03-10|A", "2024-03-11|B"]);
    }

    #[test]
    fn empty_inputs_merge_to_none() {
        assert!(merge_value_lists(None, None).is_none());
        assert!(merge_keep_highest_level(&[None, None]).is_none());
    }

    #[test]
    fn extract_handles_object_list_shape() {
        let date_map = HashMap::from([("A".to_string(), "2024-03-10".to_string())]);
        let valid: HashSet<String> = ["A".to_string()].into();
        let raw = json!([
            {"value": "Python", "level": "high", "evidences": ["A"]},
            {"value": "Go", "evidences": ["C"]}
        ]);
        let entries =
            extract_values_with_evidence(&raw, "hard_skills", Some(&valid), &date_map).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].evidences, vec!["2024-03-10|A"]);
        // C is outside the batch: Go survives but with no evidence, to be
        // pruned by the evidence-completion path.
        assert!(entries[1].evidences.is_empty());
    }

    #[test]
    fn extract_handles_bare_strings_and_maps() {
        let date_map = HashMap::new();
        let entries =
            extract_values_with_evidence(&json!(["tidy", "curious"]), "personality", None, &date_map)
                .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value, "tidy");

        let raw = json!({"likes jazz": ["2024-03-10|A"]});
        let entries = extract_values_with_evidence(&raw, "interests", None, &date_map).unwrap();
        assert_eq!(entries[0].value, "likes jazz");
        assert_eq!(entries[0].evidences, vec!["2024-03-10|A"]);
    }
}
