//! Incremental role management
//!
//! Role names come from the closed `GroupRole` set; anything else the model
//! invents is filtered. Per (role, user) the historical evidences are
//! preserved, new ones validated against the batch (including a participant
//! check), confidence promotes to strong if either side is strong, and
//! assignments sort strong-first then by user name.

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};

use evermem_core::{GroupRole, MemCell, RoleAssignment, TopicConfidence};

use super::topics::merge_evidence_ids;

const ROLE_EVIDENCE_CAP: usize = 50;

/// Drop role names outside the closed set.
fn filter_valid_roles<'a, T>(
    roles: &'a BTreeMap<String, T>,
    source: &str,
) -> Vec<(&'a String, &'a T)> {
    let (valid, invalid): (Vec<_>, Vec<_>) = roles
        .iter()
        .partition(|(name, _)| GroupRole::from_str_loose(name).is_some());
    if !invalid.is_empty() {
        tracing::warn!(
            source,
            invalid = ?invalid.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            "filtered invalid role names"
        );
    }
    valid
}

/// Evidences valid for a (role, user): in the batch and the user among the
/// MemCell's participants.
fn validate_role_evidences(
    evidences: &[String],
    user_id: &str,
    memcells: &[MemCell],
    valid_ids: &HashSet<String>,
) -> Vec<String> {
    let participants: HashMap<&str, &Vec<String>> = memcells
        .iter()
        .map(|cell| (cell.event_id.as_str(), &cell.participants))
        .collect();
    evidences
        .iter()
        .filter(|id| {
            if !valid_ids.contains(*id) {
                tracing::warn!(memcell_id = %id, "role evidence outside the batch");
                return false;
            }
            let ok = participants
                .get(id.as_str())
                .map(|p| p.iter().any(|u| u == user_id))
                .unwrap_or(false);
            if !ok {
                tracing::warn!(memcell_id = %id, user_id, "user not a participant of evidence memcell");
            }
            ok
        })
        .cloned()
        .collect()
}

/// Merge the LLM's role output with the historical assignments.
pub fn process_roles(
    llm_roles: &Value,
    existing_roles: &BTreeMap<String, Vec<RoleAssignment>>,
    speaker_names: &HashMap<String, String>,
    memcells: &[MemCell],
    valid_ids: &HashSet<String>,
) -> BTreeMap<String, Vec<RoleAssignment>> {
    let timestamps: HashMap<String, DateTime<FixedOffset>> = memcells
        .iter()
        .map(|cell| (cell.event_id.clone(), cell.timestamp))
        .collect();

    // Historical (role, user) -> assignment, with invalid role names gone.
    let mut historical: HashMap<(String, String), &RoleAssignment> = HashMap::new();
    for (role_name, assignments) in filter_valid_roles(existing_roles, "historical data") {
        for assignment in assignments {
            historical.insert(
                (role_name.clone(), assignment.user_id.clone()),
                assignment,
            );
        }
    }

    let llm_map: BTreeMap<String, Value> = llm_roles
        .as_object()
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();

    let mut processed: BTreeMap<String, Vec<RoleAssignment>> = BTreeMap::new();
    for (role_name, assignments) in filter_valid_roles(&llm_map, "LLM output") {
        let Some(items) = assignments.as_array() else {
            continue;
        };
        let mut out: Vec<RoleAssignment> = Vec::new();
        for item in items {
            // Old format: a bare speaker id string; new format: an object.
            let (speaker_id, confidence, llm_evidences) = match item {
                Value::String(id) => (id.clone(), TopicConfidence::Weak, Vec::new()),
                Value::Object(map) => {
                    let speaker = map
                        .get("speaker")
                        .or_else(|| map.get("user_id"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let confidence = match map.get("confidence").and_then(Value::as_str) {
                        Some("strong") => TopicConfidence::Strong,
                        _ => TopicConfidence::Weak,
                    };
                    let evidences = map
                        .get("evidences")
                        .and_then(Value::as_array)
                        .map(|list| {
                            list.iter()
                                .filter_map(|v| v.as_str().map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                    (speaker, confidence, evidences)
                }
                _ => continue,
            };
            if speaker_id.is_empty() {
                continue;
            }

            let user_name = speaker_names
                .get(&speaker_id)
                .cloned()
                .unwrap_or_else(|| speaker_id.clone());

            let key = (role_name.clone(), speaker_id.clone());
            let (evidences, confidence) = match historical.get(&key) {
                Some(prior) => {
                    let validated =
                        validate_role_evidences(&llm_evidences, &speaker_id, memcells, valid_ids);
                    let merged = merge_evidence_ids(
                        &prior.evidences,
                        &validated,
                        valid_ids,
                        &timestamps,
                        ROLE_EVIDENCE_CAP,
                    );
                    let final_confidence = if confidence == TopicConfidence::Strong
                        || prior.confidence == TopicConfidence::Strong
                    {
                        TopicConfidence::Strong
                    } else {
                        confidence
                    };
                    (merged, final_confidence)
                }
                None => (
                    validate_role_evidences(&llm_evidences, &speaker_id, memcells, valid_ids),
                    confidence,
                ),
            };

            out.push(RoleAssignment {
                user_id: speaker_id,
                user_name,
                confidence,
                evidences,
            });
        }

        out.sort_by(|a, b| {
            let strong_first = (a.confidence != TopicConfidence::Strong)
                .cmp(&(b.confidence != TopicConfidence::Strong));
            strong_first.then_with(|| a.user_name.cmp(&b.user_name))
        });
        if !out.is_empty() {
            processed.insert(role_name.clone(), out);
        }
    }
    processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use evermem_core::RawDataType;
    use serde_json::json;

    fn memcell(event_id: &str, participants: &[&str]) -> MemCell {
        MemCell {
            event_id: event_id.to_string(),
            user_id_list: vec![],
            group_id: None,
            participants: participants.iter().map(|s| s.to_string()).collect(),
            original_data: vec![],
            timestamp: DateTime::parse_from_rfc3339("2024-03-10T10:00:00+08:00").unwrap(),
            data_type: RawDataType::Conversation,
            summary: String::new(),
            episode: None,
            event_log: None,
            extend: std::collections::BTreeMap::new(),
        }
    }

    fn names() -> HashMap<String, String> {
        HashMap::from([
            ("u1".to_string(), "Alice".to_string()),
            ("u2".to_string(), "Bob".to_string()),
        ])
    }

    #[test]
    fn invalid_role_names_are_filtered() {
        let cells = vec![memcell("A", &["u1"])];
        let valid: HashSet<String> = ["A".to_string()].into();
        let llm = json!({
            "leader": [{"speaker": "u1", "confidence": "strong", "evidences": ["A"]}],
            "wizard": [{"speaker": "u2", "confidence": "strong", "evidences": ["A"]}]
        });
        let roles = process_roles(&llm, &BTreeMap::new(), &names(), &cells, &valid);
        assert!(roles.contains_key("leader"));
        assert!(!roles.contains_key("wizard"));
    }

    #[test]
    fn evidence_requires_participation() {
        let cells = vec![memcell("A", &["u2"])];
        let valid: HashSet<String> = ["A".to_string()].into();
        let llm = json!({
            "contributor": [{"speaker": "u1", "confidence": "weak", "evidences": ["A"]}]
        });
        let roles = process_roles(&llm, &BTreeMap::new(), &names(), &cells, &valid);
        // u1 is not a participant of A: evidence dropped, assignment kept.
        assert!(roles["contributor"][0].evidences.is_empty());
    }

    #[test]
    fn confidence_promotes_and_history_merges() {
        let cells = vec![memcell("A", &["u1"])];
        let valid: HashSet<String> = ["A".to_string()].into();
        let existing = BTreeMap::from([(
            "leader".to_string(),
            vec![RoleAssignment {
                user_id: "u1".to_string(),
                user_name: "Alice".to_string(),
                confidence: TopicConfidence::Strong,
                evidences: vec!["OLD".to_string()],
            }],
        )]);
        let llm = json!({
            "leader": [{"speaker": "u1", "confidence": "weak", "evidences": ["A"]}]
        });
        let roles = process_roles(&llm, &existing, &names(), &cells, &valid);
        let assignment = &roles["leader"][0];
        assert_eq!(assignment.confidence, TopicConfidence::Strong);
        assert_eq!(assignment.evidences, vec!["OLD", "A"]);
    }

    #[test]
    fn assignments_sort_strong_first_then_name() {
        let cells = vec![memcell("A", &["u1", "u2"])];
        let valid: HashSet<String> = ["A".to_string()].into();
        let llm = json!({
            "contributor": [
                {"speaker": "u2", "confidence": "weak", "evidences": ["A"]},
                {"speaker": "u1", "confidence": "strong", "evidences": ["A"]}
            ]
        });
        let roles = process_roles(&llm, &BTreeMap::new(), &names(), &cells, &valid);
        let assignments = &roles["contributor"];
        assert_eq!(assignments[0].user_name, "Alice");
        assert_eq!(assignments[0].confidence, TopicConfidence::Strong);
        assert_eq!(assignments[1].user_name, "Bob");
    }

    #[test]
    fn bare_string_assignments_are_accepted_as_weak() {
        let cells = vec![memcell("A", &["u1"])];
        let valid: HashSet<String> = ["A".to_string()].into();
        let llm = json!({"observer": ["u1"]});
        let roles = process_roles(&llm, &BTreeMap::new(), &names(), &cells, &valid);
        assert_eq!(roles["observer"][0].confidence, TopicConfidence::Weak);
    }
}
