//! Incremental topic management
//!
//! LLM-output topics either update an existing topic (merging evidences,
//! promoting confidence, recomputing `last_active_at`) or append as new.
//! When the set would exceed `max_topics`, the eviction order is: topics
//! implemented and inactive for 30 days before the batch's reference time,
//! else the oldest by `last_active_at`.

use chrono::{DateTime, Duration, FixedOffset};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use evermem_core::{MemCell, TopicConfidence, TopicInfo, TopicStatus};

pub const DEFAULT_MAX_TOPICS: usize = 5;
const TOPIC_EVIDENCE_CAP: usize = 10;
const STALE_DAYS: i64 = 30;

fn parse_status(value: Option<&Value>) -> TopicStatus {
    match value.and_then(Value::as_str) {
        Some("implementing") => TopicStatus::Implementing,
        Some("implemented") => TopicStatus::Implemented,
        _ => TopicStatus::Exploring,
    }
}

fn parse_confidence(value: Option<&Value>) -> TopicConfidence {
    match value.and_then(Value::as_str) {
        Some("strong") => TopicConfidence::Strong,
        _ => TopicConfidence::Weak,
    }
}

fn new_topic_id() -> String {
    format!("topic_{}", &Uuid::new_v4().simple().to_string()[..8])
}

/// Keep only evidences naming MemCells of this batch.
pub fn validate_evidences(evidences: &[String], valid_ids: &HashSet<String>) -> Vec<String> {
    let (valid, invalid): (Vec<String>, Vec<String>) = evidences
        .iter()
        .cloned()
        .partition(|id| valid_ids.contains(id));
    if !invalid.is_empty() {
        tracing::warn!(count = invalid.len(), "filtered non-existent memcell evidences");
    }
    valid
}

/// Historical order preserved; validated new ids sorted by MemCell timestamp
/// and appended; capped at `max_count` keeping the newest.
pub fn merge_evidence_ids(
    historical: &[String],
    new: &[String],
    valid_ids: &HashSet<String>,
    timestamps: &HashMap<String, DateTime<FixedOffset>>,
    max_count: usize,
) -> Vec<String> {
    let mut valid_new = validate_evidences(new, valid_ids);
    valid_new.sort_by_key(|id| timestamps.get(id).copied());

    let mut seen: HashSet<String> = historical.iter().cloned().collect();
    let mut merged: Vec<String> = historical.to_vec();
    for id in valid_new {
        if seen.insert(id.clone()) {
            merged.push(id);
        }
    }
    if merged.len() > max_count {
        let drop = merged.len() - max_count;
        merged.drain(..drop);
    }
    merged
}

/// Latest MemCell timestamp among the given ids (all MemCells when the id
/// filter is empty); `None` when nothing matches.
pub fn latest_timestamp(
    memcells: &[MemCell],
    ids: &[String],
) -> Option<DateTime<FixedOffset>> {
    let filter: Option<HashSet<&String>> = if ids.is_empty() {
        None
    } else {
        Some(ids.iter().collect())
    };
    memcells
        .iter()
        .filter(|cell| {
            filter
                .as_ref()
                .map(|f| f.contains(&cell.event_id))
                .unwrap_or(true)
        })
        .map(|cell| cell.timestamp)
        .max()
}

/// The topic to evict when the set is full: prefer implemented topics stale
/// past 30 days before `reference_time`, else the oldest.
fn topic_to_evict(topics: &[TopicInfo], reference_time: DateTime<FixedOffset>) -> Option<String> {
    let threshold = reference_time - Duration::days(STALE_DAYS);
    let stale_implemented = topics
        .iter()
        .filter(|t| {
            t.status == TopicStatus::Implemented
                && t.last_active_at.map(|ts| ts < threshold).unwrap_or(false)
        })
        .min_by_key(|t| t.last_active_at);
    if let Some(topic) = stale_implemented {
        return Some(topic.id.clone());
    }
    topics
        .iter()
        .min_by_key(|t| t.last_active_at)
        .map(|t| t.id.clone())
}

/// Apply the LLM's topic output on top of the existing topics.
pub fn apply_incremental_updates(
    llm_topics: &[Value],
    existing: &[TopicInfo],
    memcells: &[MemCell],
    valid_ids: &HashSet<String>,
    max_topics: usize,
) -> Vec<TopicInfo> {
    let timestamps: HashMap<String, DateTime<FixedOffset>> = memcells
        .iter()
        .map(|cell| (cell.event_id.clone(), cell.timestamp))
        .collect();
    let reference_time = latest_timestamp(memcells, &[]).unwrap_or_else(evermem_core::time::now_local);

    let mut topics: Vec<TopicInfo> = existing.to_vec();

    for llm_topic in llm_topics {
        let update_type = llm_topic
            .get("update_type")
            .and_then(Value::as_str)
            .unwrap_or("new");
        let llm_evidences: Vec<String> = llm_topic
            .get("evidences")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let llm_confidence = parse_confidence(llm_topic.get("confidence"));
        let old_topic_id = llm_topic.get("old_topic_id").and_then(Value::as_str);

        if update_type == "update" {
            let Some(idx) = old_topic_id
                .and_then(|id| topics.iter().position(|t| t.id == id))
            else {
                continue;
            };
            let merged_evidences = merge_evidence_ids(
                &topics[idx].evidences,
                &llm_evidences,
                valid_ids,
                &timestamps,
                TOPIC_EVIDENCE_CAP,
            );
            let last_active_at =
                latest_timestamp(memcells, &merged_evidences).or(topics[idx].last_active_at);
            let topic = &mut topics[idx];
            if let Some(name) = llm_topic.get("name").and_then(Value::as_str) {
                if !name.is_empty() {
                    topic.name = name.to_string();
                }
            }
            if let Some(summary) = llm_topic.get("summary").and_then(Value::as_str) {
                if !summary.is_empty() {
                    topic.summary = summary.to_string();
                }
            }
            if llm_topic.get("status").is_some() {
                topic.status = parse_status(llm_topic.get("status"));
            }
            // Confidence keeps the stronger side.
            if llm_confidence == TopicConfidence::Strong {
                topic.confidence = TopicConfidence::Strong;
            }
            topic.evidences = merged_evidences;
            topic.last_active_at = last_active_at;
            topic.update_type = "update".to_string();
            tracing::debug!(topic = %topic.name, evidences = topic.evidences.len(), "topic updated");
        } else {
            let evidences = validate_evidences(&llm_evidences, valid_ids);
            let last_active_at = latest_timestamp(memcells, &evidences);
            let new_topic = TopicInfo {
                id: new_topic_id(),
                name: llm_topic
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                summary: llm_topic
                    .get("summary")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                status: parse_status(llm_topic.get("status")),
                confidence: llm_confidence,
                evidences,
                last_active_at,
                update_type: "new".to_string(),
            };

            if topics.len() >= max_topics {
                if let Some(evict_id) = topic_to_evict(&topics, reference_time) {
                    if let Some(evicted) = topics.iter().find(|t| t.id == evict_id) {
                        tracing::info!(
                            evicted = %evicted.name,
                            replacement = %new_topic.name,
                            "topic set full, evicting"
                        );
                    }
                    topics.retain(|t| t.id != evict_id);
                }
            }
            topics.push(new_topic);
        }
    }

    // Newest first.
    topics.sort_by(|a, b| b.last_active_at.cmp(&a.last_active_at));
    topics
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use evermem_core::RawDataType;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn memcell(event_id: &str, ts: &str) -> MemCell {
        MemCell {
            event_id: event_id.to_string(),
            user_id_list: vec![],
            group_id: None,
            participants: vec![],
            original_data: vec![],
            timestamp: DateTime::parse_from_rfc3339(ts).unwrap(),
            data_type: RawDataType::Conversation,
            summary: String::new(),
            episode: None,
            event_log: None,
            extend: BTreeMap::new(),
        }
    }

    fn topic(id: &str, status: TopicStatus, last_active: &str) -> TopicInfo {
        TopicInfo {
            id: id.to_string(),
            name: id.to_string(),
            summary: String::new(),
            status,
            confidence: TopicConfidence::Weak,
            evidences: vec![],
            last_active_at: Some(DateTime::parse_from_rfc3339(last_active).unwrap()),
            update_type: "new".to_string(),
        }
    }

    #[test]
    fn update_merges_evidences_and_promotes_confidence() {
        let cells = vec![
            memcell("A", "2024-03-10T10:00:00+08:00"),
            memcell("B", "2024-03-12T10:00:00+08:00"),
        ];
        let valid: HashSet<String> = ["A".to_string(), "B".to_string()].into();
        let mut existing = topic("t1", TopicStatus::Exploring, "2024-03-01T10:00:00+08:00");
        existing.evidences = vec!["OLD".to_string()];

        let llm = vec![json!({
            "update_type": "update",
            "old_topic_id": "t1",
            "name": "release",
            "confidence": "strong",
            "evidences": ["B", "A", "GHOST"]
        })];
        let topics = apply_incremental_updates(&llm, &[existing], &cells, &valid, 5);
        assert_eq!(topics.len(), 1);
        let topic = &topics[0];
        // Historical preserved first, valid new appended in time order.
        assert_eq!(topic.evidences, vec!["OLD", "A", "B"]);
        assert_eq!(topic.confidence, TopicConfidence::Strong);
        assert_eq!(
            topic.last_active_at.unwrap(),
            DateTime::parse_from_rfc3339("2024-03-12T10:00:00+08:00").unwrap()
        );
    }

    #[test]
    fn new_topic_evicts_stale_implemented_first() {
        let cells = vec![memcell("A", "2024-03-10T10:00:00+08:00")];
        let valid: HashSet<String> = ["A".to_string()].into();
        let existing = vec![
            topic("stale", TopicStatus::Implemented, "2024-01-01T10:00:00+08:00"),
            topic("older", TopicStatus::Exploring, "2023-12-01T10:00:00+08:00"),
            topic("recent", TopicStatus::Implementing, "2024-03-05T10:00:00+08:00"),
        ];
        let llm = vec![json!({
            "update_type": "new",
            "name": "fresh topic",
            "evidences": ["A"]
        })];
        let topics = apply_incremental_updates(&llm, &existing, &cells, &valid, 3);
        assert_eq!(topics.len(), 3);
        // The stale implemented topic goes, not the older exploring one.
        assert!(!topics.iter().any(|t| t.id == "stale"));
        assert!(topics.iter().any(|t| t.id == "older"));
        assert!(topics.iter().any(|t| t.name == "fresh topic"));
    }

    #[test]
    fn new_topic_evicts_oldest_when_nothing_is_stale_implemented() {
        let cells = vec![memcell("A", "2024-03-10T10:00:00+08:00")];
        let valid: HashSet<String> = ["A".to_string()].into();
        let existing = vec![
            topic("t-old", TopicStatus::Exploring, "2024-03-01T10:00:00+08:00"),
            topic("t-new", TopicStatus::Exploring, "2024-03-08T10:00:00+08:00"),
        ];
        let llm = vec![json!({"update_type": "new", "name": "n", "evidences": ["A"]})];
        let topics = apply_incremental_updates(&llm, &existing, &cells, &valid, 2);
        assert!(!topics.iter().any(|t| t.id == "t-old"));
    }

    #[test]
    fn evidence_cap_keeps_the_newest_ten() {
        let cells: Vec<MemCell> = (0..12)
            .map(|i| memcell(&format!("c{i}"), &format!("2024-03-{:02}T10:00:00+08:00", i + 1)))
            .collect();
        let valid: HashSet<String> = cells.iter().map(|c| c.event_id.clone()).collect();
        let timestamps: HashMap<_, _> = cells
            .iter()
            .map(|c| (c.event_id.clone(), c.timestamp))
            .collect();
        let new: Vec<String> = cells.iter().map(|c| c.event_id.clone()).collect();
        let merged = merge_evidence_ids(&[], &new, &valid, &timestamps, 10);
        assert_eq!(merged.len(), 10);
        assert_eq!(merged[0], "c2");
        assert_eq!(merged[9], "c11");
    }
}
