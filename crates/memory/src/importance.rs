//! Group importance statistics
//!
//! Per batch and group: total message count, per-user speak counts and
//! mention counts. The evidence list is a sliding window of 10; a group is
//! important to a user once the aggregated thresholds are met.

use std::collections::HashMap;

use evermem_core::{GroupImportanceEvidence, ImportanceEvidence, MemCell};

/// Aggregate one batch into per-user importance evidence.
pub fn aggregate_batch(memcells: &[MemCell], group_id: &str) -> Vec<ImportanceEvidence> {
    let mut total_messages: u64 = 0;
    let mut speak: HashMap<String, u64> = HashMap::new();
    let mut refer: HashMap<String, u64> = HashMap::new();

    for memcell in memcells {
        for msg in &memcell.original_data {
            total_messages += 1;
            if !msg.speaker_id.is_empty() {
                *speak.entry(msg.speaker_id.clone()).or_default() += 1;
            }
            for entry in &msg.refer_list {
                if !entry.id.is_empty() {
                    *refer.entry(entry.id.clone()).or_default() += 1;
                }
            }
        }
    }

    let mut user_ids: Vec<String> = speak.keys().chain(refer.keys()).cloned().collect();
    user_ids.sort();
    user_ids.dedup();

    user_ids
        .into_iter()
        .map(|user_id| ImportanceEvidence {
            speak_count: speak.get(&user_id).copied().unwrap_or(0),
            refer_count: refer.get(&user_id).copied().unwrap_or(0),
            conversation_count: total_messages,
            user_id,
            group_id: group_id.to_string(),
        })
        .collect()
}

/// A group is important to a user iff: speak+refer ≥ 5, or
/// speak/conversation > 0.1, or refer ≥ 2, aggregated over the window.
pub fn is_important(evidence_list: &[ImportanceEvidence]) -> bool {
    let mut speak: u64 = 0;
    let mut refer: u64 = 0;
    let mut conversations: u64 = 0;
    for evidence in evidence_list {
        speak += evidence.speak_count;
        refer += evidence.refer_count;
        conversations += evidence.conversation_count;
    }
    if speak + refer >= 5 {
        return true;
    }
    if conversations > 0 && speak as f64 / conversations as f64 > 0.1 {
        return true;
    }
    refer >= 2
}

/// Append this batch's evidence for one user onto the existing window,
/// truncate to 10 newest, and recompute the importance flag.
pub fn merge_importance(
    existing: Option<GroupImportanceEvidence>,
    batch_evidence: &[ImportanceEvidence],
    user_id: &str,
) -> Option<GroupImportanceEvidence> {
    let matching = batch_evidence.iter().find(|e| e.user_id == user_id);

    let mut merged = match (existing, matching) {
        (None, None) => return None,
        (Some(existing), None) => existing,
        (None, Some(evidence)) => GroupImportanceEvidence {
            group_id: evidence.group_id.clone(),
            evidence_list: vec![evidence.clone()],
            is_important: false,
        },
        (Some(mut existing), Some(evidence)) => {
            existing.evidence_list.push(evidence.clone());
            existing
        }
    };

    if merged.evidence_list.len() > 10 {
        let drop = merged.evidence_list.len() - 10;
        merged.evidence_list.drain(..drop);
    }
    merged.is_important = is_important(&merged.evidence_list);
    Some(merged)
}
