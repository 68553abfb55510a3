//! Group-aware aggregation
//!
//! Groups candidates by `group_id`, sorts each group's candidates by
//! timestamp ascending, and ranks groups by their importance score
//! `(Σ speak + Σ refer) / Σ conversations` over the matching group
//! importance evidence (0 when the denominator is 0). MemCell payloads and
//! profiles are fetched in two concurrent batch reads.

use std::collections::HashMap;
use std::sync::Arc;

use evermem_core::{
    Candidate, GroupImportanceEvidence, MemCellStore, RawMessage, UserProfileStore,
};

use crate::Result;

/// Parallel arrays indexed by group, groups ordered by importance.
#[derive(Debug, Clone, Default)]
pub struct GroupedResult {
    pub group_ids: Vec<String>,
    pub memories: Vec<Vec<Candidate>>,
    pub scores: Vec<Vec<f32>>,
    pub importance_scores: Vec<f64>,
    /// Original message payloads of the MemCells behind each group's
    /// candidates.
    pub original_data: Vec<Vec<Vec<RawMessage>>>,
    pub total_count: usize,
}

fn importance_score(evidence: Option<&GroupImportanceEvidence>) -> f64 {
    let Some(evidence) = evidence else {
        return 0.0;
    };
    let mut speak: u64 = 0;
    let mut refer: u64 = 0;
    let mut conversations: u64 = 0;
    for entry in &evidence.evidence_list {
        speak += entry.speak_count;
        refer += entry.refer_count;
        conversations += entry.conversation_count;
    }
    if conversations == 0 {
        0.0
    } else {
        (speak + refer) as f64 / conversations as f64
    }
}

/// Group candidates by group id with importance ranking.
pub async fn group_by_group_id(
    candidates: Vec<Candidate>,
    memcells: &Arc<dyn MemCellStore>,
    profiles: &Arc<dyn UserProfileStore>,
) -> Result<GroupedResult> {
    // Gather everything the batch reads need.
    let mut memcell_ids: Vec<String> = Vec::new();
    let mut user_group_pairs: Vec<(String, String)> = Vec::new();
    for candidate in &candidates {
        if let Some(ids) = candidate
            .metadata
            .get("memcell_event_id_list")
            .and_then(|v| v.as_array())
        {
            for id in ids.iter().filter_map(|v| v.as_str()) {
                if !memcell_ids.contains(&id.to_string()) {
                    memcell_ids.push(id.to_string());
                }
            }
        }
        if !candidate.user_id.is_empty() && !candidate.group_id.is_empty() {
            let pair = (candidate.user_id.clone(), candidate.group_id.clone());
            if !user_group_pairs.contains(&pair) {
                user_group_pairs.push(pair);
            }
        }
    }

    let (memcell_map, profile_map) = tokio::join!(
        memcells.get_by_event_ids(&memcell_ids),
        profiles.batch_get_by_user_groups(&user_group_pairs),
    );
    let memcell_map = memcell_map?;
    let profile_map = profile_map?;

    // Bucket by group.
    let mut buckets: HashMap<String, (Vec<Candidate>, Vec<Vec<RawMessage>>)> = HashMap::new();
    let mut importance: HashMap<String, f64> = HashMap::new();
    for candidate in candidates {
        let group_id = candidate.group_id.clone();
        let entry = buckets.entry(group_id.clone()).or_default();

        if let Some(ids) = candidate
            .metadata
            .get("memcell_event_id_list")
            .and_then(|v| v.as_array())
        {
            for id in ids.iter().filter_map(|v| v.as_str()) {
                match memcell_map.get(id) {
                    Some(memcell) => entry.1.push(memcell.original_data.clone()),
                    None => tracing::warn!(event_id = id, "memcell not found for candidate"),
                }
            }
        }

        let key = (candidate.user_id.clone(), group_id.clone());
        if let Some(profile) = profile_map.get(&key) {
            let score = importance_score(profile.group_importance_evidence.as_ref());
            importance.insert(group_id.clone(), score);
        }
        entry.0.push(candidate);
    }

    // Sort candidates within a group by time, rank groups by importance.
    let mut ranked: Vec<(String, f64)> = buckets
        .keys()
        .map(|group_id| {
            (
                group_id.clone(),
                importance.get(group_id).copied().unwrap_or(0.0),
            )
        })
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut result = GroupedResult::default();
    for (group_id, score) in ranked {
        let (mut group_candidates, original_data) = buckets.remove(&group_id).unwrap();
        group_candidates.sort_by_key(|c| c.timestamp);
        result.total_count += group_candidates.len();
        result.scores.push(group_candidates.iter().map(|c| c.score).collect());
        result.memories.push(group_candidates);
        result.importance_scores.push(score);
        result.original_data.push(original_data);
        result.group_ids.push(group_id);
    }
    Ok(result)
}
