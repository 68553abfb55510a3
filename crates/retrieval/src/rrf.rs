//! Reciprocal Rank Fusion
//!
//! Combines ranked candidate lists by scoring each document
//! `Σ 1/(k + rank)` across the lists it appears in, keyed by `event_id`.
//! Documents ranked well by several retrievers accumulate the highest
//! fused scores.

use evermem_core::Candidate;
use std::collections::HashMap;

pub const DEFAULT_RRF_K: f32 = 60.0;

/// Fuse two ranked lists.
pub fn reciprocal_rank_fusion(
    first: &[Candidate],
    second: &[Candidate],
    k: f32,
) -> Vec<Candidate> {
    multi_rrf_fusion(&[first, second], k)
}

/// Fuse any number of ranked lists. The first list a document appears in
/// supplies its payload; later appearances only add score.
pub fn multi_rrf_fusion(lists: &[&[Candidate]], k: f32) -> Vec<Candidate> {
    let mut scores: HashMap<String, f32> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    let mut payloads: HashMap<String, Candidate> = HashMap::new();

    for list in lists {
        for (rank, candidate) in list.iter().enumerate() {
            let key = candidate.event_id.clone();
            let contribution = 1.0 / (k + rank as f32 + 1.0);
            match scores.get_mut(&key) {
                Some(score) => *score += contribution,
                None => {
                    scores.insert(key.clone(), contribution);
                    payloads.insert(key.clone(), candidate.clone());
                    order.push(key);
                }
            }
        }
    }

    let mut fused: Vec<Candidate> = order
        .into_iter()
        .map(|key| {
            let mut candidate = payloads.remove(&key).unwrap();
            candidate.score = scores[&key];
            candidate
        })
        .collect();
    fused.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    fused
}
