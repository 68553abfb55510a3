//! MemCell clustering
//!
//! Groups semantically and temporally proximate MemCells; cluster updates
//! are what triggers profile extraction downstream. Assignment compares the
//! new cell's embedding against each cluster's most recent member (cosine)
//! and rejects clusters whose last activity is older than the allowed gap.

use chrono::{DateTime, Duration, FixedOffset};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use evermem_core::MemCell;

/// Clustering tunables.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Minimum cosine similarity to join an existing cluster.
    pub similarity_threshold: f32,
    /// Maximum idle gap before a cluster stops accepting members.
    pub max_time_gap_days: i64,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.65,
            max_time_gap_days: 7,
        }
    }
}

/// Result of assigning one MemCell.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterAssignment {
    pub cluster_id: String,
    pub member_event_ids: Vec<String>,
    pub is_new_cluster: bool,
}

#[derive(Debug, Clone)]
struct ClusterState {
    member_event_ids: Vec<String>,
    last_embedding: Vec<f32>,
    last_updated: DateTime<FixedOffset>,
}

type AssignmentCallback = Arc<dyn Fn(&ClusterAssignment) + Send + Sync>;

/// Incremental in-memory cluster manager.
pub struct ClusterManager {
    options: ClusterOptions,
    clusters: Mutex<HashMap<String, ClusterState>>,
    callbacks: Mutex<Vec<AssignmentCallback>>,
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

impl ClusterManager {
    pub fn new(options: ClusterOptions) -> Self {
        Self {
            options,
            clusters: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback notified after every assignment.
    pub fn on_cluster_assigned<F>(&self, callback: F)
    where
        F: Fn(&ClusterAssignment) + Send + Sync + 'static,
    {
        self.callbacks.lock().unwrap().push(Arc::new(callback));
    }

    /// Assign a MemCell to the best matching cluster, or open a new one.
    pub fn assign(&self, memcell: &MemCell) -> ClusterAssignment {
        let embedding = memcell.embedding().unwrap_or_default();
        let gap = Duration::days(self.options.max_time_gap_days);

        let mut clusters = self.clusters.lock().unwrap();
        let mut best: Option<(String, f32)> = None;
        for (id, state) in clusters.iter() {
            if memcell.timestamp - state.last_updated > gap {
                continue;
            }
            let similarity = cosine(&embedding, &state.last_embedding);
            if similarity >= self.options.similarity_threshold
                && best.as_ref().map(|(_, s)| similarity > *s).unwrap_or(true)
            {
                best = Some((id.clone(), similarity));
            }
        }

        let assignment = match best {
            Some((cluster_id, similarity)) => {
                let state = clusters.get_mut(&cluster_id).unwrap();
                state.member_event_ids.push(memcell.event_id.clone());
                state.last_embedding = embedding;
                state.last_updated = memcell.timestamp;
                tracing::debug!(cluster_id = %cluster_id, similarity, "memcell joined cluster");
                ClusterAssignment {
                    cluster_id,
                    member_event_ids: state.member_event_ids.clone(),
                    is_new_cluster: false,
                }
            }
            None => {
                let cluster_id = format!("cluster_{}", &Uuid::new_v4().simple().to_string()[..8]);
                clusters.insert(
                    cluster_id.clone(),
                    ClusterState {
                        member_event_ids: vec![memcell.event_id.clone()],
                        last_embedding: embedding,
                        last_updated: memcell.timestamp,
                    },
                );
                tracing::debug!(cluster_id = %cluster_id, "opened new cluster");
                ClusterAssignment {
                    cluster_id,
                    member_event_ids: vec![memcell.event_id.clone()],
                    is_new_cluster: true,
                }
            }
        };
        drop(clusters);

        for callback in self.callbacks.lock().unwrap().iter() {
            callback(&assignment);
        }
        assignment
    }

    /// Member event ids of a cluster, when it exists.
    pub fn members(&self, cluster_id: &str) -> Option<Vec<String>> {
        self.clusters
            .lock()
            .unwrap()
            .get(cluster_id)
            .map(|state| state.member_event_ids.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evermem_core::RawDataType;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn memcell(event_id: &str, ts: &str, embedding: Vec<f32>) -> MemCell {
        let mut cell = MemCell {
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
        };
        cell.set_embedding(embedding, "test");
        cell
    }

    #[test]
    fn similar_recent_cells_share_a_cluster() {
        let manager = ClusterManager::new(ClusterOptions::default());
        let a = manager.assign(&memcell("a", "2024-03-10T10:00:00+08:00", vec![1.0, 0.0]));
        let b = manager.assign(&memcell("b", "2024-03-11T10:00:00+08:00", vec![0.9, 0.1]));
        assert!(a.is_new_cluster);
        assert!(!b.is_new_cluster);
        assert_eq!(a.cluster_id, b.cluster_id);
        assert_eq!(manager.members(&a.cluster_id).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn dissimilar_cells_open_new_clusters() {
        let manager = ClusterManager::new(ClusterOptions::default());
        let a = manager.assign(&memcell("a", "2024-03-10T10:00:00+08:00", vec![1.0, 0.0]));
        let b = manager.assign(&memcell("b", "2024-03-10T11:00:00+08:00", vec![0.0, 1.0]));
        assert_ne!(a.cluster_id, b.cluster_id);
    }

    #[test]
    fn stale_clusters_stop_accepting() {
        let manager = ClusterManager::new(ClusterOptions {
            similarity_threshold: 0.5,
            max_time_gap_days: 7,
        });
        let a = manager.assign(&memcell("a", "2024-03-01T10:00:00+08:00", vec![1.0, 0.0]));
        let b = manager.assign(&memcell("b", "2024-03-20T10:00:00+08:00", vec![1.0, 0.0]));
        assert_ne!(a.cluster_id, b.cluster_id);
    }

    #[test]
    fn callbacks_fire_on_assignment() {
        let manager = ClusterManager::new(ClusterOptions::default());
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        manager.on_cluster_assigned(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        manager.assign(&memcell("a", "2024-03-10T10:00:00+08:00", vec![1.0]));
        manager.assign(&memcell("b", "2024-03-10T11:00:00+08:00", vec![1.0]));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
