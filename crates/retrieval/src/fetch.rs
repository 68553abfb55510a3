//! Key-based memory fetch
//!
//! `fetch_mem` resolves profile memories by user id with an optional
//! version range, ordered latest-first by the store contract.

use std::sync::Arc;

use evermem_core::{MemoryType, UserProfile, UserProfileStore};
use serde_json::{json, Value};

use crate::{RetrievalError, Result};

/// Result of a fetch: one page of memories plus paging info.
#[derive(Debug, Clone, Default)]
pub struct FetchMemResult {
    pub memories: Vec<UserProfile>,
    pub total_count: usize,
    pub has_more: bool,
    pub metadata: Value,
}

/// Key-based fetch over the profile store.
pub struct FetchService {
    profiles: Arc<dyn UserProfileStore>,
}

impl FetchService {
    pub fn new(profiles: Arc<dyn UserProfileStore>) -> Self {
        Self { profiles }
    }

    pub async fn fetch_mem(
        &self,
        user_id: &str,
        memory_type: MemoryType,
        version_range: Option<(u64, u64)>,
        limit: usize,
    ) -> Result<FetchMemResult> {
        if user_id.is_empty() {
            return Err(RetrievalError::InvalidParameter(
                "user_id is required for fetch_mem".to_string(),
            ));
        }
        if memory_type != MemoryType::Profile {
            return Err(RetrievalError::InvalidParameter(format!(
                "fetch_mem supports profile memories, got {memory_type:?}"
            )));
        }
        let limit = limit.max(1);

        // Over-fetch by one to learn whether a further page exists.
        let mut memories = self
            .profiles
            .find_by_user(user_id, version_range, limit + 1)
            .await?;
        let has_more = memories.len() > limit;
        memories.truncate(limit);

        tracing::debug!(
            user_id,
            count = memories.len(),
            has_more,
            "fetch_mem resolved profiles"
        );
        Ok(FetchMemResult {
            total_count: memories.len(),
            has_more,
            metadata: json!({
                "source": "user_profile_store",
                "user_id": user_id,
                "memory_type": "profile",
                "limit": limit,
            }),
            memories,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::FakeProfiles;

    fn profile(version: u64) -> UserProfile {
        UserProfile {
            user_id: "u1".to_string(),
            group_id: "g1".to_string(),
            version,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn paging_reports_has_more() {
        let service = FetchService::new(Arc::new(FakeProfiles(vec![
            profile(3),
            profile(2),
            profile(1),
        ])));
        let result = service
            .fetch_mem("u1", MemoryType::Profile, None, 2)
            .await
            .unwrap();
        assert_eq!(result.memories.len(), 2);
        assert!(result.has_more);

        let all = service
            .fetch_mem("u1", MemoryType::Profile, None, 10)
            .await
            .unwrap();
        assert_eq!(all.memories.len(), 3);
        assert!(!all.has_more);
    }

    #[tokio::test]
    async fn empty_user_is_rejected() {
        let service = FetchService::new(Arc::new(FakeProfiles(vec![])));
        assert!(service
            .fetch_mem("", MemoryType::Profile, None, 10)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn non_profile_types_are_rejected() {
        let service = FetchService::new(Arc::new(FakeProfiles(vec![])));
        assert!(service
            .fetch_mem("u1", MemoryType::EpisodicMemory, None, 10)
            .await
            .is_err());
    }
}
