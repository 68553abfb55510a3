//! Memory manager facade
//!
//! Wires the extractors to one set of injected capabilities and dispatches
//! `extract_memory` by memory type. This is the write-side surface the
//! engine exposes as a library.

use std::sync::Arc;

use evermem_config::PromptRegistry;
use evermem_core::{
    GroupProfile, MemCell, Memory, MemoryType, StatusResult, UserProfile,
};
use evermem_llm::{ChatModel, Embedder};

use crate::boundary::BoundaryDetector;
use crate::episode::{EpisodeExtractRequest, EpisodeExtractor};
use crate::event_log::EventLogExtractor;
use crate::group_profile::{GroupProfileExtractRequest, GroupProfileExtractor};
use crate::memcell::{IncomingMessage, MemCellExtractRequest, MemCellExtractor};
use crate::profile::{ProfileExtractRequest, ProfileExtractor};
use crate::{MemoryError, Result};

/// Raw-ingest request: buffered history plus newly arrived messages for one
/// group.
#[derive(Debug, Clone, Default)]
pub struct MemorizeRequest {
    pub history: Vec<IncomingMessage>,
    pub new_messages: Vec<IncomingMessage>,
    pub user_id_list: Vec<String>,
    pub group_id: Option<String>,
    pub group_name: Option<String>,
    pub enable_event_log_extraction: bool,
}

/// What a derived-memory extraction produced.
#[derive(Debug, Clone)]
pub enum ExtractedMemory {
    Episodes(Vec<Memory>),
    UserProfiles(Vec<UserProfile>),
    GroupProfile(Box<GroupProfile>),
}

/// Facade over the extraction pipeline.
pub struct MemoryManager {
    memcell_extractor: MemCellExtractor,
    episode_extractor: EpisodeExtractor,
    event_log_extractor: EventLogExtractor,
    profile_extractor: ProfileExtractor,
    group_profile_extractor: GroupProfileExtractor,
    embedder: Arc<dyn Embedder>,
}

impl MemoryManager {
    pub fn new(
        chat: Arc<dyn ChatModel>,
        embedder: Arc<dyn Embedder>,
        prompts: Arc<PromptRegistry>,
    ) -> Self {
        let detector = BoundaryDetector::new(Arc::clone(&chat), Arc::clone(&prompts));
        Self {
            memcell_extractor: MemCellExtractor::new(detector),
            episode_extractor: EpisodeExtractor::new(
                Arc::clone(&chat),
                Arc::clone(&embedder),
                Arc::clone(&prompts),
            ),
            event_log_extractor: EventLogExtractor::new(
                Arc::clone(&chat),
                Arc::clone(&embedder),
                Arc::clone(&prompts),
            ),
            profile_extractor: ProfileExtractor::new(Arc::clone(&chat), Arc::clone(&prompts)),
            group_profile_extractor: GroupProfileExtractor::new(chat, prompts),
            embedder,
        }
    }

    /// Boundary-gated MemCell extraction, with optional enrichment: once a
    /// slice closes, the group episode and its event log are attached and
    /// the cell is embedded.
    pub async fn extract_memcell(
        &self,
        request: &MemorizeRequest,
    ) -> Result<(Option<MemCell>, StatusResult)> {
        let extract_request = MemCellExtractRequest {
            history: request.history.clone(),
            new_messages: request.new_messages.clone(),
            user_id_list: request.user_id_list.clone(),
            group_id: request.group_id.clone(),
            group_name: request.group_name.clone(),
        };
        let (memcell, status) = self.memcell_extractor.extract(&extract_request).await?;
        let Some(mut memcell) = memcell else {
            return Ok((None, status));
        };

        let episode = self
            .episode_extractor
            .extract(&EpisodeExtractRequest {
                memcell: memcell.clone(),
                user_id: None,
                group_id: request.group_id.clone(),
                custom_instructions: None,
            })
            .await?;
        memcell.episode = Some(episode.episode.clone());
        if let Some(embedding) = episode.embedding() {
            let model = self.embedder.model_name().to_string();
            memcell.set_embedding(embedding, &model);
        }

        if request.enable_event_log_extraction {
            match self
                .event_log_extractor
                .extract(&episode.episode, memcell.timestamp)
                .await
            {
                Ok(event_log) => memcell.event_log = Some(event_log),
                Err(e) => tracing::error!(error = %e, "event log enrichment failed"),
            }
        }

        Ok((Some(memcell), status))
    }

    /// Extract a derived memory over a batch of MemCells.
    pub async fn extract_memory(
        &self,
        memcells: Vec<MemCell>,
        memory_type: MemoryType,
        user_ids: Vec<String>,
        group_id: Option<String>,
        group_name: Option<String>,
        old_profiles: Vec<UserProfile>,
        existing_group_profile: Option<GroupProfile>,
    ) -> Result<ExtractedMemory> {
        if memcells.is_empty() {
            return Err(MemoryError::InvalidRequest(
                "memcell list is empty".to_string(),
            ));
        }
        match memory_type {
            MemoryType::EpisodicMemory => {
                // One group episode per cell, plus a personal episode per
                // requested user.
                let mut episodes = Vec::new();
                for memcell in &memcells {
                    episodes.push(
                        self.episode_extractor
                            .extract(&EpisodeExtractRequest {
                                memcell: memcell.clone(),
                                user_id: None,
                                group_id: group_id.clone(),
                                custom_instructions: None,
                            })
                            .await?,
                    );
                    for user_id in &user_ids {
                        if memcell.participants.iter().any(|p| p == user_id) {
                            episodes.push(
                                self.episode_extractor
                                    .extract(&EpisodeExtractRequest {
                                        memcell: memcell.clone(),
                                        user_id: Some(user_id.clone()),
                                        group_id: group_id.clone(),
                                        custom_instructions: None,
                                    })
                                    .await?,
                            );
                        }
                    }
                }
                Ok(ExtractedMemory::Episodes(episodes))
            }
            MemoryType::Profile => {
                let profiles = self
                    .profile_extractor
                    .extract(&ProfileExtractRequest {
                        memcells,
                        user_id_list: user_ids,
                        group_id: group_id.unwrap_or_default(),
                        group_name,
                        old_profiles,
                        scenario: None,
                    })
                    .await?;
                Ok(ExtractedMemory::UserProfiles(profiles))
            }
            MemoryType::GroupProfile => {
                let profile = self
                    .group_profile_extractor
                    .extract(&GroupProfileExtractRequest {
                        memcells,
                        group_id: group_id.unwrap_or_default(),
                        group_name,
                        existing_profile: existing_group_profile,
                    })
                    .await?;
                Ok(ExtractedMemory::GroupProfile(Box::new(profile)))
            }
            other => Err(MemoryError::InvalidRequest(format!(
                "unsupported memory type for extraction: {other:?}"
            ))),
        }
    }
}
