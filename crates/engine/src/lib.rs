//! Engine composition root
//!
//! Builds the capability clients from settings, runs the startup
//! self-checks (error catalog, prompt registry), and exposes the library
//! surface: `deliver_memorize`, `extract_memcell`, `extract_memory`,
//! `retrieve_lightweight`, `retrieve_agentic`, `fetch_mem`.
//!
//! Stores are injected: the engine consumes repository traits, never
//! drivers. Glue code (CLI, servers) lives with the embedding application.

use std::sync::Arc;

use evermem_config::{PromptRegistry, Settings};
use evermem_core::candidate::RetrievalResult;
use evermem_core::{
    error::verify_catalog, GroupProfile, MemCell, MemoryType, StatusResult, UserProfile,
};
use evermem_llm::{
    ChatModel, Embedder, HttpReranker, OpenAiChatModel, OpenAiEmbedder, Reranker,
};
use evermem_memory::{ExtractedMemory, MemoryManager, MemorizeRequest};
use evermem_queue::{DeliverStatus, GroupMessageItem, GroupQueueManager};
use evermem_retrieval::{
    AgenticOptions, AgenticRetriever, FetchMemResult, FetchService, RetrievalEngine,
    RetrieveOptions, Stores,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("startup check failed: {0}")]
    Startup(String),

    #[error(transparent)]
    Config(#[from] evermem_config::ConfigError),

    #[error(transparent)]
    Core(#[from] evermem_core::CoreError),

    #[error(transparent)]
    Llm(#[from] evermem_llm::LlmError),

    #[error(transparent)]
    Memory(#[from] evermem_memory::MemoryError),

    #[error(transparent)]
    Retrieval(#[from] evermem_retrieval::RetrievalError),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Capability clients, buildable from settings or injected for tests.
pub struct Capabilities {
    pub chat: Arc<dyn ChatModel>,
    pub embedder: Arc<dyn Embedder>,
    pub reranker: Option<Arc<dyn Reranker>>,
}

impl Capabilities {
    /// Construct the HTTP-backed clients from settings.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            chat: Arc::new(OpenAiChatModel::new(settings.llm.clone())?),
            embedder: Arc::new(OpenAiEmbedder::new(settings.vectorize.clone())?),
            reranker: Some(Arc::new(HttpReranker::new(settings.rerank.clone())?)),
        })
    }
}

/// The assembled core.
pub struct Engine {
    memory: MemoryManager,
    retrieval: Arc<RetrievalEngine>,
    agentic: AgenticRetriever,
    fetch: FetchService,
    queue: Option<Arc<GroupQueueManager<GroupMessageItem>>>,
    stores: Stores,
}

impl Engine {
    /// Build the engine. Fails fast when the error catalog or the prompt
    /// registry for the configured locale is incomplete.
    pub fn new(
        settings: &Settings,
        capabilities: Capabilities,
        stores: Stores,
        queue: Option<Arc<GroupQueueManager<GroupMessageItem>>>,
    ) -> Result<Self> {
        verify_catalog().map_err(|e| EngineError::Startup(e.to_string()))?;
        let prompts = Arc::new(PromptRegistry::new(settings.locale()));
        prompts
            .validate()
            .map_err(|e| EngineError::Startup(e.to_string()))?;

        let memory = MemoryManager::new(
            Arc::clone(&capabilities.chat),
            Arc::clone(&capabilities.embedder),
            Arc::clone(&prompts),
        );
        let retrieval = Arc::new(RetrievalEngine::new(
            stores.clone(),
            Arc::clone(&capabilities.embedder),
        ));
        let agentic = AgenticRetriever::new(
            Arc::clone(&retrieval),
            Arc::clone(&capabilities.chat),
            Arc::clone(&prompts),
            capabilities.reranker.clone(),
        );
        let fetch = FetchService::new(Arc::clone(&stores.user_profiles));

        tracing::info!(locale = settings.locale().as_str(), "engine assembled");
        Ok(Self {
            memory,
            retrieval,
            agentic,
            fetch,
            queue,
            stores,
        })
    }

    /// Route one raw batch through the queue when configured, otherwise
    /// extract inline. Returns the persisted MemCell when a slice closed.
    pub async fn deliver_memorize(
        &self,
        request: &MemorizeRequest,
    ) -> Result<(Option<MemCell>, StatusResult)> {
        if let (Some(queue), Some(group_id)) = (&self.queue, &request.group_id) {
            let payload = serde_json::to_value(request.new_messages.clone())
                .unwrap_or(serde_json::Value::Null);
            let item = GroupMessageItem {
                group_id: group_id.clone(),
                payload,
                timestamp_ms: request
                    .new_messages
                    .last()
                    .map(|m| m.timestamp.timestamp_millis())
                    .unwrap_or_else(|| chrono_now_ms()),
                scene: None,
            };
            match queue.deliver(group_id, &item).await {
                DeliverStatus::Accepted => {}
                DeliverStatus::Rejected(reason) => {
                    tracing::warn!(group_id = %group_id, %reason, "queue rejected batch, extracting inline");
                }
            }
        }
        self.extract_memcell(request).await
    }

    /// Boundary-gated MemCell extraction; a closed slice is persisted.
    pub async fn extract_memcell(
        &self,
        request: &MemorizeRequest,
    ) -> Result<(Option<MemCell>, StatusResult)> {
        let (memcell, status) = self.memory.extract_memcell(request).await?;
        if let Some(memcell) = &memcell {
            self.stores.memcells.save(memcell).await?;
        }
        Ok((memcell, status))
    }

    /// Derived-memory extraction over a MemCell batch.
    #[allow(clippy::too_many_arguments)]
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
        Ok(self
            .memory
            .extract_memory(
                memcells,
                memory_type,
                user_ids,
                group_id,
                group_name,
                old_profiles,
                existing_group_profile,
            )
            .await?)
    }

    /// Lightweight hybrid retrieval.
    pub async fn retrieve_lightweight(
        &self,
        query: &str,
        options: &RetrieveOptions,
    ) -> RetrievalResult {
        self.retrieval.retrieve_lightweight(query, options).await
    }

    /// Agentic retrieval with fallback.
    pub async fn retrieve_agentic(
        &self,
        query: &str,
        options: &RetrieveOptions,
        agentic: &AgenticOptions,
    ) -> RetrievalResult {
        self.agentic.retrieve(query, options, agentic).await
    }

    /// Key-based profile fetch.
    pub async fn fetch_mem(
        &self,
        user_id: &str,
        memory_type: MemoryType,
        version_range: Option<(u64, u64)>,
        limit: usize,
    ) -> Result<FetchMemResult> {
        Ok(self
            .fetch
            .fetch_mem(user_id, memory_type, version_range, limit)
            .await?)
    }
}

fn chrono_now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use evermem_core::repository::{
        DenseHit, DenseQuery, LexicalHit, LexicalQuery,
    };
    use evermem_core::{CoreError, DenseStore, LexicalStore, MemCellStore, UserProfileStore};
    use evermem_llm::LlmError;
    use evermem_memory::IncomingMessage;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixedChat(&'static str);

    #[async_trait]
    impl ChatModel for FixedChat {
        async fn generate_with(
            &self,
            _prompt: &str,
            _temperature: Option<f32>,
            _max_tokens: Option<u32>,
        ) -> std::result::Result<String, LlmError> {
            Ok(self.0.to_string())
        }

        async fn chat(
            &self,
            _messages: &[evermem_llm::ChatMessage],
        ) -> std::result::Result<String, LlmError> {
            Ok(self.0.to_string())
        }
    }

    struct UnitEmbedder;

    #[async_trait]
    impl Embedder for UnitEmbedder {
        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, LlmError> {
            Ok(vec![1.0])
        }

        async fn embed_query(
            &self,
            _text: &str,
            _instruction: Option<&str>,
        ) -> std::result::Result<Vec<f32>, LlmError> {
            Ok(vec![1.0])
        }

        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> std::result::Result<Vec<Vec<f32>>, LlmError> {
            Ok(texts.iter().map(|_| vec![1.0]).collect())
        }

        fn model_name(&self) -> &str {
            "unit"
        }
    }

    #[derive(Default)]
    struct RecordingMemCells(Mutex<Vec<MemCell>>);

    #[async_trait]
    impl MemCellStore for RecordingMemCells {
        async fn save(&self, memcell: &MemCell) -> std::result::Result<(), CoreError> {
            self.0.lock().unwrap().push(memcell.clone());
            Ok(())
        }

        async fn get_by_event_ids(
            &self,
            _event_ids: &[String],
        ) -> std::result::Result<HashMap<String, MemCell>, CoreError> {
            Ok(HashMap::new())
        }
    }

    struct EmptyDense;

    #[async_trait]
    impl DenseStore for EmptyDense {
        async fn vector_search(
            &self,
            _query: DenseQuery,
        ) -> std::result::Result<Vec<DenseHit>, CoreError> {
            Ok(vec![])
        }
    }

    struct EmptyLexical;

    #[async_trait]
    impl LexicalStore for EmptyLexical {
        async fn multi_search(
            &self,
            _query: LexicalQuery,
        ) -> std::result::Result<Vec<LexicalHit>, CoreError> {
            Ok(vec![])
        }
    }

    struct EmptyProfiles;

    #[async_trait]
    impl UserProfileStore for EmptyProfiles {
        async fn save(&self, _profile: &UserProfile) -> std::result::Result<(), CoreError> {
            Ok(())
        }

        async fn find_latest(
            &self,
            _user_id: &str,
            _group_id: &str,
        ) -> std::result::Result<Option<UserProfile>, CoreError> {
            Ok(None)
        }

        async fn find_by_user(
            &self,
            _user_id: &str,
            _version_range: Option<(u64, u64)>,
            _limit: usize,
        ) -> std::result::Result<Vec<UserProfile>, CoreError> {
            Ok(vec![])
        }

        async fn batch_get_by_user_groups(
            &self,
            _pairs: &[(String, String)],
        ) -> std::result::Result<HashMap<(String, String), UserProfile>, CoreError> {
            Ok(HashMap::new())
        }
    }

    fn engine(reply: &'static str) -> Engine {
        let stores = Stores {
            episode_dense: Arc::new(EmptyDense),
            episode_lexical: Arc::new(EmptyLexical),
            event_log_dense: Arc::new(EmptyDense),
            event_log_lexical: Arc::new(EmptyLexical),
            foresight_dense: None,
            foresight_lexical: None,
            user_profiles: Arc::new(EmptyProfiles),
            memcells: Arc::new(RecordingMemCells::default()),
        };
        let capabilities = Capabilities {
            chat: Arc::new(FixedChat(reply)),
            embedder: Arc::new(UnitEmbedder),
            reranker: None,
        };
        Engine::new(&Settings::default(), capabilities, stores, None).unwrap()
    }

    fn msg(ts: &str, content: &str) -> IncomingMessage {
        IncomingMessage::text("u1", "Alice", content, DateTime::parse_from_rfc3339(ts).unwrap())
    }

    #[tokio::test]
    async fn startup_checks_pass_and_engine_builds() {
        let _ = engine("{}");
    }

    #[tokio::test]
    async fn extract_memcell_persists_closed_slices() {
        let engine = engine(
            r#"{"should_end": true, "should_wait": false, "reasoning": "done", "confidence": 0.9, "topic_summary": "t", "title": "T", "content": "C", "summary": "S"}"#,
        );
        let request = MemorizeRequest {
            history: vec![msg("2024-03-14T10:00:00+08:00", "hello")],
            new_messages: vec![msg("2024-03-14T14:00:00+08:00", "next")],
            user_id_list: vec!["u1".to_string()],
            group_id: Some("g1".to_string()),
            group_name: None,
            enable_event_log_extraction: false,
        };
        let (memcell, status) = engine.extract_memcell(&request).await.unwrap();
        assert!(memcell.is_some());
        assert!(!status.should_wait);
        // The group episode was attached during enrichment.
        assert!(memcell.unwrap().episode.is_some());
    }

    #[tokio::test]
    async fn lightweight_retrieval_runs_end_to_end() {
        let engine = engine("{}");
        let result = engine
            .retrieve_lightweight("query", &RetrieveOptions::default())
            .await;
        assert!(result.metadata.error.is_none());
        assert_eq!(result.count, 0);
    }
}
