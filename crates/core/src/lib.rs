//! Core traits and types for evermem
//!
//! This crate provides the foundational pieces used across all other crates:
//! - Raw message and MemCell types (the units the pipeline operates on)
//! - Derived memory records (episodes, event logs, user/group profiles)
//! - Retrieval candidate and metadata shapes
//! - Repository contracts for the backing stores
//! - Error taxonomy with localized messages
//! - Timezone-aware datetime helpers

pub mod candidate;
pub mod error;
pub mod memory;
pub mod repository;
pub mod time;
pub mod types;

pub use candidate::{Candidate, DataSource, RetrievalMetadata, RetrievalMode};
pub use error::{CoreError, ErrorCode, Locale};
pub use memory::{
    GroupImportanceEvidence, GroupProfile, GroupRole, ImportanceEvidence, Memory, MemoryType,
    ProfileField, ProjectInfo, RoleAssignment, TopicConfidence, TopicInfo, TopicStatus,
    UserProfile, ValueEntry,
};
pub use repository::{
    DenseHit, DenseQuery, DenseStore, EpisodeStore, GroupProfileStore, LexicalHit, LexicalQuery,
    LexicalStore, MemCellStore, UserProfileStore,
};
pub use types::{
    EventLog, MemCell, MsgType, RawDataType, RawMessage, ReferEntry, StatusResult,
};

/// Convenience result alias for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
