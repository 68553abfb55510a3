//! Redis-backed partitioned work queue and ZSET caches
//!
//! Group-keyed messages route by hash to one of 50 fixed partitions.
//! Consumers share the partitions through an owner activity set; every
//! multi-key operation runs as a single server-side Lua script so no client
//! ever observes an intermediate state.
//!
//! ⚠️ The partition count is a compile-time constant. Changing it reshuffles
//! every route and strands in-flight messages.

pub mod codec;
pub mod item;
pub mod length_cache;
pub mod manager;
mod scripts;
pub mod window_cache;

pub use codec::{parse_unique, serialize_payload, deserialize_payload, wrap_unique, StoredRecord};
pub use item::{GroupMessageItem, QueueItem, SerializationMode};
pub use length_cache::LengthCache;
pub use manager::{
    DeliverStatus, GroupQueueManager, ManagerState, ManagerStats, PartitionStats, QueueOptions,
    ShutdownMode, PARTITION_COUNT,
};
pub use window_cache::WindowCache;

use thiserror::Error;

/// Queue-level failures.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("join retries exhausted for owner {0}")]
    JoinRetriesExhausted(String),

    #[error("manager state error: {0}")]
    State(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
