//! Fixed-partition group queue manager
//!
//! Routes group-keyed messages to one of 50 partitions, shares the
//! partitions across consumers through an owner activity set, and survives
//! consumer crashes: on the next join/exit/cleanup the dead owner's
//! partitions are reassigned while its messages stay in `queue:{PPP}`.

use parking_lot::Mutex;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{Script, Value};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::item::{QueueItem, SerializationMode};
use crate::{codec, scripts, QueueError, Result};

/// Fixed partition count. Changing this reshuffles every group route, so it
/// is a compile-time constant and deliberately not configurable.
pub const PARTITION_COUNT: u32 = 50;

const KEEPALIVE_INTERVAL_MS: i64 = 30_000;
const JOIN_RETRY_LIMIT: u32 = 2;

/// Outcome of a deliver call. Delivery never propagates errors upward; a
/// failure becomes a rejection with a reason string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliverStatus {
    Accepted,
    Rejected(String),
}

impl DeliverStatus {
    pub fn is_accepted(&self) -> bool {
        matches!(self, DeliverStatus::Accepted)
    }
}

/// Manager lifecycle. Cannot restart after shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Created,
    Started,
    Shutdown,
}

/// Shutdown behavior: soft refuses to complete while messages remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    Soft,
    Hard,
}

/// Per-partition sizes and score bounds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PartitionStats {
    pub partition: String,
    pub current_size: i64,
    pub min_score: i64,
    pub max_score: i64,
}

/// Manager-level counters. `total_current_messages` tracks the best-effort
/// `counter` key.
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    pub total_current_messages: i64,
    pub total_delivered: u64,
    pub total_consumed: u64,
    pub total_rejected: u64,
}

/// Tunables carried over from `QueueSettings` plus owner/cleanup knobs.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub key_prefix: String,
    pub serialization_mode: SerializationMode,
    pub max_total_messages: u64,
    pub queue_expire_seconds: u64,
    pub owner_expire_seconds: u64,
    pub inactive_threshold_seconds: u64,
    pub cleanup_interval_seconds: u64,
    pub log_interval_seconds: u64,
    /// Probability of running the eviction tick on a deliver.
    pub eviction_probability: f64,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            key_prefix: "default".to_string(),
            serialization_mode: SerializationMode::Json,
            max_total_messages: 20_000,
            queue_expire_seconds: 24 * 3600,
            owner_expire_seconds: 3600,
            inactive_threshold_seconds: 300,
            cleanup_interval_seconds: 300,
            log_interval_seconds: 600,
            eviction_probability: 0.1,
        }
    }
}

impl From<&evermem_config::QueueSettings> for QueueOptions {
    fn from(settings: &evermem_config::QueueSettings) -> Self {
        let key_prefix = if settings.global_prefix.is_empty() {
            settings.key_prefix.clone()
        } else {
            format!("{}:{}", settings.global_prefix, settings.key_prefix)
        };
        Self {
            key_prefix,
            serialization_mode: SerializationMode::from_str_loose(&settings.serialization_mode),
            max_total_messages: settings.max_total_messages,
            queue_expire_seconds: settings.expire_seconds,
            cleanup_interval_seconds: settings.cleanup_interval_seconds,
            log_interval_seconds: settings.log_interval_seconds,
            ..Self::default()
        }
    }
}

struct Scripts {
    enqueue: Script,
    get_messages: Script,
    join: Script,
    exit: Script,
    keepalive: Script,
    cleanup: Script,
    force_cleanup: Script,
    queue_stats: Script,
    all_partitions_stats: Script,
    rebalance: Script,
}

impl Scripts {
    fn new() -> Self {
        Self {
            enqueue: Script::new(scripts::ENQUEUE),
            get_messages: Script::new(scripts::GET_MESSAGES),
            join: Script::new(&scripts::join()),
            exit: Script::new(&scripts::exit()),
            keepalive: Script::new(scripts::KEEPALIVE),
            cleanup: Script::new(&scripts::cleanup_inactive_owners()),
            force_cleanup: Script::new(scripts::FORCE_CLEANUP),
            queue_stats: Script::new(scripts::QUEUE_STATS),
            all_partitions_stats: Script::new(scripts::ALL_PARTITIONS_STATS),
            rebalance: Script::new(&scripts::rebalance_partitions()),
        }
    }
}

/// Route a group key to its partition name (`001`..`050`).
pub fn partition_for(group_key: &str) -> String {
    let digest = md5::compute(group_key.as_bytes());
    let hex = format!("{digest:x}");
    let prefix = u32::from_str_radix(&hex[..8], 16).unwrap_or(0);
    format!("{:03}", prefix % PARTITION_COUNT + 1)
}

/// Redis message group queue manager.
pub struct GroupQueueManager<T: QueueItem> {
    conn: ConnectionManager,
    options: QueueOptions,
    scripts: Scripts,
    /// Process-unique consumer identity, generated at construction.
    owner_id: String,
    keepalive_times: Mutex<HashMap<String, i64>>,
    stats: Mutex<ManagerStats>,
    state: Mutex<ManagerState>,
    running: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: QueueItem + 'static> GroupQueueManager<T> {
    pub fn new(conn: ConnectionManager, options: QueueOptions) -> Self {
        let owner_id = format!(
            "{}_{}_{}",
            options.key_prefix,
            chrono::Utc::now().timestamp(),
            rand::thread_rng().gen_range(10_000..=99_999)
        );
        tracing::info!(
            key_prefix = %options.key_prefix,
            owner_id = %owner_id,
            max_total = options.max_total_messages,
            "group queue manager initialized"
        );
        Self {
            conn,
            options,
            scripts: Scripts::new(),
            owner_id,
            keepalive_times: Mutex::new(HashMap::new()),
            stats: Mutex::new(ManagerStats::default()),
            state: Mutex::new(ManagerState::Created),
            running: Arc::new(AtomicBool::new(false)),
            tasks: Mutex::new(Vec::new()),
            _marker: PhantomData,
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn state(&self) -> ManagerState {
        *self.state.lock()
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats.lock().clone()
    }

    fn queue_prefix(&self) -> String {
        format!("{}:queue:", self.options.key_prefix)
    }

    fn queue_key(&self, partition: &str) -> String {
        format!("{}{partition}", self.queue_prefix())
    }

    fn owner_zset_key(&self) -> String {
        format!("{}:owner_activate_time_zset", self.options.key_prefix)
    }

    fn queue_list_prefix(&self) -> String {
        format!("{}:queue_list:", self.options.key_prefix)
    }

    fn counter_key(&self) -> String {
        format!("{}:counter", self.options.key_prefix)
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Deliver a message to the partition its group key hashes to.
    pub async fn deliver(&self, group_key: &str, item: &T) -> DeliverStatus {
        let partition = partition_for(group_key);
        let score = item.sort_score().unwrap_or_else(Self::now_ms);

        let payload = match item.encode(self.options.serialization_mode) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(group_key, error = %e, "queue item encode failed");
                return DeliverStatus::Rejected("delivery_error".to_string());
            }
        };
        let member = codec::wrap_unique(&payload);

        // Probabilistic eviction tick: drop members older than twice the
        // queue TTL when the roll hits.
        let evict_before = if rand::thread_rng().gen_bool(self.options.eviction_probability) {
            Self::now_ms() - 2 * self.options.queue_expire_seconds as i64 * 1000
        } else {
            0
        };

        let mut conn = self.conn.clone();
        let result: std::result::Result<(i64, i64, Vec<u8>), redis::RedisError> = self
            .scripts
            .enqueue
            .key(self.queue_key(&partition))
            .key(self.counter_key())
            .arg(member)
            .arg(score)
            .arg(self.options.queue_expire_seconds)
            .arg(self.options.max_total_messages)
            .arg(evict_before)
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok((1, new_count, _)) => {
                let mut stats = self.stats.lock();
                stats.total_delivered += 1;
                stats.total_current_messages = new_count;
                tracing::debug!(
                    group_key,
                    partition = %partition,
                    score,
                    total = new_count,
                    "message delivered"
                );
                DeliverStatus::Accepted
            }
            Ok((_, _, reason)) => {
                self.stats.lock().total_rejected += 1;
                let reason = String::from_utf8_lossy(&reason).into_owned();
                tracing::warn!(group_key, partition = %partition, %reason, "delivery rejected");
                DeliverStatus::Rejected(reason)
            }
            Err(e) => {
                self.stats.lock().total_rejected += 1;
                tracing::error!(group_key, partition = %partition, error = %e, "delivery failed");
                DeliverStatus::Rejected("delivery_error".to_string())
            }
        }
    }

    /// Take up to one message per owned partition, oldest first, restricted
    /// to messages whose score is at least `score_threshold` behind
    /// `current_score`. A missing assignment triggers an automatic join with
    /// a bounded retry.
    pub async fn get_messages(
        &self,
        score_threshold: i64,
        current_score: Option<i64>,
    ) -> Result<Vec<T>> {
        let owner_id = self.owner_id.clone();
        self.get_messages_for(&owner_id, score_threshold, current_score, JOIN_RETRY_LIMIT)
            .await
    }

    async fn get_messages_for(
        &self,
        owner_id: &str,
        score_threshold: i64,
        current_score: Option<i64>,
        retry_depth: u32,
    ) -> Result<Vec<T>> {
        self.keepalive_if_due(owner_id).await;

        let current_score = current_score.unwrap_or_else(Self::now_ms);
        let mut conn = self.conn.clone();
        let (status, raw_messages): (String, Vec<Vec<u8>>) = self
            .scripts
            .get_messages
            .key(self.owner_zset_key())
            .key(self.queue_list_prefix())
            .key(self.queue_prefix())
            .key(self.counter_key())
            .arg(owner_id)
            .arg(score_threshold)
            .arg(current_score)
            .invoke_async(&mut conn)
            .await?;

        match status.as_str() {
            "JOIN_REQUIRED" => {
                if retry_depth == 0 {
                    tracing::error!(owner_id, "JOIN_REQUIRED retries exhausted");
                    return Err(QueueError::JoinRetriesExhausted(owner_id.to_string()));
                }
                tracing::info!(owner_id, remaining = retry_depth - 1, "joining consumer set");
                self.join(Some(owner_id)).await?;
                return Box::pin(self.get_messages_for(
                    owner_id,
                    score_threshold,
                    Some(current_score),
                    retry_depth - 1,
                ))
                .await;
            }
            "NO_QUEUES" => {
                tracing::warn!(owner_id, "consumer has no assigned partitions");
                return Ok(Vec::new());
            }
            _ => {}
        }

        let mut messages = Vec::with_capacity(raw_messages.len());
        for member in raw_messages {
            let (_, payload) = codec::parse_unique(&member);
            match T::decode(payload, self.options.serialization_mode) {
                Ok(item) => messages.push(item),
                Err(e) => tracing::warn!(error = %e, "queue message decode failed"),
            }
        }

        if !messages.is_empty() {
            self.stats.lock().total_consumed += messages.len() as u64;
            tracing::debug!(owner_id, count = messages.len(), "messages consumed");
        }
        Ok(messages)
    }

    /// Register the owner and rebalance all partitions across live owners.
    pub async fn join(&self, owner_id: Option<&str>) -> Result<(i64, HashMap<String, Vec<String>>)> {
        let owner_id = owner_id.unwrap_or(&self.owner_id);
        let mut conn = self.conn.clone();
        let value: Value = self
            .scripts
            .join
            .key(self.owner_zset_key())
            .key(self.queue_list_prefix())
            .arg(owner_id)
            .arg(Self::now_ms())
            .arg(self.options.owner_expire_seconds)
            .arg(PARTITION_COUNT)
            .invoke_async(&mut conn)
            .await?;

        self.keepalive_times
            .lock()
            .insert(owner_id.to_string(), Self::now_ms());

        let (owner_count, assignments) = parse_rebalance_reply(&value);
        tracing::info!(owner_id, owner_count, ?assignments, "consumer joined");
        Ok((owner_count, assignments))
    }

    /// Remove the owner and rebalance.
    pub async fn exit(&self, owner_id: Option<&str>) -> Result<(i64, HashMap<String, Vec<String>>)> {
        let owner_id = owner_id.unwrap_or(&self.owner_id);
        let mut conn = self.conn.clone();
        let value: Value = self
            .scripts
            .exit
            .key(self.owner_zset_key())
            .key(self.queue_list_prefix())
            .arg(owner_id)
            .arg(self.options.owner_expire_seconds)
            .arg(PARTITION_COUNT)
            .invoke_async(&mut conn)
            .await?;

        self.keepalive_times.lock().remove(owner_id);
        let (owner_count, assignments) = parse_rebalance_reply(&value);
        tracing::info!(owner_id, owner_count, "consumer exited");
        Ok((owner_count, assignments))
    }

    /// Refresh the owner's activity score. Succeeds only while the owner
    /// still holds a queue_list.
    pub async fn keepalive(&self, owner_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let ok: i64 = self
            .scripts
            .keepalive
            .key(self.owner_zset_key())
            .key(self.queue_list_prefix())
            .arg(owner_id)
            .arg(Self::now_ms())
            .arg(self.options.owner_expire_seconds)
            .invoke_async(&mut conn)
            .await?;
        Ok(ok == 1)
    }

    /// On-demand keepalive: refresh when more than 30 s passed since the
    /// last one for this owner.
    async fn keepalive_if_due(&self, owner_id: &str) {
        let now = Self::now_ms();
        let last = self
            .keepalive_times
            .lock()
            .get(owner_id)
            .copied()
            .unwrap_or(0);
        if last != 0 && now - last <= KEEPALIVE_INTERVAL_MS {
            return;
        }
        match self.keepalive(owner_id).await {
            Ok(true) => {
                self.keepalive_times.lock().insert(owner_id.to_string(), now);
            }
            Ok(false) => {
                tracing::warn!(owner_id, "keepalive skipped: queue_list missing");
            }
            Err(e) => {
                tracing::warn!(owner_id, error = %e, "keepalive failed");
            }
        }
    }

    /// Evict owners idle past the inactive threshold; rebalance when any
    /// were evicted.
    pub async fn cleanup_inactive_owners(
        &self,
    ) -> Result<(i64, i64, HashMap<String, Vec<String>>)> {
        let cutoff = Self::now_ms() - self.options.inactive_threshold_seconds as i64 * 1000;
        let mut conn = self.conn.clone();
        let value: Value = self
            .scripts
            .cleanup
            .key(self.owner_zset_key())
            .key(self.queue_list_prefix())
            .arg(cutoff)
            .arg(self.options.owner_expire_seconds)
            .arg(PARTITION_COUNT)
            .invoke_async(&mut conn)
            .await?;

        let (cleaned, owner_count, assignments) = parse_cleanup_reply(&value);
        if cleaned > 0 {
            tracing::info!(cleaned, owner_count, "inactive owners evicted");
        }
        Ok((cleaned, owner_count, assignments))
    }

    /// Rebalance all partitions over the current live owners.
    pub async fn rebalance(&self) -> Result<(i64, HashMap<String, Vec<String>>)> {
        let mut conn = self.conn.clone();
        let value: Value = self
            .scripts
            .rebalance
            .key(self.owner_zset_key())
            .key(self.queue_list_prefix())
            .arg(self.options.owner_expire_seconds)
            .arg(PARTITION_COUNT)
            .invoke_async(&mut conn)
            .await?;
        Ok(parse_rebalance_reply(&value))
    }

    /// Reset owner bookkeeping. With `purge_all` the partitions themselves
    /// are deleted and the counter zeroed; otherwise the counter is
    /// recomputed from actual partition sizes.
    pub async fn force_cleanup(&self, purge_all: bool) -> Result<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = self
            .scripts
            .force_cleanup
            .key(self.owner_zset_key())
            .key(self.queue_list_prefix())
            .key(self.queue_prefix())
            .key(self.counter_key())
            .arg(PARTITION_COUNT)
            .arg(if purge_all { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await?;

        if purge_all {
            let mut stats = self.stats.lock();
            *stats = ManagerStats::default();
            tracing::warn!(partitions = count, "purged all partitions and owners");
        } else {
            tracing::warn!(owners = count, "owner state reset, counter recomputed");
        }
        Ok(count)
    }

    /// Stats for the partition one group key routes to.
    pub async fn queue_stats(&self, group_key: &str) -> Result<PartitionStats> {
        let partition = partition_for(group_key);
        let mut conn = self.conn.clone();
        let (size, _total, min_score, max_score): (i64, i64, i64, i64) = self
            .scripts
            .queue_stats
            .key(self.queue_key(&partition))
            .key(self.counter_key())
            .invoke_async(&mut conn)
            .await?;
        Ok(PartitionStats {
            partition,
            current_size: size,
            min_score,
            max_score,
        })
    }

    /// Stats across all partitions: (counter, actual total, per-partition).
    pub async fn all_partition_stats(&self) -> Result<(i64, i64, Vec<PartitionStats>)> {
        let mut conn = self.conn.clone();
        let value: Value = self
            .scripts
            .all_partitions_stats
            .key(self.queue_prefix())
            .key(self.counter_key())
            .arg(PARTITION_COUNT)
            .invoke_async(&mut conn)
            .await?;

        let items = match &value {
            Value::Array(items) if items.len() >= 5 => items,
            _ => return Ok((0, 0, Vec::new())),
        };
        let counter = value_int(&items[0]);
        let actual_total = value_int(&items[1]);
        let mut partitions = Vec::new();
        if let Value::Array(flat) = &items[4] {
            for chunk in flat.chunks(4) {
                if chunk.len() == 4 {
                    partitions.push(PartitionStats {
                        partition: value_string(&chunk[0]),
                        current_size: value_int(&chunk[1]),
                        min_score: value_int(&chunk[2]),
                        max_score: value_int(&chunk[3]),
                    });
                }
            }
        }
        {
            let mut stats = self.stats.lock();
            stats.total_current_messages = actual_total;
        }
        Ok((counter, actual_total, partitions))
    }

    /// Start the periodic cleanup and log loops. Can only run once.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                ManagerState::Started => {
                    tracing::warn!("manager already started, ignoring");
                    return Ok(());
                }
                ManagerState::Shutdown => {
                    return Err(QueueError::State(
                        "manager has been shut down and cannot restart".to_string(),
                    ))
                }
                ManagerState::Created => *state = ManagerState::Started,
            }
        }
        self.running.store(true, Ordering::SeqCst);

        if let Err(e) = self.cleanup_inactive_owners().await {
            tracing::warn!(error = %e, "startup cleanup failed");
        }
        self.log_partition_summary().await;

        let cleanup_manager = Arc::clone(self);
        let cleanup_task = tokio::spawn(async move {
            let base = cleanup_manager.options.cleanup_interval_seconds as f64;
            while cleanup_manager.running.load(Ordering::SeqCst) {
                // Jitter spreads instances so they do not clean in lockstep.
                let jitter = rand::thread_rng().gen_range(-0.3..0.3) * base;
                let delay = (base + jitter).max(1.0);
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                if cleanup_manager.running.load(Ordering::SeqCst) {
                    if let Err(e) = cleanup_manager.cleanup_inactive_owners().await {
                        tracing::error!(error = %e, "periodic cleanup failed");
                    }
                }
            }
        });

        let log_manager = Arc::clone(self);
        let log_task = tokio::spawn(async move {
            let interval = Duration::from_secs(log_manager.options.log_interval_seconds);
            while log_manager.running.load(Ordering::SeqCst) {
                tokio::time::sleep(interval).await;
                if log_manager.running.load(Ordering::SeqCst) {
                    log_manager.log_partition_summary().await;
                }
            }
        });

        let mut tasks = self.tasks.lock();
        tasks.push(cleanup_task);
        tasks.push(log_task);
        tracing::info!(key_prefix = %self.options.key_prefix, "queue manager started");
        Ok(())
    }

    async fn log_partition_summary(&self) {
        match self.all_partition_stats().await {
            Ok((counter, actual, partitions)) => {
                let non_empty = partitions.iter().filter(|p| p.current_size > 0).count();
                tracing::info!(
                    counter,
                    actual_messages = actual,
                    non_empty_partitions = non_empty,
                    delivered = self.stats.lock().total_delivered,
                    "queue status"
                );
                for p in partitions.iter().filter(|p| p.current_size > 0) {
                    tracing::debug!(
                        partition = %p.partition,
                        size = p.current_size,
                        min_score = p.min_score,
                        max_score = p.max_score,
                        "partition status"
                    );
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to gather queue stats"),
        }
    }

    /// Stop periodic tasks and close the lifecycle. Soft shutdown returns
    /// `false` while messages remain so the caller can drain and retry.
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<bool> {
        {
            let state = self.state.lock();
            if *state == ManagerState::Shutdown {
                tracing::warn!("manager already shut down, ignoring");
                return Ok(true);
            }
            if *state == ManagerState::Created {
                drop(state);
                *self.state.lock() = ManagerState::Shutdown;
                return Ok(true);
            }
        }

        self.running.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        if mode == ShutdownMode::Soft {
            let (_, remaining, _) = self.all_partition_stats().await?;
            if remaining > 0 {
                tracing::warn!(remaining, "soft shutdown refused: messages remain");
                // Allow a later retry: periodic tasks are stopped but the
                // state stays Started.
                return Ok(false);
            }
        }

        self.log_partition_summary().await;
        *self.state.lock() = ManagerState::Shutdown;
        tracing::info!(key_prefix = %self.options.key_prefix, "queue manager shut down");
        Ok(true)
    }
}

fn value_int(value: &Value) -> i64 {
    match value {
        Value::Int(n) => *n,
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes).parse().unwrap_or(0),
        _ => 0,
    }
}

fn value_string(value: &Value) -> String {
    match value {
        Value::BulkString(bytes) => String::from_utf8_lossy(bytes).into_owned(),
        Value::SimpleString(s) => s.clone(),
        Value::Int(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Decode `{owner_count, {owner, {partitions}, ...}}`.
fn parse_rebalance_reply(value: &Value) -> (i64, HashMap<String, Vec<String>>) {
    let items = match value {
        Value::Array(items) if items.len() >= 2 => items,
        _ => return (0, HashMap::new()),
    };
    let owner_count = value_int(&items[0]);
    (owner_count, parse_assignments(&items[1]))
}

/// Decode `{cleaned, owner_count, {owner, {partitions}, ...}}`.
fn parse_cleanup_reply(value: &Value) -> (i64, i64, HashMap<String, Vec<String>>) {
    let items = match value {
        Value::Array(items) if items.len() >= 3 => items,
        _ => return (0, 0, HashMap::new()),
    };
    (
        value_int(&items[0]),
        value_int(&items[1]),
        parse_assignments(&items[2]),
    )
}

fn parse_assignments(value: &Value) -> HashMap<String, Vec<String>> {
    let mut assignments = HashMap::new();
    if let Value::Array(flat) = value {
        for pair in flat.chunks(2) {
            if pair.len() == 2 {
                let owner = value_string(&pair[0]);
                let partitions = match &pair[1] {
                    Value::Array(parts) => parts.iter().map(value_string).collect(),
                    other => vec![value_string(other)],
                };
                assignments.insert(owner, partitions);
            }
        }
    }
    assignments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_routing_is_stable_md5_mod_50() {
        // md5("AI产品群") = 2f8d6b91..., int("2f8d6b91", 16) % 50 + 1 → fixed.
        let digest = md5::compute("AI产品群".as_bytes());
        let hex = format!("{digest:x}");
        let expected = u32::from_str_radix(&hex[..8], 16).unwrap() % PARTITION_COUNT + 1;
        assert_eq!(partition_for("AI产品群"), format!("{expected:03}"));

        // Stable across calls and always inside 001..050.
        for key in ["a", "group-7", "团队群", ""] {
            let p = partition_for(key);
            assert_eq!(p, partition_for(key));
            let n: u32 = p.parse().unwrap();
            assert!((1..=PARTITION_COUNT).contains(&n));
            assert_eq!(p.len(), 3);
        }
    }

    #[test]
    fn rebalance_reply_parses_flat_assignments() {
        let value = Value::Array(vec![
            Value::Int(2),
            Value::Array(vec![
                Value::BulkString(b"owner_a".to_vec()),
                Value::Array(vec![
                    Value::BulkString(b"001".to_vec()),
                    Value::BulkString(b"003".to_vec()),
                ]),
                Value::BulkString(b"owner_b".to_vec()),
                Value::Array(vec![Value::BulkString(b"002".to_vec())]),
            ]),
        ]);
        let (count, assignments) = parse_rebalance_reply(&value);
        assert_eq!(count, 2);
        assert_eq!(assignments["owner_a"], vec!["001", "003"]);
        assert_eq!(assignments["owner_b"], vec!["002"]);
    }

    #[test]
    fn cleanup_reply_parses_three_fields() {
        let value = Value::Array(vec![Value::Int(1), Value::Int(3), Value::Array(vec![])]);
        let (cleaned, owners, assignments) = parse_cleanup_reply(&value);
        assert_eq!(cleaned, 1);
        assert_eq!(owners, 3);
        assert!(assignments.is_empty());
    }

    #[test]
    fn malformed_replies_degrade_to_zero() {
        assert_eq!(parse_rebalance_reply(&Value::Nil).0, 0);
        assert_eq!(parse_cleanup_reply(&Value::Int(5)).0, 0);
    }
}
