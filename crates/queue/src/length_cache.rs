//! Length-bounded ZSET cache
//!
//! Appends score by timestamp, renews the TTL on every append, and trims
//! from the lowest score with a probability roll so the set stays at or
//! under `max_length`. All failures degrade to sentinel values with a
//! warning; nothing propagates to callers.

use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde_json::Value;

use crate::codec;
use crate::scripts;
use crate::window_cache::CacheRecord;

pub const DEFAULT_MAX_LENGTH: usize = 100;
pub const DEFAULT_EXPIRE_MINUTES: u64 = 60;
pub const DEFAULT_CLEANUP_PROBABILITY: f64 = 0.1;

/// Redis length-limited cache.
pub struct LengthCache {
    conn: ConnectionManager,
    max_length: usize,
    expire_minutes: u64,
    cleanup_probability: f64,
    trim_script: Script,
    range_script: Script,
}

impl LengthCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_options(
            conn,
            DEFAULT_MAX_LENGTH,
            DEFAULT_EXPIRE_MINUTES,
            DEFAULT_CLEANUP_PROBABILITY,
        )
    }

    pub fn with_options(
        conn: ConnectionManager,
        max_length: usize,
        expire_minutes: u64,
        cleanup_probability: f64,
    ) -> Self {
        tracing::info!(
            max_length,
            expire_minutes,
            cleanup_probability,
            "length cache initialized"
        );
        Self {
            conn,
            max_length,
            expire_minutes,
            cleanup_probability,
            trim_script: Script::new(scripts::LENGTH_TRIM),
            range_script: Script::new(scripts::RANGE_FETCH),
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Append a payload. Returns false (after a warning) on any failure.
    pub async fn append(&self, key: &str, data: &Value, timestamp_ms: Option<i64>) -> bool {
        let score = timestamp_ms.unwrap_or_else(Self::now_ms);
        let member = match codec::encode_member(data) {
            Ok(member) => member,
            Err(e) => {
                tracing::warn!(key, error = %e, "length cache encode failed");
                return false;
            }
        };

        let mut conn = self.conn.clone();
        let added: Result<i64, _> = conn.zadd(key, member, score).await;
        if let Err(e) = added {
            tracing::warn!(key, error = %e, "length cache append failed");
            return false;
        }
        let _: Result<bool, _> = conn.expire(key, (self.expire_minutes * 60) as i64).await;

        if rand::thread_rng().gen_bool(self.cleanup_probability) {
            let trimmed: Result<i64, _> = self
                .trim_script
                .key(key)
                .arg(self.max_length)
                .invoke_async(&mut conn)
                .await;
            match trimmed {
                Ok(n) if n > 0 => tracing::debug!(key, trimmed = n, "length cache trimmed"),
                Ok(_) => {}
                Err(e) => tracing::warn!(key, error = %e, "length cache trim failed"),
            }
        }
        true
    }

    /// Trim regardless of the probability roll. Returns removed count.
    pub async fn trim(&self, key: &str) -> i64 {
        let mut conn = self.conn.clone();
        match self
            .trim_script
            .key(key)
            .arg(self.max_length)
            .invoke_async(&mut conn)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(key, error = %e, "length cache trim failed");
                0
            }
        }
    }

    pub async fn len(&self, key: &str) -> usize {
        let mut conn = self.conn.clone();
        match conn.zcard::<_, i64>(key).await {
            Ok(n) => n.max(0) as usize,
            Err(e) => {
                tracing::warn!(key, error = %e, "length cache zcard failed");
                0
            }
        }
    }

    pub async fn clear(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.del::<_, i64>(key).await {
            Ok(n) => n > 0,
            Err(e) => {
                tracing::warn!(key, error = %e, "length cache clear failed");
                false
            }
        }
    }

    /// Records inside `[min_score, max_score]`, newest first.
    pub async fn range(
        &self,
        key: &str,
        min_score: i64,
        max_score: i64,
        limit: Option<usize>,
    ) -> Vec<CacheRecord> {
        let mut conn = self.conn.clone();
        let raw: Result<Vec<redis::Value>, _> = self
            .range_script
            .key(key)
            .arg(min_score)
            .arg(max_score)
            .arg(limit.map(|l| l as i64).unwrap_or(-1))
            .invoke_async(&mut conn)
            .await;
        match raw {
            Ok(values) => CacheRecord::from_withscores(&values),
            Err(e) => {
                tracing::warn!(key, error = %e, "length cache range failed");
                Vec::new()
            }
        }
    }
}
