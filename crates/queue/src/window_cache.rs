//! Time-window ZSET cache
//!
//! Same member shape as the length cache, but eviction is age-based: on a
//! probability roll, members with a score below `now − 2 × window` are
//! dropped. Range reads return newest-first records.

use chrono::TimeZone;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde_json::Value;

use crate::codec;
use crate::scripts;

pub const DEFAULT_WINDOW_MINUTES: u64 = 60;
pub const DEFAULT_CLEANUP_PROBABILITY: f64 = 0.1;

/// One record read back from a cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub id: String,
    pub data: Value,
    /// Score, epoch milliseconds.
    pub timestamp: i64,
    /// Human-readable form of the score.
    pub datetime: String,
}

impl CacheRecord {
    /// Build records from a WITHSCORES reply (member, score, member, score…).
    pub(crate) fn from_withscores(values: &[redis::Value]) -> Vec<CacheRecord> {
        let mut records = Vec::with_capacity(values.len() / 2);
        for pair in values.chunks(2) {
            if pair.len() != 2 {
                continue;
            }
            let member = match &pair[0] {
                redis::Value::BulkString(bytes) => bytes.clone(),
                _ => continue,
            };
            let score = match &pair[1] {
                redis::Value::BulkString(bytes) => String::from_utf8_lossy(bytes)
                    .parse::<f64>()
                    .unwrap_or(0.0) as i64,
                redis::Value::Int(n) => *n,
                redis::Value::Double(d) => *d as i64,
                _ => 0,
            };
            let stored = codec::decode_member(&member);
            let datetime = chrono::Utc
                .timestamp_millis_opt(score)
                .single()
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_default();
            records.push(CacheRecord {
                id: stored.id,
                data: stored.data,
                timestamp: score,
                datetime,
            });
        }
        records
    }
}

/// Redis sliding-window cache.
pub struct WindowCache {
    conn: ConnectionManager,
    window_minutes: u64,
    cleanup_probability: f64,
    range_script: Script,
}

impl WindowCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self::with_options(conn, DEFAULT_WINDOW_MINUTES, DEFAULT_CLEANUP_PROBABILITY)
    }

    pub fn with_options(
        conn: ConnectionManager,
        window_minutes: u64,
        cleanup_probability: f64,
    ) -> Self {
        tracing::info!(window_minutes, cleanup_probability, "window cache initialized");
        Self {
            conn,
            window_minutes,
            cleanup_probability,
            range_script: Script::new(scripts::RANGE_FETCH),
        }
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn eviction_cutoff(&self) -> i64 {
        Self::now_ms() - 2 * self.window_minutes as i64 * 60_000
    }

    /// Append a payload. Returns false (after a warning) on any failure.
    pub async fn append(&self, key: &str, data: &Value, timestamp_ms: Option<i64>) -> bool {
        let score = timestamp_ms.unwrap_or_else(Self::now_ms);
        let member = match codec::encode_member(data) {
            Ok(member) => member,
            Err(e) => {
                tracing::warn!(key, error = %e, "window cache encode failed");
                return false;
            }
        };

        let mut conn = self.conn.clone();
        if let Err(e) = conn.zadd::<_, _, _, i64>(key, member, score).await {
            tracing::warn!(key, error = %e, "window cache append failed");
            return false;
        }
        let _: Result<bool, _> = conn
            .expire(key, (self.window_minutes * 60) as i64)
            .await;

        if rand::thread_rng().gen_bool(self.cleanup_probability) {
            self.evict_expired(key).await;
        }
        true
    }

    /// Drop members older than twice the window. Returns removed count.
    pub async fn evict_expired(&self, key: &str) -> i64 {
        let cutoff = self.eviction_cutoff();
        let mut conn = self.conn.clone();
        match conn
            .zrembyscore::<_, _, _, i64>(key, "-inf", format!("({cutoff}"))
            .await
        {
            Ok(n) => {
                if n > 0 {
                    tracing::debug!(key, evicted = n, "window cache evicted expired members");
                }
                n
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "window cache eviction failed");
                0
            }
        }
    }

    pub async fn len(&self, key: &str) -> usize {
        let mut conn = self.conn.clone();
        match conn.zcard::<_, i64>(key).await {
            Ok(n) => n.max(0) as usize,
            Err(e) => {
                tracing::warn!(key, error = %e, "window cache zcard failed");
                0
            }
        }
    }

    pub async fn clear(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.del::<_, i64>(key).await {
            Ok(n) => n > 0,
            Err(e) => {
                tracing::warn!(key, error = %e, "window cache clear failed");
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
                tracing::warn!(key, error = %e, "window cache range failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn withscores_reply_decodes_into_records() {
        let member = codec::encode_member(&json!({"msg": "hi"})).unwrap();
        let values = vec![
            redis::Value::BulkString(member),
            redis::Value::BulkString(b"1700000000000".to_vec()),
        ];
        let records = CacheRecord::from_withscores(&values);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].data, json!({"msg": "hi"}));
        assert_eq!(records[0].timestamp, 1_700_000_000_000);
        assert!(!records[0].datetime.is_empty());
    }

    #[test]
    fn odd_length_replies_are_ignored() {
        let values = vec![redis::Value::BulkString(b"orphan".to_vec())];
        assert!(CacheRecord::from_withscores(&values).is_empty());
    }
}
