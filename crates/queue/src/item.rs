//! Queue item contract
//!
//! Items cross the queue either as JSON strings or as MessagePack bytes,
//! selected per manager instance.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{QueueError, Result};

/// Wire encoding for queue items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SerializationMode {
    #[default]
    Json,
    Msgpack,
}

impl SerializationMode {
    pub fn from_str_loose(s: &str) -> Self {
        match s {
            "msgpack" => SerializationMode::Msgpack,
            _ => SerializationMode::Json,
        }
    }
}

/// Anything that can ride the group queue.
pub trait QueueItem: Serialize + DeserializeOwned + Send + Sync {
    /// Score used to order the item inside its partition. `None` means the
    /// manager stamps the current time in milliseconds.
    fn sort_score(&self) -> Option<i64> {
        None
    }

    fn encode(&self, mode: SerializationMode) -> Result<Vec<u8>> {
        match mode {
            SerializationMode::Json => serde_json::to_vec(self)
                .map_err(|e| QueueError::Serialization(format!("json encode: {e}"))),
            SerializationMode::Msgpack => rmp_serde::to_vec(self)
                .map_err(|e| QueueError::Serialization(format!("msgpack encode: {e}"))),
        }
    }

    fn decode(bytes: &[u8], mode: SerializationMode) -> Result<Self> {
        match mode {
            SerializationMode::Json => serde_json::from_slice(bytes)
                .map_err(|e| QueueError::Serialization(format!("json decode: {e}"))),
            SerializationMode::Msgpack => rmp_serde::from_slice(bytes)
                .map_err(|e| QueueError::Serialization(format!("msgpack decode: {e}"))),
        }
    }
}

/// The standard group-keyed message item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupMessageItem {
    pub group_id: String,
    pub payload: Value,
    /// Event time in epoch milliseconds.
    pub timestamp_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene: Option<String>,
}

impl QueueItem for GroupMessageItem {
    fn sort_score(&self) -> Option<i64> {
        Some(self.timestamp_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> GroupMessageItem {
        GroupMessageItem {
            group_id: "g-42".to_string(),
            payload: json!({"speaker_id": "u1", "content": "hello"}),
            timestamp_ms: 1_700_000_000_000,
            scene: None,
        }
    }

    #[test]
    fn json_mode_round_trip() {
        let item = sample();
        let bytes = item.encode(SerializationMode::Json).unwrap();
        let back = GroupMessageItem::decode(&bytes, SerializationMode::Json).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn msgpack_mode_round_trip() {
        let item = sample();
        let bytes = item.encode(SerializationMode::Msgpack).unwrap();
        let back = GroupMessageItem::decode(&bytes, SerializationMode::Msgpack).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn sort_score_uses_event_time() {
        assert_eq!(sample().sort_score(), Some(1_700_000_000_000));
    }

    #[test]
    fn mode_parses_loosely() {
        assert_eq!(
            SerializationMode::from_str_loose("msgpack"),
            SerializationMode::Msgpack
        );
        assert_eq!(
            SerializationMode::from_str_loose("bogus"),
            SerializationMode::Json
        );
    }
}
