//! Queue payload codec
//!
//! Serialization prefers JSON (human-readable, string members). Payloads
//! that JSON cannot express fall back to MessagePack behind a magic marker,
//! so the deserializer can pick the decoder from the first bytes. Members
//! are made unique with an 8-character uuid prefix so structurally identical
//! payloads may coexist in one ZSET.

use serde_json::Value;
use uuid::Uuid;

use crate::{QueueError, Result};

/// Length of the uuid prefix on stored members.
pub const UNIQUE_ID_LENGTH: usize = 8;

/// Marker prefixing MessagePack-encoded members.
pub const BINARY_MARKER: &[u8] = b"__MSGPACK__";

/// A record read back from a cache/queue member.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: String,
    pub data: Value,
}

/// Serialize a payload, preferring JSON.
pub fn serialize_payload(data: &Value) -> Result<Vec<u8>> {
    match serde_json::to_vec(data) {
        Ok(bytes) => Ok(bytes),
        Err(json_err) => {
            tracing::debug!(error = %json_err, "json serialization failed, trying msgpack");
            let packed = rmp_serde::to_vec(data)
                .map_err(|e| QueueError::Serialization(format!("msgpack encode: {e}")))?;
            let mut out = Vec::with_capacity(BINARY_MARKER.len() + packed.len());
            out.extend_from_slice(BINARY_MARKER);
            out.extend_from_slice(&packed);
            Ok(out)
        }
    }
}

/// Deserialize a payload produced by [`serialize_payload`]. Falls back to a
/// UTF-8 string value, then to opaque bytes, on decode failure.
pub fn deserialize_payload(bytes: &[u8]) -> Value {
    if let Some(packed) = bytes.strip_prefix(BINARY_MARKER) {
        match rmp_serde::from_slice::<Value>(packed) {
            Ok(value) => return value,
            Err(e) => {
                tracing::warn!(error = %e, "msgpack decode failed, keeping raw bytes");
                return Value::String(String::from_utf8_lossy(bytes).into_owned());
            }
        }
    }
    if let Ok(value) = serde_json::from_slice::<Value>(bytes) {
        return value;
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => Value::String(s.to_string()),
        Err(_) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}

/// Prefix serialized data with a short uuid: `xxxxxxxx:payload`.
pub fn wrap_unique(data: &[u8]) -> Vec<u8> {
    let unique = Uuid::new_v4().simple().to_string();
    let prefix = &unique[..UNIQUE_ID_LENGTH];
    let mut member = Vec::with_capacity(prefix.len() + 1 + data.len());
    member.extend_from_slice(prefix.as_bytes());
    member.push(b':');
    member.extend_from_slice(data);
    member
}

/// Split a member on the first `:` into `(unique_id, payload)`. Members
/// without a separator keep the whole content as payload with an `unknown`
/// id, which tolerates pre-wrapping writers.
pub fn parse_unique(member: &[u8]) -> (String, &[u8]) {
    match member.iter().position(|&b| b == b':') {
        Some(pos) => {
            let id = String::from_utf8_lossy(&member[..pos]).into_owned();
            (id, &member[pos + 1..])
        }
        None => ("unknown".to_string(), member),
    }
}

/// Serialize, then wrap: the full write-side path.
pub fn encode_member(data: &Value) -> Result<Vec<u8>> {
    Ok(wrap_unique(&serialize_payload(data)?))
}

/// Parse and deserialize: the full read-side path.
pub fn decode_member(member: &[u8]) -> StoredRecord {
    let (id, payload) = parse_unique(member);
    StoredRecord {
        id,
        data: deserialize_payload(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_round_trip_is_identity() {
        let payloads = [
            json!({"group_id": "g1", "content": "hello", "n": 42}),
            json!([1, 2, 3]),
            json!("plain string"),
            json!({"nested": {"deep": [null, true, 0.5]}}),
        ];
        for payload in payloads {
            let bytes = serialize_payload(&payload).unwrap();
            assert_eq!(deserialize_payload(&bytes), payload);
        }
    }

    #[test]
    fn marked_binary_payload_round_trips() {
        let payload = json!({"k": "v"});
        let packed = rmp_serde::to_vec(&payload).unwrap();
        let mut bytes = BINARY_MARKER.to_vec();
        bytes.extend_from_slice(&packed);
        assert_eq!(deserialize_payload(&bytes), payload);
    }

    #[test]
    fn non_json_bytes_fall_back_to_string() {
        let value = deserialize_payload(b"not json at all");
        assert_eq!(value, Value::String("not json at all".to_string()));
    }

    #[test]
    fn unique_wrapping_uses_eight_char_prefix() {
        let member = wrap_unique(b"payload");
        let (id, data) = parse_unique(&member);
        assert_eq!(id.len(), UNIQUE_ID_LENGTH);
        assert_eq!(data, b"payload");
    }

    #[test]
    fn parse_tolerates_members_without_separator() {
        let (id, data) = parse_unique(b"rawdata");
        assert_eq!(id, "unknown");
        assert_eq!(data, b"rawdata");
    }

    #[test]
    fn encode_decode_member_round_trip() {
        let payload = json!({"group_id": "AI产品群", "text": "消息"});
        let member = encode_member(&payload).unwrap();
        let record = decode_member(&member);
        assert_eq!(record.data, payload);
        assert_eq!(record.id.len(), UNIQUE_ID_LENGTH);
    }
}
