//! Raw message and MemCell types
//!
//! A `RawMessage` is one externally originated chat event. A `MemCell` is a
//! closed conversation slice, the atomic unit of memory that every derived
//! extractor works from.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Supported raw message types, matching the wire numbering of the chat
/// gateway. Anything outside this set is dropped before extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MsgType {
    Text,
    Picture,
    Video,
    Audio,
    File,
    Files,
}

impl MsgType {
    /// Placeholder text substituted for non-text content. Text keeps the
    /// original content.
    pub fn placeholder(self) -> Option<&'static str> {
        match self {
            MsgType::Text => None,
            MsgType::Picture => Some("[图片]"),
            MsgType::Video => Some("[视频]"),
            MsgType::Audio => Some("[音频]"),
            MsgType::File | MsgType::Files => Some("[文件]"),
        }
    }

    pub fn is_text(self) -> bool {
        matches!(self, MsgType::Text)
    }
}

impl TryFrom<u8> for MsgType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(MsgType::Text),
            2 => Ok(MsgType::Picture),
            3 => Ok(MsgType::Video),
            4 => Ok(MsgType::Audio),
            5 => Ok(MsgType::File),
            6 => Ok(MsgType::Files),
            other => Err(format!("unsupported msg_type: {other}")),
        }
    }
}

impl From<MsgType> for u8 {
    fn from(value: MsgType) -> u8 {
        match value {
            MsgType::Text => 1,
            MsgType::Picture => 2,
            MsgType::Video => 3,
            MsgType::Audio => 4,
            MsgType::File => 5,
            MsgType::Files => 6,
        }
    }
}

/// A mentioned user inside a message (`@name` entries).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// One externally originated chat event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub speaker_id: String,
    #[serde(default)]
    pub speaker_name: String,
    pub content: String,
    pub timestamp: DateTime<FixedOffset>,
    #[serde(default)]
    pub refer_list: Vec<ReferEntry>,
    pub msg_type: MsgType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_id: Option<String>,
}

impl RawMessage {
    /// True once the content has been rewritten to a non-text placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.msg_type
            .placeholder()
            .map(|p| self.content == p)
            .unwrap_or(false)
    }
}

/// Kind of raw data a MemCell was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawDataType {
    Conversation,
    Email,
    Memo,
    Document,
}

impl RawDataType {
    pub fn as_str(self) -> &'static str {
        match self {
            RawDataType::Conversation => "conversation",
            RawDataType::Email => "email",
            RawDataType::Memo => "memo",
            RawDataType::Document => "document",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s {
            "conversation" => Some(RawDataType::Conversation),
            "email" => Some(RawDataType::Email),
            "memo" => Some(RawDataType::Memo),
            "document" => Some(RawDataType::Document),
            _ => None,
        }
    }
}

/// Atomic facts extracted from an episode, with per-fact embeddings aligned
/// one-to-one with `atomic_fact`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLog {
    pub time: String,
    pub atomic_fact: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fact_embeddings: Vec<Vec<f32>>,
}

impl EventLog {
    /// Concatenated facts for lexical (BM25) indexing.
    pub fn bm25_text(&self) -> String {
        self.atomic_fact.join(" ")
    }

    /// `time：facts` form used when the log is a rerank document.
    pub fn rerank_text(&self) -> String {
        match (self.time.is_empty(), self.atomic_fact.is_empty()) {
            (false, false) => format!("{}：{}", self.time, self.atomic_fact.join(" ")),
            (false, true) => self.time.clone(),
            (true, false) => self.atomic_fact.join(" "),
            (true, true) => String::new(),
        }
    }
}

/// A closed conversation slice: the atomic unit of memory.
///
/// Created when the boundary detector decides a conversation has ended.
/// Immutable afterwards except for monotone enrichment (`episode`,
/// `event_log`, `extend["embedding"]`) by the same pipeline pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemCell {
    pub event_id: String,
    #[serde(default)]
    pub user_id_list: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    /// Unique set of speaker ids plus mention ids across `original_data`.
    pub participants: Vec<String>,
    /// Messages in arrival order.
    pub original_data: Vec<RawMessage>,
    /// Timestamp of the last message in the slice.
    pub timestamp: DateTime<FixedOffset>,
    #[serde(rename = "type")]
    pub data_type: RawDataType,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_log: Option<EventLog>,
    /// Extension bag: `embedding`, `vector_model`, search-source tags.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extend: BTreeMap<String, Value>,
}

impl MemCell {
    pub fn embedding(&self) -> Option<Vec<f32>> {
        let value = self.extend.get("embedding")?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn set_embedding(&mut self, embedding: Vec<f32>, model: &str) {
        self.extend.insert(
            "embedding".to_string(),
            serde_json::to_value(embedding).unwrap_or(Value::Null),
        );
        self.extend
            .insert("vector_model".to_string(), Value::String(model.to_string()));
    }
}

/// Flow-control result returned alongside an (optional) MemCell so the caller
/// knows whether to keep buffering raw messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResult {
    pub should_wait: bool,
}

impl StatusResult {
    pub fn wait() -> Self {
        Self { should_wait: true }
    }

    pub fn proceed() -> Self {
        Self { should_wait: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_wire_numbers_round_trip() {
        for n in 1u8..=6 {
            let t = MsgType::try_from(n).unwrap();
            assert_eq!(u8::from(t), n);
        }
        assert!(MsgType::try_from(0).is_err());
        assert!(MsgType::try_from(99).is_err());
    }

    #[test]
    fn placeholders_cover_non_text_types() {
        assert!(MsgType::Text.placeholder().is_none());
        assert_eq!(MsgType::Picture.placeholder(), Some("[图片]"));
        assert_eq!(MsgType::File.placeholder(), Some("[文件]"));
        assert_eq!(MsgType::Files.placeholder(), Some("[文件]"));
    }

    #[test]
    fn event_log_rerank_text_joins_time_and_facts() {
        let log = EventLog {
            time: "March 10, 2024(Sunday) at 02:00 PM".to_string(),
            atomic_fact: vec!["Alice asked Bob to ship v2.".to_string()],
            fact_embeddings: vec![],
        };
        assert_eq!(
            log.rerank_text(),
            "March 10, 2024(Sunday) at 02:00 PM：Alice asked Bob to ship v2."
        );
        assert_eq!(log.bm25_text(), "Alice asked Bob to ship v2.");
    }
}
