//! MemCell extraction
//!
//! Preprocesses incoming messages (drops unsupported types with a warning,
//! rewrites non-text content to placeholders), consults the boundary
//! detector, and emits a MemCell from the buffered history once the
//! conversation has closed. The new messages are deferred to the next slice.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use evermem_core::{MemCell, MsgType, RawDataType, RawMessage, ReferEntry, StatusResult};

use crate::boundary::BoundaryDetector;
use crate::Result;

/// A message as it arrives from the chat gateway, before type filtering.
/// `msg_type` is the raw wire number; values outside the supported set cause
/// the whole message to be skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub speaker_id: String,
    #[serde(default)]
    pub speaker_name: String,
    pub content: String,
    pub timestamp: DateTime<FixedOffset>,
    #[serde(default)]
    pub refer_list: Vec<ReferEntry>,
    pub msg_type: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_id: Option<String>,
}

impl IncomingMessage {
    pub fn text(
        speaker_id: &str,
        speaker_name: &str,
        content: &str,
        timestamp: DateTime<FixedOffset>,
    ) -> Self {
        Self {
            speaker_id: speaker_id.to_string(),
            speaker_name: speaker_name.to_string(),
            content: content.to_string(),
            timestamp,
            refer_list: vec![],
            msg_type: MsgType::Text.into(),
            data_id: None,
        }
    }
}

/// Input to one extraction pass: everything buffered so far plus the newly
/// arrived messages.
#[derive(Debug, Clone, Default)]
pub struct MemCellExtractRequest {
    pub history: Vec<IncomingMessage>,
    pub new_messages: Vec<IncomingMessage>,
    pub user_id_list: Vec<String>,
    pub group_id: Option<String>,
    pub group_name: Option<String>,
}

/// Conversation MemCell extractor. Only responsible for boundary-gated slice
/// emission; episodes, event logs and embeddings are filled in by the later
/// extractors.
pub struct MemCellExtractor {
    detector: BoundaryDetector,
}

impl MemCellExtractor {
    pub fn new(detector: BoundaryDetector) -> Self {
        Self { detector }
    }

    /// Type-filter and placeholder-rewrite one incoming message.
    fn preprocess(msg: &IncomingMessage) -> Option<RawMessage> {
        let msg_type = match MsgType::try_from(msg.msg_type) {
            Ok(t) => t,
            Err(_) => {
                tracing::warn!(msg_type = msg.msg_type, "skipping unsupported message type");
                return None;
            }
        };
        let content = match msg_type.placeholder() {
            Some(placeholder) => placeholder.to_string(),
            None => msg.content.clone(),
        };
        Some(RawMessage {
            speaker_id: msg.speaker_id.clone(),
            speaker_name: msg.speaker_name.clone(),
            content,
            timestamp: msg.timestamp,
            refer_list: msg.refer_list.clone(),
            msg_type,
            data_id: msg.data_id.clone(),
        })
    }

    /// Unique participants: every speaker plus every mentioned id, in first
    /// appearance order.
    fn participants(messages: &[RawMessage]) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for msg in messages {
            if !msg.speaker_id.is_empty() && seen.insert(msg.speaker_id.clone()) {
                out.push(msg.speaker_id.clone());
            }
            for refer in &msg.refer_list {
                if !refer.id.is_empty() && seen.insert(refer.id.clone()) {
                    out.push(refer.id.clone());
                }
            }
        }
        out
    }

    pub async fn extract(
        &self,
        request: &MemCellExtractRequest,
    ) -> Result<(Option<MemCell>, StatusResult)> {
        let history: Vec<RawMessage> = request
            .history
            .iter()
            .filter_map(Self::preprocess)
            .collect();

        // When the last new message itself was dropped there is nothing to
        // anchor a boundary on; buffer and wait.
        if let Some(last) = request.new_messages.last() {
            if Self::preprocess(last).is_none() {
                tracing::warn!("last new message was filtered out, waiting for more input");
                return Ok((None, StatusResult::wait()));
            }
        }

        let new_messages: Vec<RawMessage> = request
            .new_messages
            .iter()
            .filter_map(Self::preprocess)
            .collect();

        if history.is_empty() || new_messages.is_empty() {
            tracing::warn!("no valid messages after filtering, waiting");
            return Ok((None, StatusResult::wait()));
        }

        let decision = self.detector.detect(&history, &new_messages).await?;
        let status = StatusResult {
            should_wait: decision.should_wait,
        };

        if !decision.should_end {
            if decision.should_wait {
                tracing::debug!(reason = %decision.reasoning, "waiting for more messages");
            }
            return Ok((None, status));
        }

        let Some(last_message) = history.last() else {
            return Ok((None, status));
        };
        let timestamp = last_message.timestamp;
        let participants = Self::participants(&history);

        // Summary prefers the detector's topic summary; otherwise the first
        // 200 characters of the last new message.
        let summary = if !decision.topic_summary.is_empty() {
            decision.topic_summary.clone()
        } else {
            let fallback = new_messages
                .last()
                .map(|m| m.content.trim().to_string())
                .unwrap_or_default();
            if fallback.is_empty() {
                "conversation slice".to_string()
            } else {
                fallback.chars().take(200).collect()
            }
        };

        let memcell = MemCell {
            event_id: Uuid::new_v4().to_string(),
            user_id_list: request.user_id_list.clone(),
            group_id: request.group_id.clone(),
            participants,
            original_data: history,
            timestamp,
            data_type: RawDataType::Conversation,
            summary,
            episode: None,
            event_log: None,
            extend: BTreeMap::new(),
        };

        tracing::debug!(
            event_id = %memcell.event_id,
            participants = memcell.participants.len(),
            messages = memcell.original_data.len(),
            "memcell created"
        );
        Ok((Some(memcell), status))
    }
}
