//! Conversation boundary detection
//!
//! Given buffered history and newly arrived messages, decide whether the
//! in-flight conversation has closed. The LLM proposes; three tie-break
//! rules are enforced here regardless of what it says:
//! - a calendar-day change between history and new messages forces an end,
//! - `should_end` wins when the model sets both flags,
//! - all-placeholder new messages force a wait.

use std::sync::Arc;

use evermem_config::{PromptKey, PromptRegistry};
use evermem_core::time;
use evermem_core::RawMessage;
use evermem_llm::ChatModel;

use crate::json;
use crate::Result;

const MAX_PARSE_RETRIES: u32 = 5;

/// Boundary decision for one batch of new messages.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundaryResult {
    pub should_end: bool,
    pub should_wait: bool,
    pub reasoning: String,
    pub confidence: f32,
    pub topic_summary: String,
}

/// LLM-backed boundary detector.
pub struct BoundaryDetector {
    chat: Arc<dyn ChatModel>,
    prompts: Arc<PromptRegistry>,
}

impl BoundaryDetector {
    pub fn new(chat: Arc<dyn ChatModel>, prompts: Arc<PromptRegistry>) -> Self {
        Self { chat, prompts }
    }

    /// Format messages as dated dialogue lines.
    fn format_messages(messages: &[RawMessage]) -> String {
        messages
            .iter()
            .map(|msg| {
                let ts = msg.timestamp.format("%Y-%m-%d %H:%M:%S");
                format!("[{ts}] {}: {}", msg.speaker_name, msg.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Human-readable description of the gap between the last history
    /// message and the first new one, bucketed for the prompt.
    fn time_gap_info(history: &[RawMessage], new: &[RawMessage]) -> String {
        let (last, first) = match (history.last(), new.first()) {
            (Some(last), Some(first)) => (last, first),
            _ => return "No time gap information available".to_string(),
        };
        let seconds = (first.timestamp - last.timestamp).num_seconds();
        if seconds < 0 {
            "Time gap: Messages appear to be out of order".to_string()
        } else if seconds < 60 {
            format!("Time gap: {seconds} seconds (immediate response)")
        } else if seconds < 3600 {
            format!("Time gap: {} minutes (recent conversation)", seconds / 60)
        } else if seconds < 86_400 {
            format!(
                "Time gap: {} hours (same day, but significant pause)",
                seconds / 3600
            )
        } else {
            format!(
                "Time gap: {} days (long gap, likely new conversation)",
                seconds / 86_400
            )
        }
    }

    /// Calendar dates differ between last history and first new message
    /// (compared in the configured timezone).
    fn crosses_day(history: &[RawMessage], new: &[RawMessage]) -> bool {
        match (history.last(), new.first()) {
            (Some(last), Some(first)) => {
                let tz = time::default_tz();
                last.timestamp.with_timezone(&tz).date_naive()
                    != first.timestamp.with_timezone(&tz).date_naive()
            }
            _ => false,
        }
    }

    pub async fn detect(
        &self,
        history: &[RawMessage],
        new: &[RawMessage],
    ) -> Result<BoundaryResult> {
        if history.is_empty() {
            return Ok(BoundaryResult {
                should_end: false,
                should_wait: false,
                reasoning: "First messages in conversation".to_string(),
                confidence: 1.0,
                topic_summary: String::new(),
            });
        }

        let prompt = self.prompts.render(
            PromptKey::BoundaryDetection,
            &[
                ("conversation_history", &Self::format_messages(history)),
                ("new_messages", &Self::format_messages(new)),
                ("time_gap_info", &Self::time_gap_info(history, new)),
            ],
        )?;

        let value = json::generate_json(
            &self.chat,
            &self.prompts,
            &prompt,
            MAX_PARSE_RETRIES,
            |v| {
                if v.get("should_end").is_some() || v.get("should_wait").is_some() {
                    Ok(())
                } else {
                    Err("missing should_end/should_wait".to_string())
                }
            },
        )
        .await?;

        let mut result = BoundaryResult {
            should_end: value["should_end"].as_bool().unwrap_or(false),
            should_wait: value["should_wait"].as_bool().unwrap_or(true),
            reasoning: value["reasoning"]
                .as_str()
                .unwrap_or("No reason provided")
                .to_string(),
            confidence: value["confidence"].as_f64().unwrap_or(1.0) as f32,
            topic_summary: value["topic_summary"].as_str().unwrap_or("").to_string(),
        };

        self.apply_tie_breaks(&mut result, history, new);
        Ok(result)
    }

    fn apply_tie_breaks(
        &self,
        result: &mut BoundaryResult,
        history: &[RawMessage],
        new: &[RawMessage],
    ) {
        if Self::crosses_day(history, new) {
            if !result.should_end {
                tracing::debug!("day change forces conversation end");
            }
            result.should_end = true;
            result.should_wait = false;
        }
        if result.should_end && result.should_wait {
            result.should_wait = false;
        }
        let all_placeholders = !new.is_empty() && new.iter().all(RawMessage::is_placeholder);
        if all_placeholders {
            result.should_end = false;
            result.should_wait = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::DateTime;
    use evermem_core::{Locale, MsgType};
    use evermem_llm::{LlmError, Result as LlmResult};
    use fake::FakeChat;

    mod fake {
        use super::*;
        use std::sync::Mutex;

        /// Chat stub returning canned replies in order.
        pub struct FakeChat {
            pub replies: Mutex<Vec<String>>,
        }

        impl FakeChat {
            pub fn new(replies: Vec<&str>) -> Self {
                Self {
                    replies: Mutex::new(replies.into_iter().rev().map(String::from).collect()),
                }
            }
        }

        #[async_trait]
        impl ChatModel for FakeChat {
            async fn generate_with(
                &self,
                _prompt: &str,
                _temperature: Option<f32>,
                _max_tokens: Option<u32>,
            ) -> LlmResult<String> {
                self.replies
                    .lock()
                    .unwrap()
                    .pop()
                    .ok_or_else(|| LlmError::Generation("no canned reply".to_string()))
            }

            async fn chat(&self, _messages: &[evermem_llm::ChatMessage]) -> LlmResult<String> {
                self.generate_with("", None, None).await
            }
        }
    }

    fn msg(ts: &str, content: &str, msg_type: MsgType) -> RawMessage {
        RawMessage {
            speaker_id: "u1".to_string(),
            speaker_name: "Alice".to_string(),
            content: content.to_string(),
            timestamp: DateTime::parse_from_rfc3339(ts).unwrap(),
            refer_list: vec![],
            msg_type,
            data_id: None,
        }
    }

    fn detector(replies: Vec<&str>) -> BoundaryDetector {
        BoundaryDetector::new(
            Arc::new(FakeChat::new(replies)),
            Arc::new(PromptRegistry::new(Locale::En)),
        )
    }

    #[tokio::test]
    async fn empty_history_starts_immediately() {
        let detector = detector(vec![]);
        let result = detector
            .detect(&[], &[msg("2024-03-14T10:00:00+08:00", "hi", MsgType::Text)])
            .await
            .unwrap();
        assert!(!result.should_end);
        assert!(!result.should_wait);
    }

    #[tokio::test]
    async fn day_change_forces_end_regardless_of_llm() {
        let detector = detector(vec![
            r#"{"should_end": false, "should_wait": true, "reasoning": "...", "confidence": 0.5, "topic_summary": ""}"#,
        ]);
        let history = vec![msg("2024-03-14T23:55:00+08:00", "good night", MsgType::Text)];
        let new = vec![msg("2024-03-15T00:04:00+08:00", "morning!", MsgType::Text)];
        let result = detector.detect(&history, &new).await.unwrap();
        assert!(result.should_end);
        assert!(!result.should_wait);
    }

    #[tokio::test]
    async fn end_wins_when_both_flags_set() {
        let detector = detector(vec![
            r#"{"should_end": true, "should_wait": true, "reasoning": "...", "confidence": 0.9}"#,
        ]);
        let history = vec![msg("2024-03-14T10:00:00+08:00", "a", MsgType::Text)];
        let new = vec![msg("2024-03-14T10:05:00+08:00", "b", MsgType::Text)];
        let result = detector.detect(&history, &new).await.unwrap();
        assert!(result.should_end);
        assert!(!result.should_wait);
    }

    #[tokio::test]
    async fn placeholder_only_new_messages_force_wait() {
        let detector = detector(vec![
            r#"{"should_end": true, "should_wait": false, "reasoning": "...", "confidence": 0.9}"#,
        ]);
        let history = vec![msg("2024-03-14T10:00:00+08:00", "look at this", MsgType::Text)];
        let new = vec![msg("2024-03-14T10:01:00+08:00", "[图片]", MsgType::Picture)];
        let result = detector.detect(&history, &new).await.unwrap();
        assert!(!result.should_end);
        assert!(result.should_wait);
    }

    #[tokio::test]
    async fn retries_then_succeeds_on_later_reply() {
        let detector = detector(vec![
            "not json",
            r#"{"should_end": true, "should_wait": false, "reasoning": "done", "confidence": 0.8, "topic_summary": "release plan"}"#,
        ]);
        let history = vec![msg("2024-03-14T10:00:00+08:00", "a", MsgType::Text)];
        let new = vec![msg("2024-03-14T10:05:00+08:00", "b", MsgType::Text)];
        let result = detector.detect(&history, &new).await.unwrap();
        assert!(result.should_end);
        assert_eq!(result.topic_summary, "release plan");
    }

    #[test]
    fn gap_buckets_cover_the_ranges() {
        let history = vec![msg("2024-03-14T10:00:00+08:00", "a", MsgType::Text)];
        let cases = [
            ("2024-03-14T10:00:30+08:00", "seconds"),
            ("2024-03-14T10:30:00+08:00", "minutes"),
            ("2024-03-14T15:00:00+08:00", "hours"),
            ("2024-03-17T10:00:00+08:00", "days"),
        ];
        for (ts, needle) in cases {
            let new = vec![msg(ts, "b", MsgType::Text)];
            let info = BoundaryDetector::time_gap_info(&history, &new);
            assert!(info.contains(needle), "{info} should mention {needle}");
        }
    }
}
