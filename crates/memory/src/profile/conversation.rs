//! Conversation assembly for profile prompts
//!
//! Builds one combined text over all MemCells in a batch, each slice
//! delimited by its MEMCELL_ID so the model can cite conversation ids as
//! evidence. Speakers are annotated `name(user_id:…)` and `@name` mentions
//! are rewritten from the refer list.

use chrono::{Datelike, Duration, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use evermem_core::{MemCell, UserProfile};

/// user_id → user_name over the batch plus any historical profiles.
/// Batch data wins on conflict.
pub fn user_name_map(memcells: &[MemCell], old_profiles: &[UserProfile]) -> HashMap<String, String> {
    let mut names = HashMap::new();
    for memcell in memcells {
        for msg in &memcell.original_data {
            if !msg.speaker_id.is_empty() && !msg.speaker_name.is_empty() {
                names.insert(msg.speaker_id.clone(), msg.speaker_name.clone());
            }
            for refer in &msg.refer_list {
                if !refer.id.is_empty() && !refer.name.is_empty() {
                    names.entry(refer.id.clone()).or_insert(refer.name.clone());
                }
            }
        }
    }
    for profile in old_profiles {
        if let Some(name) = &profile.user_name {
            names.entry(profile.user_id.clone()).or_insert(name.clone());
        }
    }
    names
}

/// Rewrite `@name` mentions as `@name(user_id:…)` using the refer list.
pub fn annotate_mentions(content: &str, refers: &[(String, String)]) -> String {
    let mut updated = content.to_string();
    for (id, name) in refers {
        if name.is_empty() || id.is_empty() {
            continue;
        }
        let annotated = format!("@{name}(user_id:{id})");
        if updated.contains(&annotated) {
            continue;
        }
        updated = updated.replace(&format!("@{name}"), &annotated);
    }
    updated
}

/// One MemCell rendered with its id separator.
fn memcell_block(memcell: &MemCell, names: &HashMap<String, String>) -> String {
    let mut lines = vec![format!("=== MEMCELL_ID: {} ===", memcell.event_id)];
    for msg in &memcell.original_data {
        let speaker_name = if msg.speaker_name.is_empty() {
            names.get(&msg.speaker_id).cloned().unwrap_or_default()
        } else {
            msg.speaker_name.clone()
        };
        let speaker = if msg.speaker_id.is_empty() {
            speaker_name
        } else {
            format!("{speaker_name}(user_id:{})", msg.speaker_id)
        };
        let refers: Vec<(String, String)> = msg
            .refer_list
            .iter()
            .map(|r| (r.id.clone(), r.name.clone()))
            .collect();
        let content = annotate_mentions(&msg.content, &refers);
        if !content.is_empty() {
            lines.push(format!("{speaker}: {content}"));
        }
    }
    lines.join("\n")
}

/// Combined conversation text over the batch.
pub fn combined_conversation_text(
    memcells: &[MemCell],
    names: &HashMap<String, String>,
) -> String {
    memcells
        .iter()
        .map(|memcell| memcell_block(memcell, names))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// conversation_id → `YYYY-MM-DD` over the batch, for evidence formatting.
pub fn conversation_date_map(memcells: &[MemCell]) -> HashMap<String, String> {
    memcells
        .iter()
        .map(|memcell| {
            (
                memcell.event_id.clone(),
                memcell.timestamp.format("%Y-%m-%d").to_string(),
            )
        })
        .collect()
}

static ENGLISH_RELATIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(today|tomorrow|yesterday|this week|last week|next week|this month|last month|next month)\b")
        .unwrap()
});
static CHINESE_RELATIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new("(今天|明天|第二天|昨天|本周|这周|上周|下周|本月|这个月|上个月|下个月)").unwrap()
});
static ALREADY_ANNOTATED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*[（(]\d{4}-\d{2}-\d{2}").unwrap());

fn month_end(base: NaiveDate, offset: i32) -> NaiveDate {
    let mut year = base.year();
    let mut month = base.month() as i32 + offset;
    while month < 1 {
        month += 12;
        year -= 1;
    }
    while month > 12 {
        month -= 12;
        year += 1;
    }
    let first_next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month as u32 + 1, 1)
    };
    first_next
        .map(|d| d - Duration::days(1))
        .unwrap_or(base)
}

fn resolve_relative(phrase: &str, base: NaiveDate) -> Option<NaiveDate> {
    let normalized = phrase.trim().to_lowercase();
    let date = match normalized.as_str() {
        "today" | "今天" | "this week" | "本周" | "这周" => base,
        "tomorrow" | "明天" | "第二天" => base + Duration::days(1),
        "yesterday" | "昨天" => base - Duration::days(1),
        "last week" | "上周" => base - Duration::days(7),
        "next week" | "下周" => base + Duration::days(7),
        "this month" | "本月" | "这个月" => month_end(base, 0),
        "last month" | "上个月" => month_end(base, -1),
        "next month" | "下个月" => month_end(base, 1),
        _ => return None,
    };
    Some(date)
}

/// Append absolute dates after relative date phrases, so reasoning text
/// stays interpretable once the batch date is gone.
pub fn annotate_relative_dates(text: &str, base_date: &str) -> String {
    let Ok(base) = NaiveDate::parse_from_str(base_date, "%Y-%m-%d") else {
        return text.to_string();
    };

    let annotate = |text: &str, pattern: &Regex| -> String {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for m in pattern.find_iter(text) {
            out.push_str(&text[last..m.end()]);
            last = m.end();
            if ALREADY_ANNOTATED.is_match(&text[m.end()..]) {
                continue;
            }
            if let Some(date) = resolve_relative(m.as_str(), base) {
                out.push_str(&format!(" ({date})"));
            }
        }
        out.push_str(&text[last..]);
        out
    };

    let text = annotate(text, &ENGLISH_RELATIVE);
    annotate(&text, &CHINESE_RELATIVE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use evermem_core::{MsgType, RawDataType, RawMessage, ReferEntry};
    use std::collections::BTreeMap;

    fn memcell(event_id: &str, ts: &str) -> MemCell {
        MemCell {
            event_id: event_id.to_string(),
            user_id_list: vec![],
            group_id: Some("g1".to_string()),
            participants: vec!["u1".to_string()],
            original_data: vec![RawMessage {
                speaker_id: "u1".to_string(),
                speaker_name: "Alice".to_string(),
                content: "ping @Bob about the deploy".to_string(),
                timestamp: DateTime::parse_from_rfc3339(ts).unwrap(),
                refer_list: vec![ReferEntry {
                    id: "u2".to_string(),
                    name: "Bob".to_string(),
                }],
                msg_type: MsgType::Text,
                data_id: None,
            }],
            timestamp: DateTime::parse_from_rfc3339(ts).unwrap(),
            data_type: RawDataType::Conversation,
            summary: String::new(),
            episode: None,
            event_log: None,
            extend: BTreeMap::new(),
        }
    }

    #[test]
    fn conversation_text_delimits_memcells_and_annotates() {
        let cells = vec![
            memcell("cell-a", "2024-03-10T10:00:00+08:00"),
            memcell("cell-b", "2024-03-11T10:00:00+08:00"),
        ];
        let names = user_name_map(&cells, &[]);
        let text = combined_conversation_text(&cells, &names);
        assert!(text.contains("=== MEMCELL_ID: cell-a ==="));
        assert!(text.contains("=== MEMCELL_ID: cell-b ==="));
        assert!(text.contains("Alice(user_id:u1)"));
        assert!(text.contains("@Bob(user_id:u2)"));
    }

    #[test]
    fn mention_annotation_is_idempotent() {
        let refers = vec![("u2".to_string(), "Bob".to_string())];
        let once = annotate_mentions("ping @Bob", &refers);
        let twice = annotate_mentions(&once, &refers);
        assert_eq!(once, twice);
        assert_eq!(once, "ping @Bob(user_id:u2)");
    }

    #[test]
    fn date_map_uses_memcell_dates() {
        let cells = vec![memcell("cell-a", "2024-03-10T23:00:00+08:00")];
        let map = conversation_date_map(&cells);
        assert_eq!(map["cell-a"], "2024-03-10");
    }

    #[test]
    fn relative_dates_get_absolute_annotations() {
        let text = annotate_relative_dates("we ship tomorrow and review next week", "2024-03-10");
        assert!(text.contains("tomorrow (2024-03-11)"));
        assert!(text.contains("next week (2024-03-17)"));

        let zh = annotate_relative_dates("明天上线，下周复盘", "2024-03-10");
        assert!(zh.contains("明天 (2024-03-11)"));
        assert!(zh.contains("下周 (2024-03-17)"));
    }

    #[test]
    fn already_annotated_phrases_stay_untouched() {
        let text = annotate_relative_dates("tomorrow (2024-03-11) works", "2024-03-10");
        assert_eq!(text.matches("2024-03-11").count(), 1);
    }

    #[test]
    fn month_phrases_resolve_to_month_end() {
        let text = annotate_relative_dates("due this month", "2024-02-10");
        assert!(text.contains("this month (2024-02-29)"));
    }
}
