//! Timezone-aware datetime helpers
//!
//! All naive datetimes are interpreted in the zone named by the `TZ`
//! environment variable (default `Asia/Shanghai`). Timestamps cross the
//! wire as ISO strings or epoch values in either seconds or milliseconds.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;

static DEFAULT_TZ: Lazy<Tz> = Lazy::new(|| {
    let name = std::env::var("TZ").unwrap_or_else(|_| "Asia/Shanghai".to_string());
    name.parse().unwrap_or_else(|_| {
        tracing::warn!(tz = %name, "unknown TZ value, falling back to Asia/Shanghai");
        chrono_tz::Asia::Shanghai
    })
});

/// The process-wide default timezone.
pub fn default_tz() -> Tz {
    *DEFAULT_TZ
}

/// Current time in the default timezone.
pub fn now_local() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&default_tz()).fixed_offset()
}

/// Epoch seconds or milliseconds, auto-detected by magnitude.
pub fn from_timestamp(value: f64) -> Option<DateTime<FixedOffset>> {
    let seconds = if value >= 1e12 { value / 1000.0 } else { value };
    let secs = seconds.trunc() as i64;
    let nanos = ((seconds - seconds.trunc()) * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .map(|dt| dt.with_timezone(&default_tz()).fixed_offset())
}

/// Millisecond epoch value of a datetime.
pub fn to_timestamp_ms(dt: &DateTime<FixedOffset>) -> i64 {
    dt.timestamp_millis()
}

/// Lenient ISO parse. Accepts an offset suffix, a trailing `Z`, or a naive
/// string (interpreted in the default timezone). Returns `None` on failure;
/// callers decide between erroring and substituting "now".
pub fn parse_iso(value: &str) -> Option<DateTime<FixedOffset>> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let normalized = if let Some(stripped) = trimmed.strip_suffix('Z') {
        format!("{stripped}+00:00")
    } else {
        trimmed.to_string()
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt);
    }
    for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return localize(naive);
        }
    }
    None
}

/// Liberal parse used on LLM-facing boundaries: epoch numbers, numeric
/// strings and ISO strings are all accepted.
pub fn parse_flexible(value: &serde_json::Value) -> Option<DateTime<FixedOffset>> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().and_then(from_timestamp),
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.chars().all(|c| c.is_ascii_digit()) && !trimmed.is_empty() {
                trimmed.parse::<f64>().ok().and_then(from_timestamp)
            } else {
                parse_iso(trimmed)
            }
        }
        _ => None,
    }
}

/// Attach the default timezone to a naive local datetime.
pub fn localize(naive: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
    default_tz()
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.fixed_offset())
}

/// ISO-8601 string with offset.
pub fn to_iso(dt: &DateTime<FixedOffset>) -> String {
    dt.to_rfc3339()
}

/// `"March 10, 2024(Sunday) at 02:00 PM"`, the event-log time format.
pub fn format_event_time(dt: &DateTime<FixedOffset>) -> String {
    dt.format("%B %d, %Y(%A) at %I:%M %p").to_string()
}

/// `"March 14, 2024 (Thursday) at 03:00 PM"`, the episode prompt format.
pub fn format_episode_time(dt: &DateTime<FixedOffset>) -> String {
    dt.format("%B %d, %Y (%A) at %I:%M %p").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_iso_with_and_without_offset() {
        let with_offset = parse_iso("2024-03-10T14:00:00+08:00").unwrap();
        assert_eq!(with_offset.timestamp(), 1710050400);

        let z_suffix = parse_iso("2024-03-10T06:00:00Z").unwrap();
        assert_eq!(z_suffix.timestamp(), with_offset.timestamp());

        assert!(parse_iso("2024-03-10 14:00:00").is_some());
        assert!(parse_iso("not a date").is_none());
    }

    #[test]
    fn detects_second_and_millisecond_epochs() {
        let secs = from_timestamp(1_700_000_000.0).unwrap();
        let millis = from_timestamp(1_700_000_000_000.0).unwrap();
        assert_eq!(secs.timestamp(), millis.timestamp());
    }

    #[test]
    fn event_time_format_matches_contract() {
        let dt = parse_iso("2024-03-10T14:00:00+08:00").unwrap();
        assert_eq!(format_event_time(&dt), "March 10, 2024(Sunday) at 02:00 PM");
    }

    #[test]
    fn flexible_parse_accepts_numeric_strings() {
        let v = serde_json::json!("1700000000");
        assert!(parse_flexible(&v).is_some());
        let v = serde_json::json!(1_700_000_000_000i64);
        assert!(parse_flexible(&v).is_some());
        let v = serde_json::json!("2024-03-10T14:00:00+08:00");
        assert!(parse_flexible(&v).is_some());
        let v = serde_json::json!(null);
        assert!(parse_flexible(&v).is_none());
    }
}
