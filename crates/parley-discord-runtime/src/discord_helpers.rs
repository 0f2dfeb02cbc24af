use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde_json::Value;

/// Discord rejects message content above this many characters.
pub(crate) const DISCORD_MAX_MESSAGE_CHARS: usize = 2000;

/// Upper bound on any server-supplied rate-limit delay.
pub(crate) const MAX_RETRY_AFTER: Duration = crate::typing_throttle::MAX_RATE_LIMIT_WAIT;

/// Reads a rate-limit delay from the `Retry-After` header (seconds, possibly
/// fractional, or an HTTP date) and falls back to the JSON body's
/// `retry_after` field that Discord also sends. The result never exceeds
/// [`MAX_RETRY_AFTER`]; unrepresentable values yield `None`.
pub(crate) fn parse_retry_after(headers: &HeaderMap, body: &str) -> Option<Duration> {
    raw_retry_after(headers, body).map(|delay| delay.min(MAX_RETRY_AFTER))
}

fn raw_retry_after(headers: &HeaderMap, body: &str) -> Option<Duration> {
    if let Some(raw) = headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        if let Some(delay) = parse_seconds(raw) {
            return Some(delay);
        }
        if let Ok(retry_at) = DateTime::parse_from_rfc2822(raw) {
            let delay_ms = retry_at
                .with_timezone(&Utc)
                .signed_duration_since(Utc::now())
                .num_milliseconds();
            return Some(Duration::from_millis(u64::try_from(delay_ms).unwrap_or(0)));
        }
    }

    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("retry_after").and_then(Value::as_f64))
        .and_then(seconds_to_duration)
}

fn parse_seconds(raw: &str) -> Option<Duration> {
    raw.parse::<f64>().ok().and_then(seconds_to_duration)
}

fn seconds_to_duration(seconds: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(seconds).ok()
}

pub(crate) fn truncate_for_error(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut truncated = value.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}

/// Splits `text` into pieces of at most `max_chars` characters.
pub(crate) fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.is_empty() || max_chars == 0 {
        return Vec::new();
    }
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for ch in text.chars() {
        current.push(ch);
        current_len += 1;
        if current_len >= max_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Parses a Discord snowflake id.
pub(crate) fn parse_snowflake(raw: &str) -> Option<u64> {
    raw.trim().parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    use super::{
        chunk_text, parse_retry_after, parse_snowflake, truncate_for_error, MAX_RETRY_AFTER,
    };

    #[test]
    fn unit_parse_retry_after_prefers_header_then_body() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        assert_eq!(
            parse_retry_after(&headers, r#"{"retry_after": 9.0}"#),
            Some(Duration::from_secs(3))
        );

        headers.insert(RETRY_AFTER, HeaderValue::from_static("1.5"));
        assert_eq!(parse_retry_after(&headers, ""), Some(Duration::from_millis(1500)));

        let empty = HeaderMap::new();
        assert_eq!(
            parse_retry_after(&empty, r#"{"message": "You are being rate limited.", "retry_after": 0.25, "global": false}"#),
            Some(Duration::from_millis(250))
        );
        assert_eq!(parse_retry_after(&empty, "not json"), None);
    }

    #[test]
    fn regression_parse_retry_after_rejects_negative_values() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("-4"));
        assert_eq!(parse_retry_after(&headers, ""), None);
    }

    #[test]
    fn regression_parse_retry_after_ignores_unrepresentable_header_values() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("1e20"));
        assert_eq!(parse_retry_after(&headers, ""), None);

        headers.insert(RETRY_AFTER, HeaderValue::from_static("inf"));
        assert_eq!(parse_retry_after(&headers, ""), None);
    }

    #[test]
    fn regression_parse_retry_after_caps_long_delays() {
        let empty = HeaderMap::new();
        assert_eq!(
            parse_retry_after(&empty, r#"{"retry_after": 31536000}"#),
            Some(MAX_RETRY_AFTER)
        );

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("86400"));
        assert_eq!(parse_retry_after(&headers, ""), Some(MAX_RETRY_AFTER));
    }

    #[test]
    fn unit_chunk_text_respects_char_boundaries() {
        assert_eq!(chunk_text("abcdef", 4), vec!["abcd", "ef"]);
        assert_eq!(chunk_text("ééé", 2), vec!["éé", "é"]);
        assert!(chunk_text("", 4).is_empty());
    }

    #[test]
    fn unit_truncate_for_error_appends_ellipsis() {
        assert_eq!(truncate_for_error("short", 10), "short");
        assert_eq!(truncate_for_error("abcdef", 3), "abc...");
    }

    #[test]
    fn unit_parse_snowflake_accepts_numeric_ids_only() {
        assert_eq!(parse_snowflake(" 175928847299117063 "), Some(175_928_847_299_117_063));
        assert_eq!(parse_snowflake("abc"), None);
    }
}
