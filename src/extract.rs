//! Field resolution for usage lines.
//!
//! The agent runtime has renamed most usage fields at least once. Each
//! logical attribute therefore has an ordered alias list; the first alias
//! that yields a usable value wins. Attributes are resolved independently,
//! so a bad timestamp never hides the token counts of the same line.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::types::{LogicalEvent, UNKNOWN};

pub type Object = Map<String, Value>;

pub const TIMESTAMP_KEYS: &[&str] = &["timestamp", "ts", "time", "date", "@timestamp"];
pub const MODEL_KEYS: &[&str] = &["model", "modelId", "model_id", "modelName", "model_name"];
pub const PROVIDER_KEYS: &[&str] = &["provider", "providerId", "provider_id"];

pub const INPUT_KEYS: &[&str] = &[
    "input",
    "input_tokens",
    "inputTokens",
    "prompt_tokens",
    "promptTokens",
];
pub const OUTPUT_KEYS: &[&str] = &[
    "output",
    "output_tokens",
    "outputTokens",
    "completion_tokens",
    "completionTokens",
];
pub const CACHE_READ_KEYS: &[&str] = &[
    "cacheRead",
    "cache_read",
    "cache_read_tokens",
    "cacheReadTokens",
    "cache_read_input_tokens",
];
pub const CACHE_WRITE_KEYS: &[&str] = &[
    "cacheWrite",
    "cache_write",
    "cache_write_tokens",
    "cacheWriteTokens",
    "cache_creation_input_tokens",
];

const USAGE_KEY: &str = "usage";
const COST_KEY: &str = "cost";
const COST_TOTAL_KEY: &str = "total";
const MESSAGE_KEY: &str = "message";
const ROLE_KEY: &str = "role";

/// Epoch values above this are milliseconds.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// First alias holding a non-empty string, trimmed.
pub fn first_string<'a>(obj: &'a Object, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .find(|s| !s.is_empty())
}

fn value_to_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && *f < u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64().filter(|f| f.is_finite()),
        Value::String(s) => s.trim().parse().ok().filter(|f: &f64| f.is_finite()),
        _ => None,
    }
}

/// First alias holding a non-negative integer.
pub fn first_u64(obj: &Object, keys: &[&str]) -> Option<u64> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(value_to_u64)
}

fn parse_timestamp_str(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(parsed.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    if !raw.is_empty() && raw.chars().all(|ch| ch.is_ascii_digit()) {
        // "20260218" is a compact date, not an epoch in 1970.
        if raw.len() == 8 {
            if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y%m%d") {
                return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
            }
        }
        return raw.parse::<i64>().ok().and_then(parse_epoch);
    }
    None
}

fn parse_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value >= EPOCH_MILLIS_THRESHOLD {
        DateTime::<Utc>::from_timestamp_millis(value)
    } else {
        DateTime::<Utc>::from_timestamp(value, 0)
    }
}

/// Parse an instant from a string (RFC3339, naive date-time, bare date or
/// digits) or from an epoch number. Naive values are taken as UTC.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_timestamp_str(s),
        Value::Number(n) => n.as_i64().and_then(parse_epoch),
        _ => None,
    }
}

/// First alias that parses as an instant.
pub fn extract_timestamp(obj: &Object) -> Option<DateTime<Utc>> {
    TIMESTAMP_KEYS
        .iter()
        .filter_map(|k| obj.get(*k))
        .find_map(parse_timestamp)
}

pub fn extract_model(obj: &Object) -> Option<String> {
    first_string(obj, MODEL_KEYS).map(str::to_string)
}

pub fn extract_provider(obj: &Object) -> Option<String> {
    first_string(obj, PROVIDER_KEYS).map(str::to_string)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

impl TokenCounts {
    pub fn is_empty(&self) -> bool {
        self.input == 0 && self.output == 0 && self.cache_read == 0 && self.cache_write == 0
    }

    fn from_object(obj: &Object) -> Self {
        Self {
            input: first_u64(obj, INPUT_KEYS).unwrap_or(0),
            output: first_u64(obj, OUTPUT_KEYS).unwrap_or(0),
            cache_read: first_u64(obj, CACHE_READ_KEYS).unwrap_or(0),
            cache_write: first_u64(obj, CACHE_WRITE_KEYS).unwrap_or(0),
        }
    }
}

/// Token counts from the nested `usage` object, falling back to the same
/// aliases at the top level when `usage` is missing or all zero.
pub fn extract_tokens(obj: &Object) -> TokenCounts {
    if let Some(usage) = obj.get(USAGE_KEY).and_then(|v| v.as_object()) {
        let nested = TokenCounts::from_object(usage);
        if !nested.is_empty() {
            return nested;
        }
    }
    TokenCounts::from_object(obj)
}

/// Sum a cost breakdown. A bare number is taken as is. In an object the
/// component values are summed; `total` is only used when there are no
/// components, so it is never counted twice.
fn cost_from_value(value: &Value) -> Option<f64> {
    match value {
        Value::Object(parts) => {
            let mut sum = None;
            for (key, part) in parts {
                if key == COST_TOTAL_KEY {
                    continue;
                }
                if let Some(v) = value_to_f64(part) {
                    *sum.get_or_insert(0.0) += v;
                }
            }
            sum.or_else(|| parts.get(COST_TOTAL_KEY).and_then(value_to_f64))
        }
        other => value_to_f64(other),
    }
}

/// Embedded USD cost under `usage.cost` or a top-level `cost`.
/// `None` means unknown, not free.
pub fn extract_cost(obj: &Object) -> Option<f64> {
    obj.get(USAGE_KEY)
        .and_then(|u| u.as_object())
        .and_then(|u| u.get(COST_KEY))
        .and_then(cost_from_value)
        .or_else(|| obj.get(COST_KEY).and_then(cost_from_value))
}

/// The `message` envelope of a session line, if any.
pub fn message_of(line: &Object) -> Option<&Object> {
    line.get(MESSAGE_KEY).and_then(|v| v.as_object())
}

pub fn message_role(line: &Object) -> Option<&str> {
    message_of(line)
        .and_then(|m| m.get(ROLE_KEY))
        .and_then(|v| v.as_str())
}

/// Timestamp of a session line: the envelope first, then the message.
pub fn session_timestamp(line: &Object) -> Option<DateTime<Utc>> {
    extract_timestamp(line).or_else(|| message_of(line).and_then(extract_timestamp))
}

fn event_from_scopes(primary: &Object, secondary: Option<&Object>) -> LogicalEvent {
    let tokens = extract_tokens(primary);
    let pick = |f: fn(&Object) -> Option<String>| f(primary).or_else(|| secondary.and_then(f));
    LogicalEvent {
        timestamp: None,
        provider: pick(extract_provider).unwrap_or_else(|| UNKNOWN.to_string()),
        model: pick(extract_model),
        input_tokens: tokens.input,
        output_tokens: tokens.output,
        cache_read_tokens: tokens.cache_read,
        cache_write_tokens: tokens.cache_write,
        cost: extract_cost(primary),
    }
}

/// Usage event of a session line. Only assistant messages carry usage.
pub fn extract_session_event(line: &Object) -> Option<LogicalEvent> {
    let message = message_of(line)?;
    if message.get(ROLE_KEY).and_then(|v| v.as_str()) != Some("assistant") {
        return None;
    }
    let mut event = event_from_scopes(message, Some(line));
    event.timestamp = session_timestamp(line);
    Some(event)
}

/// Usage event of a flat gateway log line.
pub fn extract_gateway_event(line: &Object) -> LogicalEvent {
    let mut event = event_from_scopes(line, None);
    event.timestamp = extract_timestamp(line);
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    fn obj(value: Value) -> Object {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn session_line_with_nested_usage() {
        let line = obj(json!({
            "timestamp": "2026-02-18T08:00:00Z",
            "message": {"role": "assistant", "provider": "p", "model": "m", "usage": {"input": 100, "output": 50}}
        }));
        let event = extract_session_event(&line).expect("event");
        assert_eq!(event.provider, "p");
        assert_eq!(event.model.as_deref(), Some("m"));
        assert_eq!(event.input_tokens, 100);
        assert_eq!(event.output_tokens, 50);
        assert_eq!(event.cost, None);
        assert_eq!(event.timestamp.map(|t| t.hour()), Some(8));
    }

    #[test]
    fn user_lines_are_not_usage_events() {
        let line = obj(json!({
            "timestamp": "2026-02-18T08:00:00Z",
            "message": {"role": "user", "content": "hi"}
        }));
        assert!(extract_session_event(&line).is_none());
        assert_eq!(message_role(&line), Some("user"));
    }

    #[test]
    fn flat_gateway_line_uses_camel_case_aliases() {
        let line = obj(json!({
            "ts": "2026-02-18T09:00:00Z",
            "model": "m",
            "inputTokens": 10,
            "outputTokens": 5
        }));
        let event = extract_gateway_event(&line);
        assert_eq!(event.input_tokens, 10);
        assert_eq!(event.output_tokens, 5);
        assert_eq!(event.provider, UNKNOWN);
        assert_eq!(event.timestamp.map(|t| t.hour()), Some(9));
    }

    #[test]
    fn empty_nested_usage_falls_back_to_top_level() {
        let line = obj(json!({"usage": {}, "prompt_tokens": 7, "completion_tokens": 3}));
        let tokens = extract_tokens(&line);
        assert_eq!(tokens.input, 7);
        assert_eq!(tokens.output, 3);
    }

    #[test]
    fn first_alias_wins() {
        let line = obj(json!({"usage": {"input_tokens": 1, "prompt_tokens": 99}}));
        assert_eq!(extract_tokens(&line).input, 1);
        let line = obj(json!({"model": "  ", "modelId": " kimi-k2.5 "}));
        assert_eq!(extract_model(&line).as_deref(), Some("kimi-k2.5"));
    }

    #[test]
    fn cache_aliases_across_generations() {
        let line = obj(json!({"usage": {"input": 1, "cacheRead": 20, "cacheWrite": 30}}));
        let tokens = extract_tokens(&line);
        assert_eq!((tokens.cache_read, tokens.cache_write), (20, 30));
        let line = obj(json!({"usage": {"input_tokens": 1, "cache_read_input_tokens": 4, "cache_creation_input_tokens": 5}}));
        let tokens = extract_tokens(&line);
        assert_eq!((tokens.cache_read, tokens.cache_write), (4, 5));
    }

    #[test]
    fn cost_sums_components_and_ignores_total() {
        let line = obj(json!({"usage": {"cost": {"input": 0.5, "output": 0.25, "cacheRead": 0.25, "total": 1.0}}}));
        assert_eq!(extract_cost(&line), Some(1.0));
        let only_total = obj(json!({"usage": {"cost": {"total": 0.75}}}));
        assert_eq!(extract_cost(&only_total), Some(0.75));
        let bare = obj(json!({"cost": 0.1}));
        assert_eq!(extract_cost(&bare), Some(0.1));
        let none = obj(json!({"usage": {"input": 3}}));
        assert_eq!(extract_cost(&none), None);
    }

    #[test]
    fn timestamp_forms() {
        let cases = [
            (json!("2026-02-18T10:00:00.000Z"), 10),
            (json!("2026-02-18T12:00:00+02:00"), 10),
            (json!("2026-02-18 10:00:00"), 10),
            (json!("2026-02-18"), 0),
            (json!("20260218"), 0),
            (json!("1771408800"), 10),
            (json!(1_771_408_800_000_i64), 10),
            (json!(1_771_408_800_i64), 10),
        ];
        for (value, hour) in cases {
            let ts = parse_timestamp(&value).unwrap_or_else(|| panic!("parse {value}"));
            assert_eq!(ts.hour(), hour, "{value}");
            assert_eq!(ts.day(), 18, "{value}");
        }
        assert!(parse_timestamp(&json!("yesterday")).is_none());
        assert!(parse_timestamp(&json!(true)).is_none());
    }

    #[test]
    fn compact_date_under_date_alias() {
        let line = obj(json!({"date": "20260218", "model": "m", "input": 1}));
        let ts = extract_timestamp(&line).expect("timestamp");
        assert_eq!((ts.year(), ts.month(), ts.day()), (2026, 2, 18));
    }

    #[test]
    fn out_of_range_token_counts_are_ignored() {
        let line = obj(json!({"usage": {"input": 1e30, "output": 1}}));
        let event = extract_gateway_event(&line);
        assert_eq!(event.input_tokens, 0);
        assert_eq!(event.output_tokens, 1);
        assert_eq!(first_u64(&obj(json!({"n": 2.5e3})), &["n"]), Some(2500));
    }

    #[test]
    fn unparseable_timestamp_key_falls_through_to_next_alias() {
        let line = obj(json!({"timestamp": "garbage", "ts": "2026-02-18T09:00:00Z"}));
        assert_eq!(extract_timestamp(&line).map(|t| t.hour()), Some(9));
    }

    #[test]
    fn bad_fields_do_not_block_others() {
        let line = obj(json!({
            "timestamp": {"nested": true},
            "model": 42,
            "usage": {"input": "12", "output": -1}
        }));
        let event = extract_gateway_event(&line);
        assert_eq!(event.timestamp, None);
        assert_eq!(event.model, None);
        assert_eq!(event.input_tokens, 12);
        assert_eq!(event.output_tokens, 0);
    }

    #[test]
    fn session_timestamp_falls_back_to_message_epoch() {
        let line = obj(json!({
            "message": {"role": "assistant", "timestamp": 1_771_408_800_000_i64, "model": "m", "usage": {"input": 1}}
        }));
        let event = extract_session_event(&line).expect("event");
        assert_eq!(event.timestamp.map(|t| t.hour()), Some(10));
    }
}
