//! Audit record types and the normalisation rules applied before writing.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum nesting depth kept in `details`.
pub const MAX_DETAIL_DEPTH: usize = 6;
/// Maximum number of keys/items kept per object or array in `details`.
pub const MAX_DETAIL_ITEMS: usize = 80;
/// Maximum length of a string in `details`.
pub const MAX_DETAIL_STR_LEN: usize = 8000;

static UNSAFE_NAME_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.-]+").expect("valid name regex"));

/// Which way an event flows relative to the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Data arriving from a worker, planner or user
    Inbound,
    /// Work leaving the engine (dispatches, planner requests)
    Outbound,
    /// Engine-internal decisions
    Internal,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
            Direction::Internal => write!(f, "internal"),
        }
    }
}

/// Severity carried on each record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditLevel {
    #[default]
    Info,
    Warn,
    Error,
}

/// A single audit record. One JSON object per line of the active stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEvent {
    /// Position in the current session, starting at 1
    pub session_seq: u64,

    /// When the record was written
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub level: AuditLevel,

    /// Emitting component (sanitised to `[A-Za-z0-9_.-]`)
    pub component: String,

    /// What happened (sanitised like `component`)
    pub action: String,

    pub direction: Direction,

    /// Free-form payload, normalised by [`normalize_details`]
    #[serde(default)]
    pub details: Value,
}

impl LogEvent {
    /// File name used when this record is archived:
    /// `{session_seq:010}_{component}_{action}_{compact timestamp}.json`.
    pub fn archive_file_name(&self) -> String {
        format!(
            "{:010}_{}_{}_{}.json",
            self.session_seq,
            sanitize_name(&self.component),
            sanitize_name(&self.action),
            compact_timestamp(&self.timestamp)
        )
    }
}

/// Replace anything outside `[A-Za-z0-9_.-]` with `_`; empty names become `unknown`.
pub fn sanitize_name(name: &str) -> String {
    let cleaned = UNSAFE_NAME_CHARS.replace_all(name.trim(), "_").to_string();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

/// Compact UTC timestamp used in archive file names, e.g. `20260101T120000_000123Z`.
pub fn compact_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y%m%dT%H%M%S_%6fZ").to_string()
}

/// Bound the size of a details payload: depth, item count and string length.
pub fn normalize_details(value: Value) -> Value {
    normalize_value(value, 0)
}

fn normalize_value(value: Value, depth: usize) -> Value {
    if depth >= MAX_DETAIL_DEPTH {
        return Value::String("<max_depth_reached>".to_string());
    }

    match value {
        Value::String(s) => Value::String(truncate_text(s)),
        Value::Array(items) => {
            let total = items.len();
            let mut out: Vec<Value> = items
                .into_iter()
                .take(MAX_DETAIL_ITEMS)
                .map(|item| normalize_value(item, depth + 1))
                .collect();
            if total > MAX_DETAIL_ITEMS {
                out.push(Value::String(format!(
                    "... trimmed after {} items",
                    MAX_DETAIL_ITEMS
                )));
            }
            Value::Array(out)
        }
        Value::Object(map) => {
            let total = map.len();
            let mut out = serde_json::Map::new();
            for (key, item) in map.into_iter().take(MAX_DETAIL_ITEMS) {
                out.insert(key, normalize_value(item, depth + 1));
            }
            if total > MAX_DETAIL_ITEMS {
                out.insert(
                    "...".to_string(),
                    Value::String(format!("trimmed after {} keys", MAX_DETAIL_ITEMS)),
                );
            }
            Value::Object(out)
        }
        other => other,
    }
}

fn truncate_text(text: String) -> String {
    if text.chars().count() <= MAX_DETAIL_STR_LEN {
        return text;
    }
    let mut truncated: String = text.chars().take(MAX_DETAIL_STR_LEN).collect();
    truncated.push_str("...(truncated)");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("workflow.executor"), "workflow.executor");
        assert_eq!(sanitize_name("step dispatcher/http"), "step_dispatcher_http");
        assert_eq!(sanitize_name("   "), "unknown");
    }

    #[test]
    fn test_archive_file_name() {
        let event = LogEvent {
            session_seq: 42,
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 9, 5, 7).unwrap(),
            level: AuditLevel::Info,
            component: "executor".to_string(),
            action: "step started".to_string(),
            direction: Direction::Outbound,
            details: json!({}),
        };
        assert_eq!(
            event.archive_file_name(),
            "0000000042_executor_step_started_20260301T090507_000000Z.json"
        );
    }

    #[test]
    fn test_normalize_details_bounds() {
        let long = "x".repeat(MAX_DETAIL_STR_LEN + 10);
        let many: Vec<Value> = (0..100).map(|i| json!(i)).collect();
        let normalized = normalize_details(json!({ "text": long, "items": many }));

        let text = normalized["text"].as_str().unwrap();
        assert!(text.ends_with("...(truncated)"));
        let items = normalized["items"].as_array().unwrap();
        assert_eq!(items.len(), MAX_DETAIL_ITEMS + 1);
    }

    #[test]
    fn test_normalize_details_depth() {
        let deep = json!({"a": {"b": {"c": {"d": {"e": {"f": {"g": 1}}}}}}});
        let normalized = normalize_details(deep);
        assert_eq!(
            normalized["a"]["b"]["c"]["d"]["e"]["f"],
            json!("<max_depth_reached>")
        );
    }

    #[test]
    fn test_direction_serialization() {
        assert_eq!(serde_json::to_string(&Direction::Inbound).unwrap(), "\"inbound\"");
        assert_eq!(serde_json::to_string(&AuditLevel::Warn).unwrap(), "\"WARN\"");
    }
}
