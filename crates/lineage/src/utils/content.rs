use std::borrow::Cow;

use serde_json::{Map, Value};

const PRIORITY_TEXT_KEYS: &[&str] = &["text", "content", "message", "request", "value", "body"];

const NON_CONTENT_KEYS: &[&str] = &[
    "id",
    "type",
    "role",
    "name",
    "tool",
    "mode",
    "ts",
    "timestamp",
    "created_at",
    "partial",
    "status",
    "index",
];

/// Pulls human text out of an arbitrarily nested JSON payload.
///
/// Priority keys win; otherwise remaining content keys are visited in sorted
/// order so the result is stable across serializers.
#[must_use]
pub fn extract_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => non_empty_text(Cow::Borrowed(text)),
        Value::Array(items) => {
            let fragments: Vec<String> = items.iter().filter_map(extract_text).collect();
            join_fragments(&fragments)
        }
        Value::Object(map) => {
            for key in PRIORITY_TEXT_KEYS {
                if let Some(value) = map.get(*key)
                    && let Some(text) = extract_text(value)
                {
                    return Some(text);
                }
            }

            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_unstable();

            let fragments: Vec<String> = keys
                .into_iter()
                .filter(|key| !PRIORITY_TEXT_KEYS.contains(key) && !NON_CONTENT_KEYS.contains(key))
                .filter_map(|key| map.get(key))
                .filter_map(extract_text)
                .collect();

            join_fragments(&fragments)
        }
        Value::Null | Value::Bool(_) | Value::Number(_) => None,
    }
}

/// Trimmed, non-empty string field.
#[must_use]
pub fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    let text = object.get(key)?.as_str()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Some log writers store structured payloads as a JSON document inside a
/// string field. Returns the decoded object when that is the case.
#[must_use]
pub fn embedded_json_object(raw: &str) -> Option<Map<String, Value>> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn non_empty_text(value: Cow<'_, str>) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn join_fragments(fragments: &[String]) -> Option<String> {
    if fragments.is_empty() {
        return None;
    }

    Some(fragments.join("\n"))
}
