use std::path::Path;

use serde_json::{Map, Value};

use super::ParsedLog;
use crate::error::ParseError;
use crate::models::{MessageOrigin, RawMessage, SignalKind};
use crate::utils::content;
use crate::utils::time::timestamp_from_json;

pub const FILE_NAME: &str = "ui_messages.json";

pub fn parse_ui_messages_file(path: &Path) -> Result<ParsedLog, ParseError> {
    let input = std::fs::read_to_string(path).map_err(|error| ParseError::Unreadable {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })?;
    parse_ui_messages(&input, path.to_string_lossy().as_ref())
}

/// Parses a UI message log: a JSON array of `{ts, type, say|ask, text}`.
///
/// The array itself must be valid; individual malformed entries degrade to
/// warnings so one bad row never costs the whole task.
pub fn parse_ui_messages(input: &str, source_name: &str) -> Result<ParsedLog, ParseError> {
    let root = serde_json::from_str::<Value>(input).map_err(|error| ParseError::InvalidJson {
        source_name: source_name.to_string(),
        reason: error.to_string(),
    })?;
    let Value::Array(entries) = root else {
        return Err(ParseError::UnexpectedShape {
            source_name: source_name.to_string(),
            reason: "root must be an array of messages".to_string(),
        });
    };

    let mut messages = Vec::with_capacity(entries.len());
    let mut warnings = Vec::new();
    let mut seen_request = false;

    for (index, entry) in entries.iter().enumerate() {
        let Some(object) = entry.as_object() else {
            warnings.push(format!("entry {index}: message must be an object"));
            continue;
        };

        let timestamp_ms = map_timestamp(object, index, &mut warnings);
        let message_type = content::string_field(object, "type").unwrap_or_default();
        let kind = match message_type.as_str() {
            "say" | "ask" => content::string_field(object, &message_type).unwrap_or_default(),
            _ => {
                warnings.push(format!(
                    "entry {index}: unknown message `type` `{message_type}`; kept as other"
                ));
                messages.push(RawMessage::Other {
                    timestamp_ms,
                    label: format!("unknown:{message_type}"),
                });
                continue;
            }
        };
        let text = object
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim();

        let message = classify(
            &message_type,
            &kind,
            text,
            timestamp_ms,
            seen_request,
            index,
            &mut warnings,
        );
        if matches!(message, RawMessage::RequestStart { .. }) {
            seen_request = true;
        }
        messages.push(message);
    }

    Ok(ParsedLog { messages, warnings })
}

fn classify(
    message_type: &str,
    kind: &str,
    text: &str,
    timestamp_ms: Option<u64>,
    seen_request: bool,
    index: usize,
    warnings: &mut Vec<String>,
) -> RawMessage {
    match (message_type, kind) {
        ("say", "api_req_started") => {
            let request = content::embedded_json_object(text)
                .and_then(|payload| content::string_field(&payload, "request"))
                .unwrap_or_else(|| text.to_string());
            RawMessage::RequestStart {
                timestamp_ms,
                request,
            }
        }
        ("say" | "ask", "tool") => match content::embedded_json_object(text) {
            Some(payload) => tool_invocation(&payload, timestamp_ms, index, warnings),
            None => {
                warnings.push(format!(
                    "entry {index}: tool message without a JSON payload; kept as other"
                ));
                RawMessage::Other {
                    timestamp_ms,
                    label: format!("{message_type}:tool"),
                }
            }
        },
        ("say" | "ask", "completion_result") => {
            RawMessage::signal(timestamp_ms, SignalKind::Completion)
        }
        ("say", "error") | ("ask", "api_req_failed" | "mistake_limit_reached") => {
            RawMessage::signal(timestamp_ms, SignalKind::Error)
        }
        ("ask", "resume_completed_task") => {
            RawMessage::signal(timestamp_ms, SignalKind::TerminalResult)
        }
        ("say", "user_feedback") if !text.is_empty() => RawMessage::FreeText {
            timestamp_ms,
            origin: MessageOrigin::User,
            text: text.to_string(),
        },
        // The UI echoes the user's task as a plain text row before the first
        // request goes out.
        ("say", "text") if !text.is_empty() => RawMessage::FreeText {
            timestamp_ms,
            origin: if seen_request {
                MessageOrigin::Assistant
            } else {
                MessageOrigin::User
            },
            text: text.to_string(),
        },
        ("ask", "followup") if !text.is_empty() => RawMessage::FreeText {
            timestamp_ms,
            origin: MessageOrigin::Assistant,
            text: text.to_string(),
        },
        _ => RawMessage::Other {
            timestamp_ms,
            label: format!("{message_type}:{kind}"),
        },
    }
}

fn tool_invocation(
    payload: &Map<String, Value>,
    timestamp_ms: Option<u64>,
    index: usize,
    warnings: &mut Vec<String>,
) -> RawMessage {
    let tool = content::string_field(payload, "tool").unwrap_or_else(|| {
        warnings.push(format!("entry {index}: tool payload missing `tool` name"));
        "unknown".to_string()
    });
    let message = content::string_field(payload, "message")
        .or_else(|| payload.get("content").and_then(content::extract_text));
    RawMessage::ToolInvocation {
        timestamp_ms,
        tool,
        message,
        mode: content::string_field(payload, "mode"),
    }
}

fn map_timestamp(
    object: &Map<String, Value>,
    index: usize,
    warnings: &mut Vec<String>,
) -> Option<u64> {
    let raw = object.get("ts")?;
    match timestamp_from_json(raw) {
        Ok(timestamp_ms) => Some(timestamp_ms),
        Err(error) => {
            warnings.push(format!("entry {index}: invalid `ts` value ({error})"));
            None
        }
    }
}
