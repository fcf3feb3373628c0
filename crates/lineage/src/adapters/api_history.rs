use std::path::Path;

use serde_json::{Map, Value};

use super::ParsedLog;
use crate::error::ParseError;
use crate::models::{MessageOrigin, RawMessage, SignalKind};
use crate::utils::content;
use crate::utils::text::{extract_all_delimited, extract_delimited};
use crate::utils::time::timestamp_from_json;

pub const FILE_NAME: &str = "api_conversation_history.json";

const TASK_TAG: &str = "task";
const SPAWN_XML_TAG: &str = "new_task";
const COMPLETION_XML_TAG: &str = "attempt_completion";
const COMPLETION_TOOL: &str = "attempt_completion";

pub fn parse_api_history_file(path: &Path) -> Result<ParsedLog, ParseError> {
    let input = std::fs::read_to_string(path).map_err(|error| ParseError::Unreadable {
        path: path.to_path_buf(),
        reason: error.to_string(),
    })?;
    parse_api_history(&input, path.to_string_lossy().as_ref())
}

/// Parses a model API transcript: a JSON array of `{role, content, ts?}`
/// where `content` is a string or a list of typed blocks.
///
/// Spawns show up either as `tool_use` blocks or, for older transcripts, as
/// `<new_task>` XML inside assistant text. Both are reported.
pub fn parse_api_history(input: &str, source_name: &str) -> Result<ParsedLog, ParseError> {
    let root = serde_json::from_str::<Value>(input).map_err(|error| ParseError::InvalidJson {
        source_name: source_name.to_string(),
        reason: error.to_string(),
    })?;
    let Value::Array(entries) = root else {
        return Err(ParseError::UnexpectedShape {
            source_name: source_name.to_string(),
            reason: "root must be an array of API messages".to_string(),
        });
    };

    let mut messages = Vec::with_capacity(entries.len());
    let mut warnings = Vec::new();
    let mut seen_request = false;

    for (index, entry) in entries.iter().enumerate() {
        let Some(object) = entry.as_object() else {
            warnings.push(format!("entry {index}: API message must be an object"));
            continue;
        };
        let timestamp_ms = match object.get("ts") {
            Some(raw) => match timestamp_from_json(raw) {
                Ok(timestamp_ms) => Some(timestamp_ms),
                Err(error) => {
                    warnings.push(format!("entry {index}: invalid `ts` value ({error})"));
                    None
                }
            },
            None => None,
        };
        let role = content::string_field(object, "role").unwrap_or_default();
        let blocks = content_blocks(object.get("content"));

        match role.as_str() {
            "user" => {
                let text = joined_text(&blocks);
                if text.is_empty() {
                    messages.push(RawMessage::Other {
                        timestamp_ms,
                        label: "user:tool_result".to_string(),
                    });
                } else if !seen_request && extract_delimited(&text, TASK_TAG).is_some() {
                    seen_request = true;
                    messages.push(RawMessage::request(timestamp_ms, text));
                } else {
                    messages.push(RawMessage::user_text(timestamp_ms, text));
                }
            }
            "assistant" => {
                push_assistant_messages(&blocks, timestamp_ms, index, &mut messages, &mut warnings);
            }
            "system" => {
                let text = joined_text(&blocks);
                messages.push(RawMessage::FreeText {
                    timestamp_ms,
                    origin: MessageOrigin::System,
                    text,
                });
            }
            other => {
                warnings.push(format!(
                    "entry {index}: unknown `role` value `{other}`; kept as other"
                ));
                messages.push(RawMessage::Other {
                    timestamp_ms,
                    label: format!("role:{other}"),
                });
            }
        }
    }

    Ok(ParsedLog { messages, warnings })
}

fn push_assistant_messages(
    blocks: &[Value],
    timestamp_ms: Option<u64>,
    index: usize,
    messages: &mut Vec<RawMessage>,
    warnings: &mut Vec<String>,
) {
    for block in blocks {
        let Some(block) = block.as_object() else {
            continue;
        };
        match content::string_field(block, "type").as_deref() {
            Some("text") => {
                let text = block
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim();
                if text.is_empty() {
                    continue;
                }
                for spawn in extract_all_delimited(text, SPAWN_XML_TAG) {
                    messages.push(RawMessage::ToolInvocation {
                        timestamp_ms,
                        tool: SPAWN_XML_TAG.to_string(),
                        message: extract_delimited(spawn, "message").map(str::to_string),
                        mode: extract_delimited(spawn, "mode").map(str::to_string),
                    });
                }
                if text.contains(&format!("<{COMPLETION_XML_TAG}>")) {
                    messages.push(RawMessage::signal(timestamp_ms, SignalKind::Completion));
                }
                messages.push(RawMessage::FreeText {
                    timestamp_ms,
                    origin: MessageOrigin::Assistant,
                    text: text.to_string(),
                });
            }
            Some("tool_use") => {
                let Some(name) = content::string_field(block, "name") else {
                    warnings.push(format!("entry {index}: tool_use block without `name`"));
                    continue;
                };
                let input = block.get("input").and_then(Value::as_object);
                messages.push(RawMessage::ToolInvocation {
                    timestamp_ms,
                    message: input.and_then(|input| content::string_field(input, "message")),
                    mode: input.and_then(|input| content::string_field(input, "mode")),
                    tool: name.clone(),
                });
                if name == COMPLETION_TOOL {
                    messages.push(RawMessage::signal(
                        timestamp_ms,
                        SignalKind::TerminalResult,
                    ));
                }
            }
            _ => {}
        }
    }
}

fn content_blocks(content: Option<&Value>) -> Vec<Value> {
    match content {
        Some(Value::String(text)) => {
            let mut block = Map::new();
            block.insert("type".to_string(), Value::String("text".to_string()));
            block.insert("text".to_string(), Value::String(text.clone()));
            vec![Value::Object(block)]
        }
        Some(Value::Array(blocks)) => blocks.clone(),
        _ => Vec::new(),
    }
}

fn joined_text(blocks: &[Value]) -> String {
    blocks
        .iter()
        .filter_map(Value::as_object)
        .filter(|block| content::string_field(block, "type").as_deref() == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
