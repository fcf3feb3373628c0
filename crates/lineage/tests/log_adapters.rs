use lineage::adapters::api_history::parse_api_history;
use lineage::adapters::ui_messages::parse_ui_messages;
use lineage::adapters::{LogFormat, parse_log};
use lineage::error::ParseError;
use lineage::models::{MessageOrigin, RawMessage, SignalKind};

#[test]
fn ui_messages_fixture_maps_every_known_row_kind() {
    let parsed = parse_ui_messages(
        include_str!("../../../fixtures/ui_messages/parent_with_spawns.json"),
        "parent_with_spawns.json",
    )
    .expect("ui fixture should parse");

    assert_eq!(parsed.messages.len(), 10);
    assert_eq!(
        parsed.messages[0],
        RawMessage::user_text(Some(1_700_000_000_000), "Build the release pipeline")
    );
    match &parsed.messages[1] {
        RawMessage::RequestStart {
            timestamp_ms,
            request,
        } => {
            assert_eq!(*timestamp_ms, Some(1_700_000_001_000));
            assert!(request.starts_with("<task>"), "unexpected request: {request}");
        }
        other => panic!("expected request start, got {other:?}"),
    }
    assert!(matches!(
        &parsed.messages[2],
        RawMessage::FreeText {
            origin: MessageOrigin::Assistant,
            ..
        }
    ));
    assert_eq!(
        parsed.messages[3],
        RawMessage::ToolInvocation {
            timestamp_ms: Some(1_700_000_003_000),
            tool: "newTask".to_string(),
            message: Some("Implement feature X".to_string()),
            mode: Some("code".to_string()),
        }
    );
    assert_eq!(
        parsed
            .messages
            .iter()
            .filter(|message| message.is_tool_invocation())
            .count(),
        4
    );
    assert_eq!(
        parsed.messages[8],
        RawMessage::signal(Some(1_700_000_008_000), SignalKind::Completion)
    );
    assert!(matches!(
        &parsed.messages[9],
        RawMessage::Other {
            timestamp_ms: None,
            ..
        }
    ));
    assert_eq!(parsed.warnings.len(), 2, "warnings: {:?}", parsed.warnings);
}

#[test]
fn ui_messages_error_rows_become_error_signals() {
    let input = r#"[
        {"ts": 1, "type": "say", "say": "error", "text": "boom"},
        {"ts": 2, "type": "ask", "ask": "mistake_limit_reached", "text": ""},
        {"ts": 3, "type": "ask", "ask": "resume_completed_task", "text": ""}
    ]"#;
    let parsed = parse_ui_messages(input, "inline").expect("inline log should parse");

    let signals: Vec<SignalKind> = parsed
        .messages
        .iter()
        .filter_map(|message| match message {
            RawMessage::Signal { signal, .. } => Some(*signal),
            _ => None,
        })
        .collect();
    assert_eq!(
        signals,
        vec![
            SignalKind::Error,
            SignalKind::Error,
            SignalKind::TerminalResult
        ]
    );
}

#[test]
fn ui_messages_tool_row_without_json_is_kept_as_other() {
    let input = r#"[{"ts": 1, "type": "ask", "ask": "tool", "text": "not json"}]"#;
    let parsed = parse_ui_messages(input, "inline").expect("inline log should parse");

    assert!(matches!(parsed.messages[0], RawMessage::Other { .. }));
    assert_eq!(parsed.warnings.len(), 1);
}

#[test]
fn ui_messages_rejects_invalid_json_and_non_array_roots() {
    let error = parse_ui_messages("[{\"ts\": 1,", "broken.json").expect_err("corrupt log must fail");
    assert!(matches!(error, ParseError::InvalidJson { .. }), "got {error:?}");

    let error = parse_ui_messages("{\"messages\": []}", "object.json")
        .expect_err("object root must fail");
    assert!(
        matches!(error, ParseError::UnexpectedShape { .. }),
        "got {error:?}"
    );
}

#[test]
fn api_history_fixture_maps_requests_spawns_and_completion() {
    let parsed = parse_api_history(
        include_str!("../../../fixtures/api_history/child_transcript.json"),
        "child_transcript.json",
    )
    .expect("api fixture should parse");

    assert_eq!(parsed.messages.len(), 8);
    assert!(matches!(
        &parsed.messages[0],
        RawMessage::RequestStart { request, .. } if request.contains("<task>")
    ));

    let spawns: Vec<(&str, Option<&str>)> = parsed
        .messages
        .iter()
        .filter_map(|message| match message {
            RawMessage::ToolInvocation { tool, message, .. } => {
                Some((tool.as_str(), message.as_deref()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        spawns,
        vec![
            ("new_task", Some("Document feature X")),
            ("new_task", Some("Write integration tests for feature X")),
            ("attempt_completion", None),
        ]
    );
    assert!(parsed.messages.iter().any(|message| matches!(
        message,
        RawMessage::Signal {
            signal: SignalKind::TerminalResult,
            ..
        }
    )));
    assert_eq!(parsed.warnings.len(), 1, "warnings: {:?}", parsed.warnings);
}

#[test]
fn api_history_user_text_without_task_block_is_free_text() {
    let input = r#"[
        {"role": "user", "content": "please fix the login bug"},
        {"role": "assistant", "content": "On it. <attempt_completion>done</attempt_completion>"}
    ]"#;
    let parsed = parse_api_history(input, "inline").expect("inline history should parse");

    assert_eq!(
        parsed.messages[0],
        RawMessage::user_text(None, "please fix the login bug")
    );
    assert_eq!(
        parsed.messages[1],
        RawMessage::signal(None, SignalKind::Completion)
    );
}

#[test]
fn parse_log_dispatches_on_format() {
    let ui = parse_log(LogFormat::UiMessages, "[]", "empty").expect("empty ui log should parse");
    let api = parse_log(LogFormat::ApiHistory, "[]", "empty").expect("empty api log should parse");

    assert!(ui.messages.is_empty());
    assert!(api.messages.is_empty());
    assert_eq!(LogFormat::UiMessages.file_name(), "ui_messages.json");
    assert_eq!(
        LogFormat::ApiHistory.file_name(),
        "api_conversation_history.json"
    );
}
