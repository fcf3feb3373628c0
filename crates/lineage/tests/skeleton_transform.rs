use lineage::adapters::api_history::parse_api_history;
use lineage::adapters::ui_messages::parse_ui_messages;
use lineage::error::SkeletonValidationError;
use lineage::models::{
    ConversationSkeleton, RawMessage, SignalKind, SkeletonMetadata, TimestampQuality,
};
use lineage::skeleton::{
    InstructionSource, TransformOptions, transform, transform_task, validate_skeleton,
};
use lineage::storage::RawTask;
use lineage::utils::time::FixedClock;

const NOW: u64 = 1_800_000_000_000;

fn options() -> TransformOptions {
    TransformOptions::default()
}

#[test]
fn ui_fixture_builds_parent_skeleton() {
    let parsed = parse_ui_messages(
        include_str!("../../../fixtures/ui_messages/parent_with_spawns.json"),
        "parent_with_spawns.json",
    )
    .expect("ui fixture should parse");
    let clock = FixedClock::new(NOW);

    let output = transform(&parsed.messages, "parent", Some("/work/app"), &options(), &clock)
        .expect("non-strict transform never fails");
    let skeleton = &output.skeleton;

    assert_eq!(skeleton.task_id, "parent");
    assert_eq!(skeleton.parent_task_id, None);
    assert_eq!(skeleton.opening_instruction, "build the release pipeline");
    assert_eq!(
        skeleton.child_spawn_prefixes,
        vec!["implement feature x".to_string(), "run the tests".to_string()]
    );
    assert!(skeleton.is_completed);
    assert_eq!(skeleton.metadata.message_count, 10);
    assert_eq!(skeleton.metadata.action_count, 4);
    assert_eq!(skeleton.metadata.created_at_unix_ms, 1_700_000_000_000);
    assert_eq!(skeleton.metadata.last_activity_unix_ms, 1_700_000_008_000);
    assert_eq!(skeleton.metadata.timestamp_quality, TimestampQuality::Exact);
    assert_eq!(skeleton.metadata.workspace.as_deref(), Some("/work/app"));

    assert_eq!(output.metadata.instruction_source, InstructionSource::RequestStart);
    assert_eq!(output.metadata.spawn_invocations, 3);
    assert_eq!(output.metadata.duplicate_prefixes_dropped, 1);
    assert_eq!(output.metadata.first_signal, Some(SignalKind::Completion));
}

#[test]
fn api_fixture_builds_child_skeleton() {
    let parsed = parse_api_history(
        include_str!("../../../fixtures/api_history/child_transcript.json"),
        "child_transcript.json",
    )
    .expect("api fixture should parse");
    let clock = FixedClock::new(NOW);

    let output = transform(&parsed.messages, "child", None, &options(), &clock)
        .expect("non-strict transform never fails");

    assert_eq!(output.skeleton.opening_instruction, "implement feature x");
    assert_eq!(
        output.skeleton.child_spawn_prefixes,
        vec![
            "document feature x".to_string(),
            "write integration tests for feature x".to_string()
        ]
    );
    assert!(output.skeleton.is_completed);
    assert_eq!(output.skeleton.metadata.action_count, 3);
}

#[test]
fn falls_back_to_first_user_message_when_no_request_start() {
    let messages = vec![
        RawMessage::FreeText {
            timestamp_ms: Some(10),
            origin: lineage::models::MessageOrigin::Assistant,
            text: "hello".to_string(),
        },
        RawMessage::user_text(Some(20), "  Refactor THE parser "),
        RawMessage::user_text(Some(30), "second message"),
    ];
    let clock = FixedClock::new(NOW);

    let output = transform(&messages, "task", None, &options(), &clock)
        .expect("non-strict transform never fails");

    assert_eq!(output.skeleton.opening_instruction, "refactor the parser");
    assert_eq!(
        output.metadata.instruction_source,
        InstructionSource::FirstUserMessage
    );
    assert!(!output.skeleton.is_completed);
}

#[test]
fn request_without_task_block_falls_through_to_user_text() {
    let messages = vec![
        RawMessage::request(Some(1), "no delimited block here"),
        RawMessage::user_text(Some(2), "Write docs"),
    ];
    let clock = FixedClock::new(NOW);

    let output = transform(&messages, "task", None, &options(), &clock)
        .expect("non-strict transform never fails");

    assert_eq!(output.skeleton.opening_instruction, "write docs");
}

#[test]
fn empty_sequence_degrades_to_empty_skeleton_with_clock_fallback() {
    let clock = FixedClock::new(NOW);

    let output =
        transform(&[], "empty", None, &options(), &clock).expect("non-strict transform never fails");

    assert_eq!(output.skeleton.opening_instruction, "");
    assert!(output.skeleton.child_spawn_prefixes.is_empty());
    assert!(!output.skeleton.is_completed);
    assert_eq!(output.skeleton.metadata.message_count, 0);
    assert_eq!(output.skeleton.metadata.created_at_unix_ms, NOW);
    assert_eq!(output.skeleton.metadata.last_activity_unix_ms, NOW);
    assert_eq!(
        output.skeleton.metadata.timestamp_quality,
        TimestampQuality::Fallback
    );
    assert_eq!(output.metadata.instruction_source, InstructionSource::Missing);
    assert!(!output.metadata.warnings.is_empty());
}

#[test]
fn completion_is_a_presence_check_over_the_whole_sequence() {
    let messages = vec![
        RawMessage::request(Some(1), "<task>fix it</task>"),
        RawMessage::signal(Some(2), SignalKind::Error),
        RawMessage::user_text(Some(3), "try again"),
    ];
    let clock = FixedClock::new(NOW);

    let output = transform(&messages, "task", None, &options(), &clock)
        .expect("non-strict transform never fails");

    assert!(output.skeleton.is_completed);
    assert_eq!(output.metadata.first_signal, Some(SignalKind::Error));
}

#[test]
fn spawn_prefixes_are_deduplicated_in_first_seen_order() {
    let messages = vec![
        RawMessage::spawn(Some(1), "newTask", "B task"),
        RawMessage::spawn(Some(2), "new_task", "A task"),
        RawMessage::spawn(Some(3), "newTask", "b   TASK"),
        RawMessage::spawn(Some(4), "readFile", "not a spawn"),
        RawMessage::ToolInvocation {
            timestamp_ms: Some(5),
            tool: "newTask".to_string(),
            message: None,
            mode: None,
        },
    ];
    let clock = FixedClock::new(NOW);

    let output = transform(&messages, "task", None, &options(), &clock)
        .expect("non-strict transform never fails");

    assert_eq!(
        output.skeleton.child_spawn_prefixes,
        vec!["b task".to_string(), "a task".to_string()]
    );
    assert_eq!(output.metadata.spawn_invocations, 4);
    assert_eq!(output.metadata.duplicate_prefixes_dropped, 1);
    assert_eq!(output.metadata.empty_spawn_messages, 1);
    assert_eq!(output.skeleton.metadata.action_count, 5);
}

#[test]
fn prefixes_are_capped_at_max_len() {
    let long = "x".repeat(500);
    let messages = vec![
        RawMessage::request(Some(1), format!("<task>{long}</task>")),
        RawMessage::spawn(Some(2), "newTask", long.clone()),
    ];
    let clock = FixedClock::new(NOW);
    let strict = TransformOptions {
        max_len: 32,
        strict: true,
    };

    let output = transform(&messages, "task", None, &strict, &clock)
        .expect("capped skeleton passes strict validation");

    assert_eq!(output.skeleton.opening_instruction.chars().count(), 32);
    assert_eq!(output.skeleton.child_spawn_prefixes[0].chars().count(), 32);
}

#[test]
fn strict_mode_rejects_empty_task_id() {
    let clock = FixedClock::new(NOW);
    let strict = TransformOptions {
        strict: true,
        ..TransformOptions::default()
    };

    let error = transform(&[], "  ", None, &strict, &clock).expect_err("empty id must fail");

    assert_eq!(error, SkeletonValidationError::EmptyTaskId);
}

#[test]
fn validate_skeleton_flags_over_length_and_duplicate_prefixes() {
    let mut skeleton = ConversationSkeleton {
        task_id: "task".to_string(),
        parent_task_id: None,
        opening_instruction: "short".to_string(),
        child_spawn_prefixes: vec!["abcdef".to_string()],
        is_completed: false,
        metadata: SkeletonMetadata {
            created_at_unix_ms: 1,
            last_activity_unix_ms: 1,
            timestamp_quality: TimestampQuality::Exact,
            message_count: 0,
            action_count: 0,
            workspace: None,
        },
    };

    assert!(matches!(
        validate_skeleton(&skeleton, 4),
        Err(SkeletonValidationError::InstructionTooLong { length: 5, .. })
    ));
    assert!(matches!(
        validate_skeleton(&skeleton, 5),
        Err(SkeletonValidationError::PrefixTooLong { index: 0, length: 6, .. })
    ));

    skeleton.child_spawn_prefixes = vec!["same".to_string(), "same".to_string()];
    assert!(matches!(
        validate_skeleton(&skeleton, 192),
        Err(SkeletonValidationError::DuplicatePrefix { .. })
    ));
}

#[test]
fn transform_task_carries_storage_warnings_first() {
    let task = RawTask {
        task_id: "task".to_string(),
        messages: vec![RawMessage::request(Some(1), "<task>go</task>")],
        workspace: Some("/repo".to_string()),
        declared_parent: None,
        warnings: vec!["storage note".to_string()],
    };
    let clock = FixedClock::new(NOW);

    let output = transform_task(&task, &options(), &clock).expect("transform should succeed");

    assert_eq!(output.metadata.warnings.first().map(String::as_str), Some("storage note"));
    assert_eq!(output.skeleton.metadata.workspace.as_deref(), Some("/repo"));
}
