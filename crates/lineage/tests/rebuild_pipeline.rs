use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use lineage::adapters::LogFormat;
use lineage::error::{ParseError, RebuildError, StorageError};
use lineage::models::{RawMessage, ResolutionMethod};
use lineage::rebuild::artifacts::{
    build_artifact_layout, read_report_artifact, write_generation_artifacts,
};
use lineage::rebuild::{CancellationToken, RebuildPlan, rebuild};
use lineage::storage::{FileTaskStorage, InMemoryStorage, RawTask, TaskListing, TaskStorage};
use lineage::utils::time::FixedClock;
use serde_json::json;

const NOW: u64 = 1_800_000_000_000;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time should be after unix epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("{prefix}-{nanos}"))
}

fn write_file(path: &Path, content: &str) {
    let parent = path.parent().expect("test file path should have parent");
    std::fs::create_dir_all(parent).expect("test parent directory should be creatable");
    std::fs::write(path, content).expect("test fixture file should be written");
}

fn ui_log(instruction: &str, spawns: &[&str], ts: u64) -> String {
    let mut rows = vec![json!({
        "ts": ts,
        "type": "say",
        "say": "api_req_started",
        "text": json!({"request": format!("<task>{instruction}</task>")}).to_string(),
    })];
    for (offset, spawn) in spawns.iter().enumerate() {
        rows.push(json!({
            "ts": ts + 1 + offset as u64,
            "type": "ask",
            "ask": "tool",
            "text": json!({"tool": "newTask", "mode": "code", "message": spawn}).to_string(),
        }));
    }
    serde_json::to_string(&rows).expect("ui log should serialize")
}

fn plan(workers: usize) -> RebuildPlan {
    RebuildPlan {
        workers,
        read_timeout: Some(Duration::from_secs(5)),
        ..RebuildPlan::default()
    }
}

fn seed_hundred_tasks(root: &Path) {
    write_file(
        &root.join("task-000/ui_messages.json"),
        &ui_log(
            "coordinate the batch",
            &(1..50).map(|_| "unused").collect::<Vec<_>>(),
            1_000,
        ),
    );
    for index in 1..100 {
        let spawns = [format!("subtask {}", index + 1)];
        let spawn_refs: Vec<&str> = spawns.iter().map(String::as_str).collect();
        write_file(
            &root.join(format!("task-{index:03}/ui_messages.json")),
            &ui_log(&format!("subtask {index}"), &spawn_refs, 1_000 + index as u64),
        );
    }
    write_file(
        &root.join("task-042/ui_messages.json"),
        "[{\"ts\": 1, \"type\": \"say\",",
    );
}

#[test]
fn hundred_task_batch_with_one_corrupt_log_still_completes() {
    let root = unique_temp_dir("lineage-rebuild-hundred");
    seed_hundred_tasks(&root);
    let storage: Arc<dyn TaskStorage> = Arc::new(FileTaskStorage::new(&root));
    let clock = FixedClock::new(NOW);

    let output = rebuild(&storage, &plan(8), &clock, &CancellationToken::new())
        .expect("rebuild should complete");
    let report = &output.generation.report;

    assert_eq!(report.processed_count, 100);
    assert_eq!(report.parsed_count, 99);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].task_id, "task-042");
    assert!(
        report.errors[0].reason.contains("invalid JSON"),
        "unexpected reason: {}",
        report.errors[0].reason
    );
    assert_eq!(output.generation.skeletons.len(), 99);
    assert_eq!(output.listing.len(), 100);

    // task-042 is gone; task-043 falls back to the shorter "subtask 4" prefix.
    let parent_of = |task_id: &str| {
        output
            .generation
            .skeletons
            .iter()
            .find(|skeleton| skeleton.task_id == task_id)
            .and_then(|skeleton| skeleton.parent_task_id.clone())
    };
    assert_eq!(parent_of("task-002").as_deref(), Some("task-001"));
    assert_eq!(parent_of("task-043").as_deref(), Some("task-003"));
    assert_eq!(parent_of("task-044").as_deref(), Some("task-043"));
    assert_eq!(report.method_count(ResolutionMethod::Exact), 96);
    assert_eq!(report.method_count(ResolutionMethod::Approximate), 1);
    assert_eq!(report.unresolved_count, 2);
    assert_eq!(
        report.method_count(ResolutionMethod::Exact)
            + report.method_count(ResolutionMethod::Approximate)
            + report.method_count(ResolutionMethod::Declared)
            + report.method_count(ResolutionMethod::Unresolved),
        report.parsed_count
    );
}

#[test]
fn worker_count_does_not_change_the_outcome() {
    let root = unique_temp_dir("lineage-rebuild-workers");
    seed_hundred_tasks(&root);
    let storage: Arc<dyn TaskStorage> = Arc::new(FileTaskStorage::new(&root));
    let clock = FixedClock::new(NOW);

    let serial = rebuild(&storage, &plan(1), &clock, &CancellationToken::new())
        .expect("serial rebuild should complete");
    let parallel = rebuild(&storage, &plan(16), &clock, &CancellationToken::new())
        .expect("parallel rebuild should complete");

    assert_eq!(serial.generation, parallel.generation);
}

#[test]
fn declared_parent_and_workspace_come_from_task_metadata() {
    let root = unique_temp_dir("lineage-rebuild-metadata");
    write_file(
        &root.join("alpha/ui_messages.json"),
        &ui_log("lead the work", &[], 10),
    );
    write_file(
        &root.join("beta/ui_messages.json"),
        &ui_log("something unrelated", &[], 20),
    );
    write_file(
        &root.join("beta/task_metadata.json"),
        r#"{"workspace": "/work/beta", "parentTaskId": "alpha"}"#,
    );
    let storage: Arc<dyn TaskStorage> = Arc::new(FileTaskStorage::new(&root));
    let clock = FixedClock::new(NOW);

    let output = rebuild(&storage, &plan(2), &clock, &CancellationToken::new())
        .expect("rebuild should complete");
    let beta = output
        .generation
        .skeletons
        .iter()
        .find(|skeleton| skeleton.task_id == "beta")
        .expect("beta should be present");

    assert_eq!(beta.parent_task_id.as_deref(), Some("alpha"));
    assert_eq!(beta.metadata.workspace.as_deref(), Some("/work/beta"));
    assert_eq!(
        output
            .generation
            .report
            .method_count(ResolutionMethod::Declared),
        1
    );
}

#[test]
fn api_history_is_used_when_ui_log_is_missing() {
    let root = unique_temp_dir("lineage-rebuild-fallback");
    write_file(
        &root.join("parent/ui_messages.json"),
        include_str!("../../../fixtures/ui_messages/parent_with_spawns.json"),
    );
    write_file(
        &root.join("child/api_conversation_history.json"),
        include_str!("../../../fixtures/api_history/child_transcript.json"),
    );
    let storage: Arc<dyn TaskStorage> = Arc::new(FileTaskStorage::new(&root));
    let clock = FixedClock::new(NOW);

    let output = rebuild(&storage, &plan(2), &clock, &CancellationToken::new())
        .expect("rebuild should complete");
    let child = output
        .generation
        .skeletons
        .iter()
        .find(|skeleton| skeleton.task_id == "child")
        .expect("child should be present");

    assert_eq!(child.parent_task_id.as_deref(), Some("parent"));
    assert!(
        output
            .warnings
            .iter()
            .any(|warning| warning.starts_with("child: ") && warning.contains("fell back")),
        "warnings: {:?}",
        output.warnings
    );
}

#[test]
fn empty_listing_is_fatal() {
    let storage: Arc<dyn TaskStorage> = Arc::new(InMemoryStorage::new());
    let clock = FixedClock::new(NOW);

    let error = rebuild(&storage, &plan(2), &clock, &CancellationToken::new())
        .expect_err("empty batch must fail");

    assert_eq!(error, RebuildError::EmptyBatch);
}

#[test]
fn unreachable_storage_root_is_fatal() {
    let root = unique_temp_dir("lineage-rebuild-missing-root");
    let storage: Arc<dyn TaskStorage> = Arc::new(FileTaskStorage::new(&root));
    let clock = FixedClock::new(NOW);

    let error = rebuild(&storage, &plan(2), &clock, &CancellationToken::new())
        .expect_err("missing root must fail");

    assert!(
        matches!(error, RebuildError::Storage(StorageError::Unreachable { .. })),
        "got {error:?}"
    );
}

#[test]
fn batch_where_nothing_parses_is_fatal() {
    let memory = InMemoryStorage::new();
    memory.insert_log("a", LogFormat::UiMessages, "not json");
    memory.insert_log("b", LogFormat::ApiHistory, "{}");
    let storage: Arc<dyn TaskStorage> = Arc::new(memory);
    let clock = FixedClock::new(NOW);

    let error = rebuild(&storage, &plan(2), &clock, &CancellationToken::new())
        .expect_err("nothing parsed must fail");

    assert_eq!(error, RebuildError::NothingParsed { processed: 2 });
}

#[test]
fn strict_validation_failures_become_task_errors() {
    let memory = InMemoryStorage::new();
    memory.insert_messages("  ", vec![RawMessage::user_text(Some(1), "blank id")]);
    memory.insert_messages("ok", vec![RawMessage::user_text(Some(2), "fine")]);
    let storage: Arc<dyn TaskStorage> = Arc::new(memory);
    let clock = FixedClock::new(NOW);
    let mut strict = plan(1);
    strict.transform.strict = true;

    let output = rebuild(&storage, &strict, &clock, &CancellationToken::new())
        .expect("rebuild should complete");

    assert_eq!(output.generation.report.parsed_count, 1);
    assert_eq!(output.generation.report.errors.len(), 1);
    assert!(output.generation.report.errors[0].reason.contains("empty task id"));
}

/// Storage whose reads take a fixed time, optionally cancelling on first read.
struct SlowStorage {
    inner: InMemoryStorage,
    slow_task: &'static str,
    delay: Duration,
    cancel_on_read: Option<CancellationToken>,
}

impl TaskStorage for SlowStorage {
    fn list_tasks(&self) -> Result<Vec<TaskListing>, StorageError> {
        self.inner.list_tasks()
    }

    fn load_task(&self, task_id: &str) -> Result<RawTask, ParseError> {
        if let Some(token) = &self.cancel_on_read {
            token.cancel();
        }
        if task_id == self.slow_task {
            std::thread::sleep(self.delay);
        }
        self.inner.load_task(task_id)
    }
}

fn seeded_memory(count: usize) -> InMemoryStorage {
    let memory = InMemoryStorage::new();
    for index in 0..count {
        memory.insert_messages(
            &format!("task-{index:02}"),
            vec![RawMessage::user_text(Some(index as u64), format!("job {index}"))],
        );
    }
    memory
}

#[test]
fn slow_read_times_out_as_a_parse_error() {
    let storage: Arc<dyn TaskStorage> = Arc::new(SlowStorage {
        inner: seeded_memory(3),
        slow_task: "task-01",
        delay: Duration::from_millis(750),
        cancel_on_read: None,
    });
    let clock = FixedClock::new(NOW);
    let mut timed = plan(3);
    timed.read_timeout = Some(Duration::from_millis(50));

    let output = rebuild(&storage, &timed, &clock, &CancellationToken::new())
        .expect("rebuild should complete despite the slow task");
    let report = &output.generation.report;

    assert_eq!(report.processed_count, 3);
    assert_eq!(report.parsed_count, 2);
    assert_eq!(report.errors[0].task_id, "task-01");
    assert!(report.errors[0].reason.contains("timed out"));
}

#[test]
fn cancellation_discards_the_partial_batch() {
    let token = CancellationToken::new();
    let storage: Arc<dyn TaskStorage> = Arc::new(SlowStorage {
        inner: seeded_memory(20),
        slow_task: "none",
        delay: Duration::ZERO,
        cancel_on_read: Some(token.clone()),
    });
    let clock = FixedClock::new(NOW);

    let error = rebuild(&storage, &plan(1), &clock, &token).expect_err("cancelled rebuild must fail");

    match error {
        RebuildError::Cancelled { completed, total } => {
            assert_eq!(total, 20);
            assert!(completed < total, "completed {completed} of {total}");
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[test]
fn generation_artifacts_are_written_and_readable() {
    let root = unique_temp_dir("lineage-rebuild-artifacts");
    write_file(
        &root.join("tasks/parent/ui_messages.json"),
        include_str!("../../../fixtures/ui_messages/parent_with_spawns.json"),
    );
    let storage: Arc<dyn TaskStorage> = Arc::new(FileTaskStorage::new(root.join("tasks")));
    let clock = FixedClock::new(NOW);
    let output = rebuild(&storage, &plan(1), &clock, &CancellationToken::new())
        .expect("rebuild should complete");

    let layout = build_artifact_layout(&root.join("out"));
    write_generation_artifacts(&layout, &output.generation.skeletons, &output.generation.report)
        .expect("artifacts should be written");

    let skeletons = std::fs::read_to_string(&layout.skeletons_jsonl).expect("skeletons readable");
    assert_eq!(skeletons.lines().count(), 1);
    let row: serde_json::Value =
        serde_json::from_str(skeletons.lines().next().expect("one row")).expect("row is json");
    assert_eq!(row["task_id"], "parent");
    assert_eq!(
        read_report_artifact(&layout.report_json).expect("report readable"),
        output.generation.report
    );
    let schema: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(&layout.schema_json).expect("schema readable"),
    )
    .expect("schema is json");
    assert!(schema.get("properties").is_some() || schema.get("$defs").is_some());
}
