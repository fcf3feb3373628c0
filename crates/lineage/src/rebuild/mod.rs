//! One generation of the pipeline: load and transform every listed task on a
//! bounded worker pool, then hand the whole batch to the resolution engine.

pub mod artifacts;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{ParseError, RebuildError};
use crate::models::TaskError;
use crate::resolve::{
    EngineOptions, ParsedTask, ResolutionEngine, ResolvedGeneration, TaskOutcome, TieBreak,
};
use crate::skeleton::{TransformOptions, transform_task};
use crate::storage::{RawTask, TaskListing, TaskStorage};
use crate::utils::time::Clock;

pub const MAX_WORKERS: usize = 16;

/// Cooperative cancellation flag shared between a rebuild and whoever may
/// want to stop it. Workers check it before starting each task.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct RebuildPlan {
    pub workers: usize,
    /// `None` reads without a deadline.
    pub read_timeout: Option<Duration>,
    pub transform: TransformOptions,
    pub engine: EngineOptions,
    pub tie_break: TieBreak,
}

impl Default for RebuildPlan {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            read_timeout: Some(Duration::from_secs(10)),
            transform: TransformOptions::default(),
            engine: EngineOptions::default(),
            tie_break: TieBreak::default(),
        }
    }
}

impl RebuildPlan {
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.clamp(1, MAX_WORKERS)
    }

    #[must_use]
    pub fn engine(&self) -> ResolutionEngine {
        let options = EngineOptions {
            workers: self.worker_count(),
            ..self.engine
        };
        ResolutionEngine::new(options, self.tie_break.policy())
    }
}

#[must_use]
pub fn default_workers() -> usize {
    thread::available_parallelism()
        .map_or(1, std::num::NonZeroUsize::get)
        .clamp(1, MAX_WORKERS)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RebuildOutput {
    /// Listing the generation was built from, sorted by task id.
    pub listing: Vec<TaskListing>,
    pub generation: ResolvedGeneration,
    /// Non-fatal notes from storage and the transformer, prefixed by task id.
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

/// Lists storage and rebuilds from that listing.
pub fn rebuild(
    storage: &Arc<dyn TaskStorage>,
    plan: &RebuildPlan,
    clock: &dyn Clock,
    cancel: &CancellationToken,
) -> Result<RebuildOutput, RebuildError> {
    let listing = storage.list_tasks()?;
    rebuild_from_listing(storage, listing, plan, clock, cancel)
}

/// Rebuilds the tasks named by `listing`.
///
/// Per-task failures land in the report's `errors`. The whole rebuild fails
/// only when the listing is empty, nothing parsed, or `cancel` fired.
pub fn rebuild_from_listing(
    storage: &Arc<dyn TaskStorage>,
    mut listing: Vec<TaskListing>,
    plan: &RebuildPlan,
    clock: &dyn Clock,
    cancel: &CancellationToken,
) -> Result<RebuildOutput, RebuildError> {
    let started = Instant::now();
    listing.sort();
    listing.dedup_by(|left, right| left.task_id == right.task_id);
    if listing.is_empty() {
        return Err(RebuildError::EmptyBatch);
    }

    let total = listing.len();
    let workers = plan.worker_count().min(total);
    info!(
        storage = %storage.describe(),
        tasks = total,
        workers,
        "rebuild started"
    );

    let cursor = AtomicUsize::new(0);
    let completed = AtomicUsize::new(0);
    let results: Mutex<Vec<(TaskOutcome, Vec<String>)>> = Mutex::new(Vec::with_capacity(total));

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                let mut local = Vec::new();
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let position = cursor.fetch_add(1, Ordering::SeqCst);
                    let Some(entry) = listing.get(position) else {
                        break;
                    };
                    local.push(process_task(storage, &entry.task_id, plan, clock));
                    completed.fetch_add(1, Ordering::SeqCst);
                }
                results
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .append(&mut local);
            });
        }
    });

    let completed = completed.into_inner();
    if cancel.is_cancelled() {
        warn!(completed, total, "rebuild cancelled; partial batch discarded");
        return Err(RebuildError::Cancelled { completed, total });
    }

    let mut results = results.into_inner().unwrap_or_else(PoisonError::into_inner);
    results.sort_by(|left, right| outcome_task_id(&left.0).cmp(outcome_task_id(&right.0)));

    let mut warnings = Vec::new();
    let mut outcomes = Vec::with_capacity(results.len());
    for (outcome, mut task_warnings) in results {
        warnings.append(&mut task_warnings);
        outcomes.push(outcome);
    }

    let parsed = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    if parsed == 0 {
        warn!(processed = total, "no task in the batch could be parsed");
        return Err(RebuildError::NothingParsed { processed: total });
    }

    let generation = plan.engine().run(outcomes);
    let elapsed = started.elapsed();
    info!(
        processed = generation.report.processed_count,
        parsed = generation.report.parsed_count,
        errors = generation.report.errors.len(),
        rate = generation.report.reconstruction_rate,
        elapsed_ms = elapsed.as_millis() as u64,
        "rebuild completed"
    );

    Ok(RebuildOutput {
        listing,
        generation,
        warnings,
        elapsed,
    })
}

fn outcome_task_id(outcome: &TaskOutcome) -> &str {
    match outcome {
        Ok(task) => &task.skeleton.task_id,
        Err(error) => &error.task_id,
    }
}

fn process_task(
    storage: &Arc<dyn TaskStorage>,
    task_id: &str,
    plan: &RebuildPlan,
    clock: &dyn Clock,
) -> (TaskOutcome, Vec<String>) {
    let raw = match load_with_timeout(storage, task_id, plan.read_timeout) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(task_id, error = %error, "task excluded: parse failure");
            return (
                Err(TaskError {
                    task_id: task_id.to_string(),
                    reason: error.to_string(),
                }),
                Vec::new(),
            );
        }
    };

    match transform_task(&raw, &plan.transform, clock) {
        Ok(output) => {
            debug!(
                task_id,
                prefixes = output.skeleton.child_spawn_prefixes.len(),
                instruction_source = ?output.metadata.instruction_source,
                "task transformed"
            );
            let warnings = output
                .metadata
                .warnings
                .iter()
                .map(|warning| format!("{task_id}: {warning}"))
                .collect();
            let task = ParsedTask {
                skeleton: output.skeleton,
                declared_parent: raw.declared_parent,
            };
            (Ok(task), warnings)
        }
        Err(error) => {
            warn!(task_id, error = %error, "task excluded: skeleton validation failed");
            (
                Err(TaskError {
                    task_id: task_id.to_string(),
                    reason: error.to_string(),
                }),
                Vec::new(),
            )
        }
    }
}

// The reader thread is detached: a read that never returns costs one parked
// thread, not the rebuild.
fn load_with_timeout(
    storage: &Arc<dyn TaskStorage>,
    task_id: &str,
    timeout: Option<Duration>,
) -> Result<RawTask, ParseError> {
    let Some(timeout) = timeout else {
        return storage.load_task(task_id);
    };

    let (sender, receiver) = mpsc::channel();
    let reader_storage = Arc::clone(storage);
    let owned_id = task_id.to_string();
    let spawned = thread::Builder::new()
        .name("lineage-reader".to_string())
        .spawn(move || {
            let _ = sender.send(reader_storage.load_task(&owned_id));
        });
    if let Err(error) = spawned {
        warn!(task_id, error = %error, "reader thread unavailable; reading inline");
        return storage.load_task(task_id);
    }

    match receiver.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(ParseError::Timeout {
            task_id: task_id.to_string(),
            timeout,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(ParseError::ReaderLost {
            task_id: task_id.to_string(),
        }),
    }
}
