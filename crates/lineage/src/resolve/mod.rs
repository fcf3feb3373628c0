//! Two-phase hierarchy reconstruction.
//!
//! Phase 1 indexes every spawn prefix of the batch. Phase 2 looks each
//! task's opening instruction up in the finished index and links it to the
//! task that spawned it. Candidate lookup is parallel; edges are committed
//! one at a time in task-id order so the cycle guard sees a single,
//! reproducible sequence of links.

mod tie_break;

pub use tie_break::{EarliestCreated, LexicographicTaskId, TieBreak, TieBreakPolicy};

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::index::{MatchMethod, PrefixIndex, PrefixIndexBuilder};
use crate::models::{
    AmbiguityRecord, Anomaly, AnomalyKind, ConversationSkeleton, ResolutionMethod,
    ResolutionReport, TaskError, all_resolution_methods,
};
use crate::utils::text::canonical_len;

/// A skeleton that made it through parsing, plus any parent its writer
/// recorded explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTask {
    pub skeleton: ConversationSkeleton,
    pub declared_parent: Option<String>,
}

impl From<ConversationSkeleton> for ParsedTask {
    fn from(skeleton: ConversationSkeleton) -> Self {
        Self {
            skeleton,
            declared_parent: None,
        }
    }
}

/// Per-task result handed to Phase 1.
pub type TaskOutcome = Result<ParsedTask, TaskError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Approximate matches shorter than this many chars are ignored.
    pub min_approximate_chars: usize,
    /// Threads used for Phase 2 candidate lookup.
    pub workers: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            min_approximate_chars: 0,
            workers: 1,
        }
    }
}

/// Phase 1 output: the frozen index and the tallies Phase 2 reports on.
#[derive(Debug, Clone)]
pub struct IndexPhase {
    pub index: PrefixIndex,
    /// Sorted by task id.
    pub tasks: Vec<ParsedTask>,
    pub processed_count: usize,
    pub parsed_count: usize,
    pub total_prefixes_indexed: usize,
    pub errors: Vec<TaskError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedGeneration {
    /// Sorted by task id, parents assigned.
    pub skeletons: Vec<ConversationSkeleton>,
    pub report: ResolutionReport,
}

#[derive(Debug, Clone)]
pub struct ResolutionEngine {
    options: EngineOptions,
    tie_break: Arc<dyn TieBreakPolicy>,
}

impl Default for ResolutionEngine {
    fn default() -> Self {
        Self::new(EngineOptions::default(), TieBreak::default().policy())
    }
}

impl ResolutionEngine {
    #[must_use]
    pub fn new(options: EngineOptions, tie_break: Arc<dyn TieBreakPolicy>) -> Self {
        Self { options, tie_break }
    }

    #[must_use]
    pub const fn options(&self) -> &EngineOptions {
        &self.options
    }

    #[must_use]
    pub fn tie_break_name(&self) -> &'static str {
        self.tie_break.name()
    }

    /// Runs both phases over one batch.
    #[must_use]
    pub fn run(&self, outcomes: Vec<TaskOutcome>) -> ResolvedGeneration {
        let phase = self.index_phase(outcomes);
        self.resolution_phase(phase)
    }

    /// Phase 1: tally outcomes and index every spawn prefix under its owner.
    #[must_use]
    pub fn index_phase(&self, outcomes: Vec<TaskOutcome>) -> IndexPhase {
        let processed_count = outcomes.len();
        let mut errors = Vec::new();
        let mut tasks = Vec::with_capacity(outcomes.len());
        let mut seen = HashSet::new();

        for outcome in outcomes {
            match outcome {
                Ok(mut task) => {
                    if !seen.insert(task.skeleton.task_id.clone()) {
                        errors.push(TaskError {
                            task_id: task.skeleton.task_id.clone(),
                            reason: "duplicate task id in batch; later copy ignored".to_string(),
                        });
                        continue;
                    }
                    // A parent already present on the skeleton counts as
                    // declared and is re-validated in Phase 2.
                    if let Some(existing) = task.skeleton.parent_task_id.take() {
                        task.declared_parent.get_or_insert(existing);
                    }
                    tasks.push(task);
                }
                Err(error) => errors.push(error),
            }
        }

        tasks.sort_by(|left, right| left.skeleton.task_id.cmp(&right.skeleton.task_id));
        errors.sort_by(|left, right| left.task_id.cmp(&right.task_id));

        let mut builder = PrefixIndexBuilder::new();
        for task in &tasks {
            for prefix in &task.skeleton.child_spawn_prefixes {
                builder.insert(prefix, &task.skeleton.task_id);
            }
        }
        let index = builder.build();
        let parsed_count = tasks.len();

        info!(
            processed = processed_count,
            parsed = parsed_count,
            prefixes = index.entry_count(),
            errors = errors.len(),
            "index phase complete"
        );

        IndexPhase {
            total_prefixes_indexed: index.entry_count(),
            index,
            tasks,
            processed_count,
            parsed_count,
            errors,
        }
    }

    /// Phase 2: assign parents, compute depths, and report.
    #[must_use]
    pub fn resolution_phase(&self, phase: IndexPhase) -> ResolvedGeneration {
        let IndexPhase {
            index,
            tasks,
            processed_count,
            parsed_count,
            total_prefixes_indexed,
            errors,
        } = phase;

        let positions: HashMap<&str, usize> = tasks
            .iter()
            .enumerate()
            .map(|(position, task)| (task.skeleton.task_id.as_str(), position))
            .collect();
        let mut edges = ParentEdges::new(tasks.len());
        let mut methods = vec![ResolutionMethod::Unresolved; tasks.len()];
        let mut anomalies = Vec::new();
        let mut ambiguities = Vec::new();
        let mut matched_length_by_task = BTreeMap::new();

        for (child, task) in tasks.iter().enumerate() {
            let Some(declared) = task.declared_parent.as_deref() else {
                continue;
            };
            let task_id = &task.skeleton.task_id;
            let Some(&parent) = positions.get(declared) else {
                anomalies.push(Anomaly {
                    task_id: task_id.clone(),
                    kind: AnomalyKind::MissingDeclaredParent,
                    detail: format!("declared parent `{declared}` is not in this generation"),
                });
                continue;
            };
            match edges.try_link(child, parent) {
                Ok(()) => methods[child] = ResolutionMethod::Declared,
                Err(rejection) => {
                    anomalies.push(rejection.anomaly(task_id, declared));
                }
            }
        }

        let pending: Vec<usize> = (0..tasks.len())
            .filter(|position| edges.parent_of(*position).is_none())
            .collect();
        let candidates = self.find_candidates(&index, &tasks, &pending);

        for (child, candidate) in candidates {
            let task_id = &tasks[child].skeleton.task_id;
            if candidate.method == ResolutionMethod::Unresolved {
                if candidate.self_referenced {
                    anomalies.push(Anomaly {
                        task_id: task_id.clone(),
                        kind: AnomalyKind::SelfReference,
                        detail: "only match for the opening instruction is the task's own spawn prefix"
                            .to_string(),
                    });
                }
                continue;
            }

            let candidate_skeletons: Vec<&ConversationSkeleton> = candidate
                .owners
                .iter()
                .filter_map(|owner| positions.get(owner.as_str()))
                .map(|position| &tasks[*position].skeleton)
                .collect();
            let Some(chosen) = self.tie_break.choose(&candidate_skeletons) else {
                continue;
            };
            if candidate_skeletons.len() > 1 {
                debug!(
                    task_id = %task_id,
                    candidates = candidate_skeletons.len(),
                    chosen = %chosen.task_id,
                    policy = self.tie_break.name(),
                    "ambiguous parent match resolved by tie-break"
                );
                ambiguities.push(AmbiguityRecord {
                    task_id: task_id.clone(),
                    method: candidate.method,
                    candidates: candidate.owners.clone(),
                    chosen: chosen.task_id.clone(),
                });
            }

            let Some(&parent) = positions.get(chosen.task_id.as_str()) else {
                continue;
            };
            match edges.try_link(child, parent) {
                Ok(()) => {
                    methods[child] = candidate.method;
                    if candidate.method == ResolutionMethod::Approximate {
                        matched_length_by_task.insert(task_id.clone(), candidate.matched_len);
                    }
                }
                Err(rejection) => {
                    let anomaly = rejection.anomaly(task_id, &chosen.task_id);
                    warn!(
                        task_id = %task_id,
                        parent = %chosen.task_id,
                        detail = %anomaly.detail,
                        "rejected parent assignment"
                    );
                    anomalies.push(anomaly);
                }
            }
        }

        let parent_ids: Vec<Option<String>> = (0..tasks.len())
            .map(|child| {
                edges
                    .parent_of(child)
                    .map(|parent| tasks[parent].skeleton.task_id.clone())
            })
            .collect();
        let skeletons: Vec<ConversationSkeleton> = tasks
            .into_iter()
            .zip(parent_ids)
            .map(|(task, parent_task_id)| ConversationSkeleton {
                parent_task_id,
                ..task.skeleton
            })
            .collect();

        let depths = compute_depths(&skeletons, &edges, &mut anomalies);
        anomalies.sort_by(|left, right| {
            (left.task_id.as_str(), left.kind).cmp(&(right.task_id.as_str(), right.kind))
        });

        let mut resolution_method_histogram: BTreeMap<String, usize> = all_resolution_methods()
            .into_iter()
            .map(|method| (method.as_str().to_string(), 0))
            .collect();
        for method in &methods {
            *resolution_method_histogram
                .entry(method.as_str().to_string())
                .or_insert(0) += 1;
        }
        let unresolved_count = methods
            .iter()
            .filter(|method| **method == ResolutionMethod::Unresolved)
            .count();
        let resolved_count = methods.len() - unresolved_count;

        let depth_by_task: BTreeMap<String, u32> = depths
            .iter()
            .enumerate()
            .filter_map(|(position, depth)| {
                depth.map(|depth| (skeletons[position].task_id.clone(), depth))
            })
            .collect();
        let report = ResolutionReport {
            processed_count,
            parsed_count,
            total_prefixes_indexed,
            errors,
            resolved_count,
            unresolved_count,
            reconstruction_rate: reconstruction_rate(resolved_count, parsed_count),
            max_depth: depth_by_task.values().copied().max().unwrap_or(0),
            root_count: skeletons.iter().filter(|skeleton| skeleton.is_root()).count(),
            depth_by_task,
            resolution_method_histogram,
            matched_length_by_task,
            ambiguities,
            anomalies,
        };

        info!(
            resolved = report.resolved_count,
            unresolved = report.unresolved_count,
            rate = report.reconstruction_rate,
            ambiguities = report.ambiguities.len(),
            anomalies = report.anomalies.len(),
            "resolution phase complete"
        );

        ResolvedGeneration { skeletons, report }
    }

    fn find_candidates(
        &self,
        index: &PrefixIndex,
        tasks: &[ParsedTask],
        pending: &[usize],
    ) -> Vec<(usize, Candidate)> {
        let workers = self.options.workers.clamp(1, pending.len().max(1));
        if workers == 1 {
            return pending
                .iter()
                .map(|position| (*position, self.candidate_for(index, &tasks[*position].skeleton)))
                .collect();
        }

        let chunk_size = pending.len().div_ceil(workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = pending
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .map(|position| {
                                (*position, self.candidate_for(index, &tasks[*position].skeleton))
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|payload| std::panic::resume_unwind(payload))
                })
                .collect()
        })
    }

    fn candidate_for(&self, index: &PrefixIndex, skeleton: &ConversationSkeleton) -> Candidate {
        let instruction = skeleton.opening_instruction.as_str();
        if instruction.is_empty() {
            return Candidate::unresolved(false);
        }
        let own_id = skeleton.task_id.as_str();

        let exact = index.lookup_exact(instruction);
        let self_referenced = exact.contains(&own_id);
        let owners: Vec<String> = exact
            .into_iter()
            .filter(|owner| *owner != own_id)
            .map(str::to_string)
            .collect();
        if !owners.is_empty() {
            return Candidate {
                method: ResolutionMethod::Exact,
                owners,
                matched_len: canonical_len(instruction),
                self_referenced,
            };
        }

        let min_len = self.options.min_approximate_chars.max(1);
        match index.lookup_best_where(instruction, |owner| owner != own_id) {
            Some(best) if best.method == MatchMethod::Approximate && best.matched_len >= min_len => {
                Candidate {
                    method: ResolutionMethod::Approximate,
                    owners: best.owners.into_iter().map(str::to_string).collect(),
                    matched_len: best.matched_len,
                    self_referenced,
                }
            }
            _ => Candidate::unresolved(self_referenced),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    method: ResolutionMethod,
    owners: Vec<String>,
    matched_len: usize,
    self_referenced: bool,
}

impl Candidate {
    const fn unresolved(self_referenced: bool) -> Self {
        Self {
            method: ResolutionMethod::Unresolved,
            owners: Vec::new(),
            matched_len: 0,
            self_referenced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkRejection {
    SelfLink,
    Cycle,
}

impl LinkRejection {
    fn anomaly(self, task_id: &str, parent_id: &str) -> Anomaly {
        match self {
            Self::SelfLink => Anomaly {
                task_id: task_id.to_string(),
                kind: AnomalyKind::SelfReference,
                detail: "task cannot be its own parent".to_string(),
            },
            Self::Cycle => Anomaly {
                task_id: task_id.to_string(),
                kind: AnomalyKind::CycleDetected,
                detail: format!("linking to `{parent_id}` would close a cycle"),
            },
        }
    }
}

/// Parent pointers committed so far in this pass, by batch position.
#[derive(Debug, Clone)]
struct ParentEdges {
    parents: Vec<Option<usize>>,
}

impl ParentEdges {
    fn new(len: usize) -> Self {
        Self {
            parents: vec![None; len],
        }
    }

    fn parent_of(&self, child: usize) -> Option<usize> {
        self.parents.get(child).copied().flatten()
    }

    // Walks the candidate parent's ancestor chain before committing; the
    // edge is refused if the chain reaches `child`.
    fn try_link(&mut self, child: usize, parent: usize) -> Result<(), LinkRejection> {
        if child == parent {
            return Err(LinkRejection::SelfLink);
        }
        let mut cursor = Some(parent);
        let mut hops = 0_usize;
        while let Some(current) = cursor {
            if current == child || hops > self.parents.len() {
                return Err(LinkRejection::Cycle);
            }
            hops += 1;
            cursor = self.parent_of(current);
        }
        self.parents[child] = Some(parent);
        Ok(())
    }
}

// Breadth-first from every root. Anything left unvisited hangs off a chain
// that never reaches a root and is reported instead of being given a depth.
fn compute_depths(
    skeletons: &[ConversationSkeleton],
    edges: &ParentEdges,
    anomalies: &mut Vec<Anomaly>,
) -> Vec<Option<u32>> {
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); skeletons.len()];
    let mut queue = VecDeque::new();
    let mut depths = vec![None; skeletons.len()];

    for position in 0..skeletons.len() {
        match edges.parent_of(position) {
            Some(parent) => children[parent].push(position),
            None => {
                depths[position] = Some(0);
                queue.push_back(position);
            }
        }
    }

    while let Some(position) = queue.pop_front() {
        let Some(depth) = depths[position] else {
            continue;
        };
        for child in &children[position] {
            if depths[*child].is_none() {
                depths[*child] = Some(depth + 1);
                queue.push_back(*child);
            }
        }
    }

    for (position, depth) in depths.iter().enumerate() {
        if depth.is_none() {
            warn!(task_id = %skeletons[position].task_id, "ancestor chain never reaches a root");
            anomalies.push(Anomaly {
                task_id: skeletons[position].task_id.clone(),
                kind: AnomalyKind::DetachedChain,
                detail: format!(
                    "ancestor chain does not reach a root within {} hops",
                    skeletons.len()
                ),
            });
        }
    }

    depths
}

fn reconstruction_rate(resolved: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    let rate = resolved as f64 * 100.0 / total as f64;
    (rate * 100.0).round() / 100.0
}
