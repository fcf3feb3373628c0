//! Skeleton cache and freshness controller.
//!
//! Readers always see one complete generation. `ensure_fresh` compares the
//! storage listing against the fingerprint of that generation and, when they
//! differ, rebuilds and swaps the new generation in with a single pointer
//! store. Concurrent callers share one in-flight rebuild.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{RebuildError, StorageError};
use crate::models::{ConversationSkeleton, ResolutionReport};
use crate::rebuild::{CancellationToken, RebuildOutput, RebuildPlan, rebuild_from_listing};
use crate::storage::{TaskListing, TaskStorage};
use crate::utils::hash::hex64;
use crate::utils::time::Clock;

pub const DEFAULT_MEMORY_CEILING_BYTES: usize = 256 * 1024 * 1024;
pub const DEFAULT_MEMORY_WARN_RATIO: f64 = 0.9;

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub plan: RebuildPlan,
    pub memory_ceiling_bytes: usize,
    /// Fraction of the ceiling at which the cache reports `NearCeiling`.
    pub memory_warn_ratio: f64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            plan: RebuildPlan::default(),
            memory_ceiling_bytes: DEFAULT_MEMORY_CEILING_BYTES,
            memory_warn_ratio: DEFAULT_MEMORY_WARN_RATIO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationInfo {
    pub id: u64,
    pub fingerprint: String,
    pub built_at_unix_ms: u64,
    pub task_count: usize,
    pub retained_bytes: usize,
    /// Task ids dropped to stay under the memory ceiling, in eviction order.
    pub evicted: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLevel {
    Ok,
    NearCeiling,
    OverCeiling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryStatus {
    pub level: MemoryLevel,
    pub retained_bytes: usize,
    pub ceiling_bytes: usize,
}

/// What a successful `ensure_fresh` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum Freshness {
    AlreadyFresh { generation: u64 },
    Rebuilt { generation: u64 },
}

impl Freshness {
    #[must_use]
    pub const fn generation(self) -> u64 {
        match self {
            Self::AlreadyFresh { generation } | Self::Rebuilt { generation } => generation,
        }
    }
}

#[derive(Debug)]
struct Generation {
    info: GenerationInfo,
    skeletons: HashMap<String, ConversationSkeleton>,
    /// Sorted ids of retained skeletons.
    order: Vec<String>,
    children: HashMap<String, Vec<String>>,
    report: ResolutionReport,
}

impl Generation {
    fn build(
        id: u64,
        fingerprint: String,
        built_at_unix_ms: u64,
        skeletons: Vec<ConversationSkeleton>,
        report: ResolutionReport,
        evicted: Vec<String>,
    ) -> Self {
        let retained_bytes = skeletons.iter().map(ConversationSkeleton::retained_bytes).sum();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        let mut order = Vec::with_capacity(skeletons.len());
        for skeleton in &skeletons {
            order.push(skeleton.task_id.clone());
            if let Some(parent) = &skeleton.parent_task_id {
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(skeleton.task_id.clone());
            }
        }
        order.sort();
        for ids in children.values_mut() {
            ids.sort();
        }

        Self {
            info: GenerationInfo {
                id,
                fingerprint,
                built_at_unix_ms,
                task_count: order.len(),
                retained_bytes,
                evicted,
            },
            skeletons: skeletons
                .into_iter()
                .map(|skeleton| (skeleton.task_id.clone(), skeleton))
                .collect(),
            order,
            children,
            report,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightState {
    Idle,
    Rebuilding { ticket: u64 },
}

#[derive(Debug)]
struct Flight {
    state: FlightState,
    next_ticket: u64,
    last_outcome: Option<(u64, Result<Freshness, RebuildError>)>,
}

pub struct SkeletonCache {
    storage: Arc<dyn TaskStorage>,
    clock: Arc<dyn Clock>,
    options: CacheOptions,
    current: RwLock<Option<Arc<Generation>>>,
    flight: Mutex<Flight>,
    flight_done: Condvar,
    cancel: CancellationToken,
    force_rebuild: AtomicBool,
    last_error: Mutex<Option<RebuildError>>,
}

impl std::fmt::Debug for SkeletonCache {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SkeletonCache")
            .field("storage", &self.storage.describe())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl SkeletonCache {
    #[must_use]
    pub fn new(storage: Arc<dyn TaskStorage>, clock: Arc<dyn Clock>, options: CacheOptions) -> Self {
        Self {
            storage,
            clock,
            options,
            current: RwLock::new(None),
            flight: Mutex::new(Flight {
                state: FlightState::Idle,
                next_ticket: 1,
                last_outcome: None,
            }),
            flight_done: Condvar::new(),
            cancel: CancellationToken::new(),
            force_rebuild: AtomicBool::new(false),
            last_error: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Skeleton of `task_id` in the current generation.
    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<ConversationSkeleton> {
        self.snapshot()?.skeletons.get(task_id).cloned()
    }

    /// Every retained skeleton, ordered by task id.
    #[must_use]
    pub fn list(&self) -> Vec<ConversationSkeleton> {
        let Some(generation) = self.snapshot() else {
            return Vec::new();
        };
        generation
            .order
            .iter()
            .filter_map(|task_id| generation.skeletons.get(task_id).cloned())
            .collect()
    }

    #[must_use]
    pub fn children(&self, task_id: &str) -> Vec<ConversationSkeleton> {
        let Some(generation) = self.snapshot() else {
            return Vec::new();
        };
        generation
            .children
            .get(task_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|child| generation.skeletons.get(child).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parent chain of `task_id`, nearest first. Stops at a root or at an
    /// ancestor that is not retained.
    #[must_use]
    pub fn ancestors(&self, task_id: &str) -> Vec<ConversationSkeleton> {
        let Some(generation) = self.snapshot() else {
            return Vec::new();
        };
        let mut chain = Vec::new();
        let mut cursor = generation
            .skeletons
            .get(task_id)
            .and_then(|skeleton| skeleton.parent_task_id.as_deref());
        while let Some(parent_id) = cursor {
            if chain.len() >= generation.order.len() {
                break;
            }
            let Some(parent) = generation.skeletons.get(parent_id) else {
                break;
            };
            chain.push(parent.clone());
            cursor = parent.parent_task_id.as_deref();
        }
        chain
    }

    #[must_use]
    pub fn roots(&self) -> Vec<ConversationSkeleton> {
        self.list()
            .into_iter()
            .filter(ConversationSkeleton::is_root)
            .collect()
    }

    #[must_use]
    pub fn last_resolution_report(&self) -> Option<ResolutionReport> {
        self.snapshot().map(|generation| generation.report.clone())
    }

    #[must_use]
    pub fn generation(&self) -> Option<GenerationInfo> {
        self.snapshot().map(|generation| generation.info.clone())
    }

    /// Error of the most recent failed rebuild, cleared by the next success.
    #[must_use]
    pub fn last_rebuild_error(&self) -> Option<RebuildError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn memory_status(&self) -> MemoryStatus {
        let retained_bytes = self
            .snapshot()
            .map_or(0, |generation| generation.info.retained_bytes);
        MemoryStatus {
            level: self.memory_level(retained_bytes),
            retained_bytes,
            ceiling_bytes: self.options.memory_ceiling_bytes,
        }
    }

    /// Whether storage has moved on since the current generation was built.
    pub fn is_stale(&self) -> Result<bool, StorageError> {
        if self.force_rebuild.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let listing = self.sorted_listing()?;
        Ok(self.needs_rebuild(&fingerprint(&listing)))
    }

    /// Stops an in-flight rebuild before its next task. The partial batch is
    /// discarded and the current generation keeps serving.
    pub fn cancel_rebuild(&self) {
        self.cancel.cancel();
    }

    /// Forces the next `ensure_fresh` to rebuild even if storage is unchanged.
    pub fn invalidate(&self) {
        self.force_rebuild.store(true, Ordering::SeqCst);
    }

    /// Rebuilds when storage changed since the current generation.
    ///
    /// A caller arriving while another rebuild runs waits for it and gets its
    /// result. On error the previous generation stays in place.
    pub fn ensure_fresh(&self) -> Result<Freshness, RebuildError> {
        let mut flight = self.lock_flight();
        let ticket = loop {
            match flight.state {
                FlightState::Idle => {
                    let ticket = flight.next_ticket;
                    flight.next_ticket += 1;
                    flight.state = FlightState::Rebuilding { ticket };
                    // Cleared under the flight lock so a cancel issued any
                    // time after this point, listing included, is honored.
                    self.cancel.reset();
                    break ticket;
                }
                FlightState::Rebuilding { ticket } => {
                    debug!(ticket, "joining in-flight rebuild");
                    while flight.state == (FlightState::Rebuilding { ticket }) {
                        flight = self
                            .flight_done
                            .wait(flight)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    if let Some(outcome) = joined_outcome(&flight, ticket) {
                        return outcome;
                    }
                }
            }
        };
        drop(flight);

        let mut landing = FlightLanding {
            cache: self,
            ticket,
            outcome: None,
        };
        let outcome = self.refresh();
        landing.outcome = Some(outcome.clone());
        drop(landing);
        outcome
    }

    fn refresh(&self) -> Result<Freshness, RebuildError> {
        let outcome = self.refresh_inner();
        let mut last_error = self.last_error.lock().unwrap_or_else(PoisonError::into_inner);
        match &outcome {
            Ok(_) => *last_error = None,
            Err(error) => {
                warn!(error = %error, "rebuild failed; serving previous generation, results may be stale");
                *last_error = Some(error.clone());
            }
        }
        outcome
    }

    fn refresh_inner(&self) -> Result<Freshness, RebuildError> {
        let listing = self.sorted_listing()?;
        let fingerprint = fingerprint(&listing);
        let forced = self.force_rebuild.swap(false, Ordering::SeqCst);
        if !forced && !self.needs_rebuild(&fingerprint) {
            if let Some(generation) = self.generation() {
                debug!(generation = generation.id, "cache already fresh");
                return Ok(Freshness::AlreadyFresh {
                    generation: generation.id,
                });
            }
        }

        let result = if self.cancel.is_cancelled() {
            warn!(tasks = listing.len(), "rebuild cancelled before the first task");
            Err(RebuildError::Cancelled {
                completed: 0,
                total: listing.len(),
            })
        } else {
            rebuild_from_listing(
                &self.storage,
                listing,
                &self.options.plan,
                self.clock.as_ref(),
                &self.cancel,
            )
        };
        let output = match result {
            Ok(output) => output,
            Err(error) => {
                if forced {
                    self.force_rebuild.store(true, Ordering::SeqCst);
                }
                return Err(error);
            }
        };
        Ok(Freshness::Rebuilt {
            generation: self.swap_in(output, fingerprint),
        })
    }

    fn swap_in(&self, output: RebuildOutput, fingerprint: String) -> u64 {
        let RebuildOutput {
            generation,
            warnings,
            ..
        } = output;
        for warning in &warnings {
            debug!(warning = %warning, "rebuild warning");
        }

        let (skeletons, evicted) = self.enforce_ceiling(generation.skeletons);
        let id = self.generation().map_or(1, |current| current.id + 1);
        let next = Generation::build(
            id,
            fingerprint,
            self.clock.now_unix_ms(),
            skeletons,
            generation.report,
            evicted,
        );

        let level = self.memory_level(next.info.retained_bytes);
        if level != MemoryLevel::Ok {
            warn!(
                generation = id,
                retained_bytes = next.info.retained_bytes,
                ceiling_bytes = self.options.memory_ceiling_bytes,
                "skeleton cache is near its memory ceiling"
            );
        }
        info!(
            generation = id,
            tasks = next.info.task_count,
            retained_bytes = next.info.retained_bytes,
            evicted = next.info.evicted.len(),
            "generation swapped in"
        );

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(next));
        id
    }

    // Completed tasks go first, each group oldest activity first.
    fn enforce_ceiling(
        &self,
        mut skeletons: Vec<ConversationSkeleton>,
    ) -> (Vec<ConversationSkeleton>, Vec<String>) {
        let ceiling = self.options.memory_ceiling_bytes;
        let mut retained: usize = skeletons.iter().map(ConversationSkeleton::retained_bytes).sum();
        if retained <= ceiling {
            return (skeletons, Vec::new());
        }

        let mut victims: Vec<usize> = (0..skeletons.len()).collect();
        victims.sort_by(|left, right| {
            let left = &skeletons[*left];
            let right = &skeletons[*right];
            (
                !left.is_completed,
                left.metadata.last_activity_unix_ms,
                left.task_id.as_str(),
            )
                .cmp(&(
                    !right.is_completed,
                    right.metadata.last_activity_unix_ms,
                    right.task_id.as_str(),
                ))
        });

        let mut evict = vec![false; skeletons.len()];
        let mut evicted = Vec::new();
        for position in victims {
            if retained <= ceiling {
                break;
            }
            retained -= skeletons[position].retained_bytes();
            evict[position] = true;
            evicted.push(skeletons[position].task_id.clone());
        }

        let mut position = 0;
        skeletons.retain(|_| {
            let keep = !evict[position];
            position += 1;
            keep
        });
        warn!(
            evicted = evicted.len(),
            retained_bytes = retained,
            ceiling_bytes = ceiling,
            "evicted skeletons over the memory ceiling"
        );
        (skeletons, evicted)
    }

    fn memory_level(&self, retained_bytes: usize) -> MemoryLevel {
        let ceiling = self.options.memory_ceiling_bytes;
        if retained_bytes > ceiling {
            MemoryLevel::OverCeiling
        } else if retained_bytes as f64 >= ceiling as f64 * self.options.memory_warn_ratio {
            MemoryLevel::NearCeiling
        } else {
            MemoryLevel::Ok
        }
    }

    fn needs_rebuild(&self, fingerprint: &str) -> bool {
        self.snapshot()
            .is_none_or(|generation| generation.info.fingerprint != fingerprint)
    }

    fn sorted_listing(&self) -> Result<Vec<TaskListing>, StorageError> {
        let mut listing = self.storage.list_tasks()?;
        listing.sort();
        Ok(listing)
    }

    fn snapshot(&self) -> Option<Arc<Generation>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_flight(&self) -> MutexGuard<'_, Flight> {
        self.flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// Returns the flight to Idle and wakes waiters even if the rebuild unwinds.
struct FlightLanding<'a> {
    cache: &'a SkeletonCache,
    ticket: u64,
    outcome: Option<Result<Freshness, RebuildError>>,
}

impl Drop for FlightLanding<'_> {
    fn drop(&mut self) {
        let mut flight = self.cache.lock_flight();
        flight.state = FlightState::Idle;
        if let Some(outcome) = self.outcome.take() {
            flight.last_outcome = Some((self.ticket, outcome));
        }
        drop(flight);
        self.cache.flight_done.notify_all();
    }
}

// Outcome for a caller that joined flight `ticket`. Any flight that landed
// at or after it started from a listing at least as new, so its outcome
// serves. `None` means the joined flight unwound without one.
fn joined_outcome(flight: &Flight, ticket: u64) -> Option<Result<Freshness, RebuildError>> {
    match &flight.last_outcome {
        Some((finished, outcome)) if *finished >= ticket => Some(outcome.clone()),
        _ => None,
    }
}

fn fingerprint(listing: &[TaskListing]) -> String {
    hex64(&listing)
}

#[cfg(test)]
mod tests {
    use super::{Flight, FlightState, Freshness, joined_outcome};
    use crate::error::RebuildError;

    fn landed(ticket: u64, outcome: Result<Freshness, RebuildError>) -> Flight {
        Flight {
            state: FlightState::Idle,
            next_ticket: ticket + 1,
            last_outcome: Some((ticket, outcome)),
        }
    }

    #[test]
    fn waiter_takes_the_outcome_of_its_own_flight() {
        let flight = landed(3, Ok(Freshness::Rebuilt { generation: 2 }));
        assert_eq!(
            joined_outcome(&flight, 3),
            Some(Ok(Freshness::Rebuilt { generation: 2 }))
        );
    }

    #[test]
    fn waiter_accepts_a_newer_flight_that_landed_before_it_woke() {
        let flight = landed(5, Ok(Freshness::AlreadyFresh { generation: 4 }));
        assert_eq!(
            joined_outcome(&flight, 4),
            Some(Ok(Freshness::AlreadyFresh { generation: 4 }))
        );
    }

    #[test]
    fn waiter_ignores_an_older_outcome() {
        let flight = landed(2, Err(RebuildError::EmptyBatch));
        assert_eq!(joined_outcome(&flight, 3), None);

        let unwound = Flight {
            state: FlightState::Idle,
            next_ticket: 4,
            last_outcome: None,
        };
        assert_eq!(joined_outcome(&unwound, 3), None);
    }
}
