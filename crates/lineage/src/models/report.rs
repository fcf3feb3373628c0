use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    /// Parent supplied by the storage collaborator and present in the batch.
    Declared,
    Exact,
    Approximate,
    Unresolved,
}

impl ResolutionMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Declared => "declared",
            Self::Exact => "exact",
            Self::Approximate => "approximate",
            Self::Unresolved => "unresolved",
        }
    }
}

#[must_use]
pub const fn all_resolution_methods() -> [ResolutionMethod; 4] {
    [
        ResolutionMethod::Declared,
        ResolutionMethod::Exact,
        ResolutionMethod::Approximate,
        ResolutionMethod::Unresolved,
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub task_id: String,
    pub reason: String,
}

/// More than one task recorded the text that matched; `chosen` won the
/// tie-break.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguityRecord {
    pub task_id: String,
    pub method: ResolutionMethod,
    pub candidates: Vec<String>,
    pub chosen: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    SelfReference,
    CycleDetected,
    DetachedChain,
    MissingDeclaredParent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anomaly {
    pub task_id: String,
    pub kind: AnomalyKind,
    pub detail: String,
}

/// Outcome of one rebuild. Carries no wall-clock data, so two rebuilds of the
/// same input compare equal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionReport {
    pub processed_count: usize,
    pub parsed_count: usize,
    pub total_prefixes_indexed: usize,
    pub errors: Vec<TaskError>,

    pub resolved_count: usize,
    pub unresolved_count: usize,
    /// Percentage of parsed tasks that received a parent.
    pub reconstruction_rate: f64,
    pub depth_by_task: BTreeMap<String, u32>,
    pub resolution_method_histogram: BTreeMap<String, usize>,
    pub matched_length_by_task: BTreeMap<String, usize>,
    pub ambiguities: Vec<AmbiguityRecord>,
    pub anomalies: Vec<Anomaly>,
    pub root_count: usize,
    pub max_depth: u32,
}

impl ResolutionReport {
    #[must_use]
    pub fn ambiguity_count(&self) -> usize {
        self.ambiguities.len()
    }

    #[must_use]
    pub fn method_count(&self, method: ResolutionMethod) -> usize {
        self.resolution_method_histogram
            .get(method.as_str())
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn anomalies_of(&self, kind: AnomalyKind) -> Vec<&Anomaly> {
        self.anomalies
            .iter()
            .filter(|anomaly| anomaly.kind == kind)
            .collect()
    }
}
