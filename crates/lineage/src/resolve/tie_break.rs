use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::models::{ConversationSkeleton, TimestampQuality};

/// Picks one parent when several tasks recorded the same spawn text.
pub trait TieBreakPolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// `candidates` arrives in index order. Must be a pure function of the
    /// candidates so rebuilds stay reproducible.
    fn choose<'a>(
        &self,
        candidates: &[&'a ConversationSkeleton],
    ) -> Option<&'a ConversationSkeleton>;
}

/// Oldest candidate wins. Candidates whose creation time came from the clock
/// fallback sort after every candidate with a logged timestamp; remaining
/// ties go to the smallest task id.
#[derive(Debug, Clone, Copy, Default)]
pub struct EarliestCreated;

impl TieBreakPolicy for EarliestCreated {
    fn name(&self) -> &'static str {
        "earliest_created"
    }

    fn choose<'a>(
        &self,
        candidates: &[&'a ConversationSkeleton],
    ) -> Option<&'a ConversationSkeleton> {
        candidates.iter().copied().min_by_key(|skeleton| {
            let skeleton: &'a ConversationSkeleton = *skeleton;
            let fallback = skeleton.metadata.timestamp_quality == TimestampQuality::Fallback;
            let created_at = if fallback { u64::MAX } else { skeleton.created_at() };
            (fallback, created_at, skeleton.task_id.as_str())
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LexicographicTaskId;

impl TieBreakPolicy for LexicographicTaskId {
    fn name(&self) -> &'static str {
        "lexicographic"
    }

    fn choose<'a>(
        &self,
        candidates: &[&'a ConversationSkeleton],
    ) -> Option<&'a ConversationSkeleton> {
        candidates
            .iter()
            .copied()
            .min_by(|left, right| left.task_id.cmp(&right.task_id))
    }
}

/// Configurable selector for the shipped policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    EarliestCreated,
    Lexicographic,
}

impl TieBreak {
    #[must_use]
    pub fn policy(self) -> Arc<dyn TieBreakPolicy> {
        match self {
            Self::EarliestCreated => Arc::new(EarliestCreated),
            Self::Lexicographic => Arc::new(LexicographicTaskId),
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EarliestCreated => "earliest_created",
            Self::Lexicographic => "lexicographic",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "earliest_created" | "earliest" | "oldest" => Some(Self::EarliestCreated),
            "lexicographic" | "task_id" => Some(Self::Lexicographic),
            _ => None,
        }
    }
}
