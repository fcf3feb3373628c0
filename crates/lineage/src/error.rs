//! Failure taxonomy of the reconstruction pipeline.
//!
//! Per-task errors ([`ParseError`], [`SkeletonValidationError`]) never cross
//! their own task. Only [`RebuildError`] reaches callers of
//! `SkeletonCache::ensure_fresh`, and even then the previous generation keeps
//! serving reads.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A single task's source could not be turned into messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("task `{task_id}` not found in storage")]
    MissingTask { task_id: String },

    #[error("failed to read `{path}`: {reason}")]
    Unreadable { path: PathBuf, reason: String },

    #[error("invalid JSON in `{source_name}`: {reason}")]
    InvalidJson { source_name: String, reason: String },

    #[error("unexpected shape in `{source_name}`: {reason}")]
    UnexpectedShape { source_name: String, reason: String },

    #[error("no message log found for task `{task_id}`")]
    NoMessageLog { task_id: String },

    #[error("reading task `{task_id}` timed out after {timeout:?}")]
    Timeout { task_id: String, timeout: Duration },

    #[error("reader for task `{task_id}` stopped before returning a result")]
    ReaderLost { task_id: String },
}

/// Strict-mode invariant violation on a freshly built skeleton.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SkeletonValidationError {
    #[error("skeleton has an empty task id")]
    EmptyTaskId,

    #[error("task `{task_id}` spawn prefix #{index} is {length} chars, cap is {max_len}")]
    PrefixTooLong {
        task_id: String,
        index: usize,
        length: usize,
        max_len: usize,
    },

    #[error("task `{task_id}` opening instruction is {length} chars, cap is {max_len}")]
    InstructionTooLong {
        task_id: String,
        length: usize,
        max_len: usize,
    },

    #[error("task `{task_id}` repeats spawn prefix `{prefix}`")]
    DuplicatePrefix { task_id: String, prefix: String },
}

/// The storage collaborator could not enumerate its tasks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage root `{path}` is unreachable: {reason}")]
    Unreachable { path: PathBuf, reason: String },

    #[error("storage listing failed: {reason}")]
    Listing { reason: String },
}

/// A whole rebuild produced no generation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RebuildError {
    #[error("task listing failed")]
    Storage(#[from] StorageError),

    #[error("storage listed no tasks")]
    EmptyBatch,

    #[error("none of the {processed} listed tasks could be parsed")]
    NothingParsed { processed: usize },

    #[error("rebuild cancelled after {completed} of {total} tasks")]
    Cancelled { completed: usize, total: usize },
}
