use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use super::{RawTask, TaskListing, TaskStorage};
use crate::adapters::{LogFormat, parse_log};
use crate::error::{ParseError, StorageError};
use crate::models::RawMessage;

#[derive(Debug, Clone)]
enum MemorySource {
    Log { format: LogFormat, text: String },
    Messages(Vec<RawMessage>),
}

#[derive(Debug, Clone)]
struct MemoryTask {
    source: MemorySource,
    workspace: Option<String>,
    declared_parent: Option<String>,
    revision: u64,
    size_bytes: u64,
}

/// Process-local storage for embedding callers and tests.
///
/// Every write bumps a revision counter that stands in for a file mtime, so
/// the cache sees any mutation as a change.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    tasks: RwLock<BTreeMap<String, MemoryTask>>,
    revision: AtomicU64,
    listing_failure: RwLock<Option<String>>,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a raw log document, parsed lazily on `load_task`.
    pub fn insert_log(&self, task_id: &str, format: LogFormat, text: impl Into<String>) {
        let text = text.into();
        let size_bytes = text.len() as u64;
        self.upsert(task_id, MemorySource::Log { format, text }, size_bytes);
    }

    pub fn insert_messages(&self, task_id: &str, messages: Vec<RawMessage>) {
        let size_bytes = messages.len() as u64;
        self.upsert(task_id, MemorySource::Messages(messages), size_bytes);
    }

    pub fn set_workspace(&self, task_id: &str, workspace: Option<&str>) {
        self.update(task_id, |task| task.workspace = workspace.map(str::to_string));
    }

    pub fn set_declared_parent(&self, task_id: &str, parent: Option<&str>) {
        self.update(task_id, |task| {
            task.declared_parent = parent.map(str::to_string);
        });
    }

    pub fn remove(&self, task_id: &str) -> bool {
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let removed = tasks.remove(task_id).is_some();
        if removed {
            self.revision.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }

    /// Makes `list_tasks` fail until cleared with `None`.
    pub fn fail_listing(&self, reason: Option<&str>) {
        let mut failure = self
            .listing_failure
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *failure = reason.map(str::to_string);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn upsert(&self, task_id: &str, source: MemorySource, size_bytes: u64) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        let (workspace, declared_parent) = tasks
            .get(task_id)
            .map(|task| (task.workspace.clone(), task.declared_parent.clone()))
            .unwrap_or_default();
        tasks.insert(
            task_id.to_string(),
            MemoryTask {
                source,
                workspace,
                declared_parent,
                revision,
                size_bytes,
            },
        );
    }

    fn update(&self, task_id: &str, apply: impl FnOnce(&mut MemoryTask)) {
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        let mut tasks = self.tasks.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = tasks.get_mut(task_id) {
            apply(task);
            task.revision = revision;
        }
    }
}

impl TaskStorage for InMemoryStorage {
    fn list_tasks(&self) -> Result<Vec<TaskListing>, StorageError> {
        if let Some(reason) = self
            .listing_failure
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(StorageError::Listing { reason });
        }

        let tasks = self.tasks.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tasks
            .iter()
            .map(|(task_id, task)| TaskListing {
                task_id: task_id.clone(),
                modified_unix_ms: task.revision,
                size_bytes: task.size_bytes,
            })
            .collect())
    }

    fn load_task(&self, task_id: &str) -> Result<RawTask, ParseError> {
        let task = self
            .tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .cloned()
            .ok_or_else(|| ParseError::MissingTask {
                task_id: task_id.to_string(),
            })?;

        let (messages, warnings) = match task.source {
            MemorySource::Log { format, text } => {
                let parsed = parse_log(format, &text, &format!("memory:{task_id}"))?;
                (parsed.messages, parsed.warnings)
            }
            MemorySource::Messages(messages) => (messages, Vec::new()),
        };

        Ok(RawTask {
            task_id: task_id.to_string(),
            messages,
            workspace: task.workspace,
            declared_parent: task.declared_parent,
            warnings,
        })
    }

    fn describe(&self) -> String {
        format!("in-memory storage ({} tasks)", self.len())
    }
}
