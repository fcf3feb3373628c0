//! Seam to whatever owns the conversation logs.
//!
//! The reconstruction core only needs two things from storage: a cheap
//! listing to decide freshness, and the message sequence of one task.

pub mod fs;
pub mod memory;

pub use fs::FileTaskStorage;
pub use memory::InMemoryStorage;

use crate::error::{ParseError, StorageError};
use crate::models::RawMessage;

/// One listed task and the markers used to fingerprint a generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskListing {
    pub task_id: String,
    pub modified_unix_ms: u64,
    pub size_bytes: u64,
}

/// Everything storage knows about one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTask {
    pub task_id: String,
    pub messages: Vec<RawMessage>,
    pub workspace: Option<String>,
    /// Parent recorded by the writer itself, when it recorded one.
    pub declared_parent: Option<String>,
    pub warnings: Vec<String>,
}

pub trait TaskStorage: Send + Sync {
    fn list_tasks(&self) -> Result<Vec<TaskListing>, StorageError>;

    fn load_task(&self, task_id: &str) -> Result<RawTask, ParseError>;

    fn describe(&self) -> String {
        "task storage".to_string()
    }
}

impl<T: TaskStorage + ?Sized> TaskStorage for std::sync::Arc<T> {
    fn list_tasks(&self) -> Result<Vec<TaskListing>, StorageError> {
        (**self).list_tasks()
    }

    fn load_task(&self, task_id: &str) -> Result<RawTask, ParseError> {
        (**self).load_task(task_id)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
