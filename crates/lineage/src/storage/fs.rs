use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde_json::Value;
use tracing::debug;

use super::{RawTask, TaskListing, TaskStorage};
use crate::adapters::{LogFormat, all_log_formats, parse_log_file};
use crate::error::{ParseError, StorageError};
use crate::utils::content;

pub const TASK_METADATA_FILE: &str = "task_metadata.json";

/// Task directories under one root: `<root>/<task_id>/{ui_messages.json,
/// api_conversation_history.json, task_metadata.json}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTaskStorage {
    root: PathBuf,
}

impl FileTaskStorage {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join(task_id)
    }
}

impl TaskStorage for FileTaskStorage {
    fn list_tasks(&self) -> Result<Vec<TaskListing>, StorageError> {
        let entries = std::fs::read_dir(&self.root).map_err(|error| StorageError::Unreachable {
            path: self.root.clone(),
            reason: error.to_string(),
        })?;

        let mut listings = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| StorageError::Listing {
                reason: format!("failed to read entry under {}: {error}", self.root.display()),
            })?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(task_id) = path.file_name().and_then(std::ffi::OsStr::to_str) else {
                debug!(path = %path.display(), "skipping task directory with non-utf8 name");
                continue;
            };

            match directory_markers(&path) {
                Some((modified_unix_ms, size_bytes)) => listings.push(TaskListing {
                    task_id: task_id.to_string(),
                    modified_unix_ms,
                    size_bytes,
                }),
                None => {
                    debug!(path = %path.display(), "skipping directory without a message log");
                }
            }
        }

        listings.sort();
        Ok(listings)
    }

    fn load_task(&self, task_id: &str) -> Result<RawTask, ParseError> {
        if !is_plain_task_id(task_id) {
            return Err(ParseError::MissingTask {
                task_id: task_id.to_string(),
            });
        }
        let dir = self.task_dir(task_id);
        if !dir.is_dir() {
            return Err(ParseError::MissingTask {
                task_id: task_id.to_string(),
            });
        }

        let format = all_log_formats()
            .into_iter()
            .find(|format| dir.join(format.file_name()).is_file())
            .ok_or_else(|| ParseError::NoMessageLog {
                task_id: task_id.to_string(),
            })?;
        let parsed = parse_log_file(format, &dir.join(format.file_name()))?;

        let mut warnings = parsed.warnings;
        let (workspace, declared_parent) = read_task_metadata(&dir, &mut warnings);
        if format == LogFormat::ApiHistory {
            warnings.push(format!(
                "{} missing; fell back to {}",
                LogFormat::UiMessages.file_name(),
                format.file_name()
            ));
        }

        Ok(RawTask {
            task_id: task_id.to_string(),
            messages: parsed.messages,
            workspace,
            declared_parent,
            warnings,
        })
    }

    fn describe(&self) -> String {
        format!("filesystem storage at {}", self.root.display())
    }
}

fn is_plain_task_id(task_id: &str) -> bool {
    !task_id.is_empty()
        && task_id != "."
        && task_id != ".."
        && !task_id.contains(['/', '\\'])
}

// Newest mtime and total size over the files that feed a skeleton. `None`
// when the directory holds no message log at all.
fn directory_markers(dir: &Path) -> Option<(u64, u64)> {
    let mut has_log = false;
    let mut newest = 0_u64;
    let mut total = 0_u64;
    let names = all_log_formats()
        .map(LogFormat::file_name)
        .into_iter()
        .chain(std::iter::once(TASK_METADATA_FILE));

    for name in names {
        let Ok(metadata) = std::fs::metadata(dir.join(name)) else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        if name != TASK_METADATA_FILE {
            has_log = true;
        }
        total += metadata.len();
        let modified = metadata
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |duration| {
                u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
            });
        newest = newest.max(modified);
    }

    has_log.then_some((newest, total))
}

fn read_task_metadata(dir: &Path, warnings: &mut Vec<String>) -> (Option<String>, Option<String>) {
    let path = dir.join(TASK_METADATA_FILE);
    let Ok(raw) = std::fs::read_to_string(&path) else {
        return (None, None);
    };
    let object = match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(object)) => object,
        Ok(_) => {
            warnings.push(format!("{TASK_METADATA_FILE}: root must be an object; ignored"));
            return (None, None);
        }
        Err(error) => {
            warnings.push(format!("{TASK_METADATA_FILE}: invalid JSON ({error}); ignored"));
            return (None, None);
        }
    };

    let workspace = content::string_field(&object, "workspace");
    let declared_parent = content::string_field(&object, "parentTaskId")
        .or_else(|| content::string_field(&object, "parent_task_id"));
    (workspace, declared_parent)
}
