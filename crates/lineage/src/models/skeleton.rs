use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SKELETON_SCHEMA_VERSION: &str = "lineage.skeleton.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimestampQuality {
    /// Taken from the log itself.
    Exact,
    /// The log had no usable timestamp; the clock supplied one.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SkeletonMetadata {
    pub created_at_unix_ms: u64,
    pub last_activity_unix_ms: u64,
    pub timestamp_quality: TimestampQuality,
    pub message_count: usize,
    pub action_count: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace: Option<String>,
}

/// Structured summary of one conversation, the unit of reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ConversationSkeleton {
    pub task_id: String,

    /// Only ever written by the resolution engine.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,

    pub opening_instruction: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_spawn_prefixes: Vec<String>,

    pub is_completed: bool,
    pub metadata: SkeletonMetadata,
}

impl ConversationSkeleton {
    #[must_use]
    pub const fn created_at(&self) -> u64 {
        self.metadata.created_at_unix_ms
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_task_id.is_none()
    }

    /// Approximate heap footprint, used by the cache's memory ceiling.
    #[must_use]
    pub fn retained_bytes(&self) -> usize {
        let strings = self.task_id.len()
            + self.parent_task_id.as_ref().map_or(0, String::len)
            + self.opening_instruction.len()
            + self
                .child_spawn_prefixes
                .iter()
                .map(|prefix| prefix.len() + std::mem::size_of::<String>())
                .sum::<usize>()
            + self.metadata.workspace.as_ref().map_or(0, String::len);
        std::mem::size_of::<Self>() + strings
    }
}

#[must_use]
pub fn skeleton_json_schema() -> Value {
    let schema = schemars::schema_for!(ConversationSkeleton);
    match serde_json::to_value(schema) {
        Ok(value) => value,
        Err(error) => {
            panic!("failed to serialize generated skeleton schema: {error}");
        }
    }
}
