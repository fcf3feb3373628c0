//! Turns one conversation's message sequence into a [`ConversationSkeleton`].

use std::collections::HashSet;

use serde::Serialize;

use crate::error::SkeletonValidationError;
use crate::models::{
    ConversationSkeleton, MessageOrigin, RawMessage, SignalKind, SkeletonMetadata,
    TimestampQuality,
};
use crate::storage::RawTask;
use crate::utils::text::{DEFAULT_MAX_CHARS, canonical_len, extract_delimited, normalize};
use crate::utils::time::Clock;

/// Tool names that start a subtask.
pub const SPAWN_TOOLS: &[&str] = &["newTask", "new_task"];

/// Tag wrapping the instruction inside a request-start payload.
pub const INSTRUCTION_TAG: &str = "task";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformOptions {
    pub max_len: usize,
    pub strict: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_CHARS,
            strict: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructionSource {
    RequestStart,
    FirstUserMessage,
    Missing,
}

/// Per-conversation facts about how the skeleton was derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformMetadata {
    pub instruction_source: InstructionSource,
    pub spawn_invocations: usize,
    pub duplicate_prefixes_dropped: usize,
    pub empty_spawn_messages: usize,
    pub first_signal: Option<SignalKind>,
    pub timestamp_quality: TimestampQuality,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub skeleton: ConversationSkeleton,
    pub metadata: TransformMetadata,
}

/// Builds the skeleton for `task_id`.
///
/// Never fails unless `options.strict` is set, in which case the finished
/// skeleton is checked with [`validate_skeleton`].
pub fn transform(
    messages: &[RawMessage],
    task_id: &str,
    workspace: Option<&str>,
    options: &TransformOptions,
    clock: &dyn Clock,
) -> Result<TransformOutput, SkeletonValidationError> {
    let mut warnings = Vec::new();
    let (opening_instruction, instruction_source) =
        extract_opening_instruction(messages, options.max_len);
    if instruction_source == InstructionSource::Missing {
        warnings.push("no opening instruction found".to_string());
    }

    let spawns = extract_spawn_prefixes(messages, options.max_len);
    if spawns.empty_messages > 0 {
        warnings.push(format!(
            "{} spawn invocation(s) carried no usable message",
            spawns.empty_messages
        ));
    }

    let first_signal = messages.iter().find_map(|message| match message {
        RawMessage::Signal { signal, .. } => Some(*signal),
        _ => None,
    });

    let action_count = messages
        .iter()
        .filter(|message| message.is_tool_invocation())
        .count();

    let earliest = messages.iter().filter_map(RawMessage::timestamp_ms).min();
    let latest = messages.iter().filter_map(RawMessage::timestamp_ms).max();
    let (created_at_unix_ms, last_activity_unix_ms, timestamp_quality) = match (earliest, latest)
    {
        (Some(earliest), Some(latest)) => (earliest, latest, TimestampQuality::Exact),
        _ => {
            let now = clock.now_unix_ms();
            warnings.push("no timestamps in log; using clock fallback".to_string());
            (now, now, TimestampQuality::Fallback)
        }
    };

    let skeleton = ConversationSkeleton {
        task_id: task_id.to_string(),
        parent_task_id: None,
        opening_instruction,
        child_spawn_prefixes: spawns.prefixes,
        is_completed: first_signal.is_some(),
        metadata: SkeletonMetadata {
            created_at_unix_ms,
            last_activity_unix_ms,
            timestamp_quality,
            message_count: messages.len(),
            action_count,
            workspace: workspace.map(str::to_string),
        },
    };

    if options.strict {
        validate_skeleton(&skeleton, options.max_len)?;
    }

    Ok(TransformOutput {
        skeleton,
        metadata: TransformMetadata {
            instruction_source,
            spawn_invocations: spawns.invocations,
            duplicate_prefixes_dropped: spawns.duplicates,
            empty_spawn_messages: spawns.empty_messages,
            first_signal,
            timestamp_quality,
            warnings,
        },
    })
}

/// [`transform`] over a task loaded from storage; storage warnings are
/// carried into the metadata.
pub fn transform_task(
    task: &RawTask,
    options: &TransformOptions,
    clock: &dyn Clock,
) -> Result<TransformOutput, SkeletonValidationError> {
    let mut output = transform(
        &task.messages,
        &task.task_id,
        task.workspace.as_deref(),
        options,
        clock,
    )?;
    let mut warnings = task.warnings.clone();
    warnings.append(&mut output.metadata.warnings);
    output.metadata.warnings = warnings;
    Ok(output)
}

pub fn validate_skeleton(
    skeleton: &ConversationSkeleton,
    max_len: usize,
) -> Result<(), SkeletonValidationError> {
    if skeleton.task_id.trim().is_empty() {
        return Err(SkeletonValidationError::EmptyTaskId);
    }

    let instruction_length = canonical_len(&skeleton.opening_instruction);
    if instruction_length > max_len {
        return Err(SkeletonValidationError::InstructionTooLong {
            task_id: skeleton.task_id.clone(),
            length: instruction_length,
            max_len,
        });
    }

    let mut seen = HashSet::new();
    for (index, prefix) in skeleton.child_spawn_prefixes.iter().enumerate() {
        let length = canonical_len(prefix);
        if length > max_len {
            return Err(SkeletonValidationError::PrefixTooLong {
                task_id: skeleton.task_id.clone(),
                index,
                length,
                max_len,
            });
        }
        if !seen.insert(prefix.as_str()) {
            return Err(SkeletonValidationError::DuplicatePrefix {
                task_id: skeleton.task_id.clone(),
                prefix: prefix.clone(),
            });
        }
    }

    Ok(())
}

fn extract_opening_instruction(
    messages: &[RawMessage],
    max_len: usize,
) -> (String, InstructionSource) {
    let from_request = messages.iter().find_map(|message| match message {
        RawMessage::RequestStart { request, .. } => extract_delimited(request, INSTRUCTION_TAG)
            .map(|inner| normalize(inner, max_len))
            .filter(|normalized| !normalized.is_empty()),
        _ => None,
    });
    if let Some(instruction) = from_request {
        return (instruction, InstructionSource::RequestStart);
    }

    let from_user = messages.iter().find_map(|message| match message {
        RawMessage::FreeText {
            origin: MessageOrigin::User,
            text,
            ..
        } => Some(normalize(text, max_len)).filter(|normalized| !normalized.is_empty()),
        _ => None,
    });
    match from_user {
        Some(instruction) => (instruction, InstructionSource::FirstUserMessage),
        None => (String::new(), InstructionSource::Missing),
    }
}

struct SpawnScan {
    prefixes: Vec<String>,
    invocations: usize,
    duplicates: usize,
    empty_messages: usize,
}

fn extract_spawn_prefixes(messages: &[RawMessage], max_len: usize) -> SpawnScan {
    let mut scan = SpawnScan {
        prefixes: Vec::new(),
        invocations: 0,
        duplicates: 0,
        empty_messages: 0,
    };
    let mut seen = HashSet::new();

    for message in messages {
        let RawMessage::ToolInvocation { tool, message, .. } = message else {
            continue;
        };
        if !SPAWN_TOOLS.contains(&tool.as_str()) {
            continue;
        }
        scan.invocations += 1;

        let normalized = message
            .as_deref()
            .map(|text| normalize(text, max_len))
            .unwrap_or_default();
        if normalized.is_empty() {
            scan.empty_messages += 1;
            continue;
        }
        if seen.contains(&normalized) {
            scan.duplicates += 1;
            continue;
        }
        seen.insert(normalized.clone());
        scan.prefixes.push(normalized);
    }

    scan
}
