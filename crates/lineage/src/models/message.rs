use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Completion,
    Error,
    TerminalResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    User,
    Assistant,
    System,
}

/// One entry of a conversation log, classified by what it means for
/// hierarchy reconstruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawMessage {
    /// Request sent to the model; the first one carries the task instruction.
    RequestStart {
        timestamp_ms: Option<u64>,
        request: String,
    },
    ToolInvocation {
        timestamp_ms: Option<u64>,
        tool: String,
        /// Free text the tool was asked to act on (a subtask's instruction
        /// for spawn tools).
        message: Option<String>,
        mode: Option<String>,
    },
    Signal {
        timestamp_ms: Option<u64>,
        signal: SignalKind,
    },
    FreeText {
        timestamp_ms: Option<u64>,
        origin: MessageOrigin,
        text: String,
    },
    Other {
        timestamp_ms: Option<u64>,
        label: String,
    },
}

impl RawMessage {
    #[must_use]
    pub const fn timestamp_ms(&self) -> Option<u64> {
        match self {
            Self::RequestStart { timestamp_ms, .. }
            | Self::ToolInvocation { timestamp_ms, .. }
            | Self::Signal { timestamp_ms, .. }
            | Self::FreeText { timestamp_ms, .. }
            | Self::Other { timestamp_ms, .. } => *timestamp_ms,
        }
    }

    #[must_use]
    pub const fn is_tool_invocation(&self) -> bool {
        matches!(self, Self::ToolInvocation { .. })
    }

    #[must_use]
    pub fn request(timestamp_ms: Option<u64>, request: impl Into<String>) -> Self {
        Self::RequestStart {
            timestamp_ms,
            request: request.into(),
        }
    }

    #[must_use]
    pub fn spawn(timestamp_ms: Option<u64>, tool: &str, message: impl Into<String>) -> Self {
        Self::ToolInvocation {
            timestamp_ms,
            tool: tool.to_string(),
            message: Some(message.into()),
            mode: None,
        }
    }

    #[must_use]
    pub fn user_text(timestamp_ms: Option<u64>, text: impl Into<String>) -> Self {
        Self::FreeText {
            timestamp_ms,
            origin: MessageOrigin::User,
            text: text.into(),
        }
    }

    #[must_use]
    pub const fn signal(timestamp_ms: Option<u64>, signal: SignalKind) -> Self {
        Self::Signal {
            timestamp_ms,
            signal,
        }
    }
}
