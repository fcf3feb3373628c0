pub mod api_history;
pub mod ui_messages;

use std::path::Path;

use crate::error::ParseError;
use crate::models::RawMessage;

/// Messages recovered from one log file plus per-entry diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedLog {
    pub messages: Vec<RawMessage>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogFormat {
    UiMessages,
    ApiHistory,
}

impl LogFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UiMessages => "ui_messages",
            Self::ApiHistory => "api_history",
        }
    }

    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::UiMessages => ui_messages::FILE_NAME,
            Self::ApiHistory => api_history::FILE_NAME,
        }
    }
}

/// Formats in lookup order: the UI log records spawns and completion
/// signals directly, the API transcript is the fallback.
#[must_use]
pub const fn all_log_formats() -> [LogFormat; 2] {
    [LogFormat::UiMessages, LogFormat::ApiHistory]
}

pub fn parse_log(format: LogFormat, input: &str, source_name: &str) -> Result<ParsedLog, ParseError> {
    match format {
        LogFormat::UiMessages => ui_messages::parse_ui_messages(input, source_name),
        LogFormat::ApiHistory => api_history::parse_api_history(input, source_name),
    }
}

pub fn parse_log_file(format: LogFormat, path: &Path) -> Result<ParsedLog, ParseError> {
    match format {
        LogFormat::UiMessages => ui_messages::parse_ui_messages_file(path),
        LogFormat::ApiHistory => api_history::parse_api_history_file(path),
    }
}
