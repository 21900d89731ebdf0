//! Error types for the patchwright orchestrator.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level error type for session, sandbox and workflow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The requested project does not exist under the projects root.
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    /// No live session with this id.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// A turn is already in flight for this session.
    #[error("session busy: {0}")]
    SessionBusy(String),

    /// Failed to create a sandbox.
    #[error("failed to create sandbox: {0}")]
    SandboxCreation(String),

    /// Failed to clean up a sandbox.
    #[error("failed to clean up sandbox at {path}: {reason}")]
    SandboxCleanup { path: PathBuf, reason: String },

    /// The model transport failed.
    #[error("model request failed: {0}")]
    Model(String),

    /// The model did not answer within the configured timeout.
    #[error("model request timed out after {0:?}")]
    ModelTimeout(Duration),

    /// The model response did not contain a usable structured payload.
    #[error("unparseable model response: {message}")]
    ResponseFormat {
        message: String,
        /// Truncated excerpt of the raw response.
        excerpt: String,
    },

    /// A tool call was rejected or failed.
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Reading a tree for diffing failed.
    #[error("failed to compute diff at {path}: {source}")]
    DiffComputation {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unknown workflow identifier.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// IO error during sandbox operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum length of a raw response excerpt carried in errors.
pub const EXCERPT_LIMIT: usize = 500;

impl Error {
    /// Builds a [`Error::ResponseFormat`] with a truncated excerpt of `raw`.
    pub fn response_format(message: impl Into<String>, raw: &str) -> Self {
        Self::ResponseFormat {
            message: message.into(),
            excerpt: truncate_chars(raw, EXCERPT_LIMIT),
        }
    }

    /// Maps the error onto the reporting taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::ProjectNotFound(_) | Error::SessionNotFound(_) | Error::SessionBusy(_) => {
                ErrorCategory::Session
            }
            Error::SandboxCreation(_) | Error::SandboxCleanup { .. } | Error::Io(_) => {
                ErrorCategory::Sandbox
            }
            Error::Model(_) | Error::ModelTimeout(_) => ErrorCategory::Model,
            Error::ResponseFormat { .. } => ErrorCategory::ResponseFormat,
            Error::Tool(_) => ErrorCategory::Tool,
            Error::DiffComputation { .. } => ErrorCategory::Diff,
            Error::UnknownWorkflow(_) | Error::Config(_) => ErrorCategory::Config,
        }
    }
}

/// Coarse error classes reported to callers for failed turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Session,
    Sandbox,
    Model,
    ResponseFormat,
    Tool,
    Diff,
    Config,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Session => "session",
            ErrorCategory::Sandbox => "sandbox",
            ErrorCategory::Model => "model",
            ErrorCategory::ResponseFormat => "response_format",
            ErrorCategory::Tool => "tool",
            ErrorCategory::Diff => "diff",
            ErrorCategory::Config => "config",
        };
        f.write_str(name)
    }
}

/// Errors raised by the sandbox tool layer.
#[derive(Error, Debug)]
pub enum ToolError {
    /// The model asked for a tool outside the capability set.
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    /// Tool parameters were missing or malformed.
    #[error("invalid parameters for {tool}: {reason}")]
    InvalidParameters { tool: String, reason: String },

    /// A path resolved outside the sandbox root.
    #[error("path escapes sandbox root: {0}")]
    PathEscape(String),

    /// The target file or directory does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An edit anchor was missing or ambiguous.
    #[error("edit rejected for {path}: {reason}")]
    EditRejected { path: String, reason: String },

    /// IO failure while executing the tool.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// Returns true if the error should be reported as a security event.
    pub fn is_security_event(&self) -> bool {
        matches!(self, ToolError::PathEscape(_))
    }
}

/// Truncates to at most `limit` characters, respecting char boundaries.
pub(crate) fn truncate_chars(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
