use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::events::{CloseReason, CompileError};

#[derive(Error, Debug)]
pub enum DebugError {
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: CloseReason },

    #[error("Command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Device is not at its debug prompt; cannot run `{command}`")]
    NotAtPrompt { command: String },

    #[error("Another command (`{pending}`) still owns the console")]
    Busy { pending: String },

    #[error("Breakpoints are locked while the project is staged")]
    BreakpointsLocked,

    #[error("Compile failed with {} error(s)", errors.len())]
    CompileFailure { errors: Vec<CompileError> },

    #[error("Invalid project path {path:?}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Invalid file pattern: {0}")]
    Pattern(#[from] globset::Error),

    #[error("Source map error: {0}")]
    SourceMap(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DebugError {
    pub fn timeout(command: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            command: command.into(),
            timeout,
        }
    }

    pub fn not_at_prompt(command: impl Into<String>) -> Self {
        Self::NotAtPrompt {
            command: command.into(),
        }
    }

    pub fn busy(pending: impl Into<String>) -> Self {
        Self::Busy {
            pending: pending.into(),
        }
    }

    pub fn invalid_path(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Inspection commands hit this routinely while the app is running;
    /// callers poll and treat it as "no data yet" rather than a failure.
    pub fn is_not_at_prompt(&self) -> bool {
        matches!(self, Self::NotAtPrompt { .. })
    }
}

pub type Result<T> = std::result::Result<T, DebugError>;
