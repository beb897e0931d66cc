//! Error types for the engine.
//!
//! Three layers, from innermost out:
//!
//! - [`RemoteError`]: a failed call to the remote run service. Classified by
//!   [`api::retry::classify`](crate::api::retry::classify) so callers can tell
//!   a rate limit or an active-run conflict from a hard failure.
//! - [`ToolError`]: a failed tool handler. The dispatcher turns these into
//!   `Error: ...` result text; they never abort a batch.
//! - [`RelayError`]: the turn-level taxonomy surfaced to callers. Its
//!   [`class`](RelayError::class) drives the bounded turn retry loop.

use crate::api::service::RunStatus;

/// A failed call to the remote run service.
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// HTTP status code, when the service answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// A failed tool handler.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("path '{0}' escapes the project root")]
    PathEscapesRoot(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Command(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("tool '{name}' timed out after {secs} seconds")]
    TimedOut { name: String, secs: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("{0}")]
    Failed(String),
}

impl ToolError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ToolError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Closed classification of turn-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another full turn attempt.
    Transient,
    /// Reported immediately without retrying.
    Terminal,
    /// The caller asked to stop. Never retried, never reported as failure.
    Cancellation,
}

/// Turn-level error surfaced by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("{0}")]
    Validation(String),

    #[error("No remote thread mapped for conversation '{0}'")]
    NotMapped(String),

    #[error("conversation '{0}' not found")]
    NotFound(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("Run failed with status {status}")]
    RunFailed { status: RunStatus },

    #[error("tool dispatch failed: {0}")]
    Dispatch(String),

    #[error("cancelled by user")]
    Cancelled,

    #[error("{0}")]
    Persistence(String),
}

impl RelayError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RelayError::Cancelled => ErrorClass::Cancellation,
            RelayError::Remote(_) | RelayError::RunFailed { .. } | RelayError::Dispatch(_) => {
                ErrorClass::Transient
            }
            RelayError::Validation(_)
            | RelayError::NotMapped(_)
            | RelayError::NotFound(_)
            | RelayError::Persistence(_) => ErrorClass::Terminal,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RelayError::Cancelled)
    }
}
