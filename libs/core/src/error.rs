//! # Domain error taxonomy
//!
//! Every component returns `PipelineError`; only the API layer translates to
//! HTTP. Retries happen at the point that can tell transient from permanent.

use thiserror::Error;

/// Error kinds of the orchestration pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    // === Submission & validation ===
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("not found: {what}")]
    NotFound { what: String },

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("authentication failed: {reason}")]
    Auth { reason: String },

    // === Remote Bakta API ===
    #[error("transient remote failure: {reason}")]
    RemoteTransient { reason: String },

    /// Non-retryable remote failures, including responses that fail the
    /// expected-field validation.
    #[error("permanent remote failure: {reason}")]
    RemotePermanent { reason: String },

    // === Persistence ===
    #[error("storage failure: {reason}")]
    Storage { reason: String },

    // === Deadlines ===
    #[error("timed out: {reason}")]
    Timeout { reason: String },

    // === Invariant violations ===
    #[error("fatal invariant violation: {reason}")]
    Fatal { reason: String },
}

impl PipelineError {
    pub fn storage(e: impl std::fmt::Display) -> Self {
        Self::Storage { reason: e.to_string() }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidInput { reason: reason.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Whether the caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RemoteTransient { .. } | Self::Storage { .. })
    }

    /// Short machine code for the wire error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Auth { .. } => "auth_error",
            Self::RemoteTransient { .. } => "remote_transient",
            Self::RemotePermanent { .. } => "remote_permanent",
            Self::Storage { .. } => "storage",
            Self::Timeout { .. } => "timeout",
            Self::Fatal { .. } => "fatal",
        }
    }
}

/// Cap stored error messages so a runaway stack trace never bloats a job row.
pub const MAX_STORED_ERROR_LEN: usize = 2000;

/// Truncates an error message to [`MAX_STORED_ERROR_LEN`] on a char boundary.
pub fn truncate_error(msg: &str) -> String {
    if msg.len() <= MAX_STORED_ERROR_LEN {
        return msg.to_string();
    }
    let mut end = MAX_STORED_ERROR_LEN;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &msg[..end])
}
