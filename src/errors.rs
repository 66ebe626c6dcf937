use std::time::Duration;
use thiserror::Error;

/// Pipeline error kinds. Policy code matches on these to decide between
/// retry, skip, quarantine and abort; `anyhow` carries them across the
/// public seams with context attached.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("stale supplier authentication: {0}")]
    StaleAuth(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("corrupt cache file {path}: {detail}")]
    Corruption { path: String, detail: String },

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("needs intervention: {0}")]
    NeedsIntervention(String),
}

impl PipelineError {
    /// Recoverable locally: the pipeline continues with the next product.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::TransientNetwork(_)
                | PipelineError::RateLimited { .. }
                | PipelineError::ParseFailure(_)
                | PipelineError::StaleAuth(_)
                | PipelineError::InvariantViolation(_)
                | PipelineError::Corruption { .. }
        )
    }

    /// Process exit code for errors that surface to the user.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::NeedsIntervention(_) => 2,
            _ => 1,
        }
    }
}

/// Terminal status of a pipeline run, mapped onto the CLI exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Completed (or supplier already ready and fresh).
    Success,
    Failed,
    NeedsIntervention,
    Interrupted,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failed => 1,
            RunStatus::NeedsIntervention => 2,
            RunStatus::Interrupted => 130,
        }
    }
}
