//! Error types for environment orchestration.
//!
//! Pollution is not an error: the detector reports it as a value and the
//! orchestrator recovers by wipe + rebuild. Everything here aborts the current
//! unit.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = SeqstateError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum SeqstateError {
    /// A required ancestor unit reported failure while being materialized.
    #[error("prerequisite '{prerequisite}' of unit '{unit}' failed: {detail}")]
    PrerequisiteFailed {
        unit: String,
        prerequisite: String,
        detail: String,
    },

    /// The environment could not be fully deleted.
    #[error("failed to wipe environment '{environment}' at {}: {source}", .path.display())]
    WipeFailed {
        environment: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The current unit's own body failed. No `complete` marker was written.
    #[error("unit '{unit}' failed: {detail}")]
    UnitFailed { unit: String, detail: String },

    #[error("environment '{environment}': {detail}")]
    MarkerContract { environment: String, detail: String },

    #[error("unknown unit '{0}'")]
    UnknownUnit(String),

    #[error("invalid {what} name '{name}' (expected [A-Za-z0-9][A-Za-z0-9_.-]*)")]
    InvalidName { what: String, name: String },

    #[error("invalid suite:\n- {}", .violations.join("\n- "))]
    InvalidSuite { violations: Vec<String> },

    #[error("prerequisite cycle through unit '{0}'")]
    PrerequisiteCycle(String),

    #[error("timed out after {waited_secs}s waiting for lock on environment '{environment}'")]
    LockTimeout {
        environment: String,
        waited_secs: u64,
    },

    #[error("failed to lock environment '{environment}': {source}")]
    Lock {
        environment: String,
        #[source]
        source: io::Error,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl SeqstateError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Attach a context message to `io::Result` values.
pub trait IoContext<T> {
    fn io_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn io_context<F, S>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| SeqstateError::io(context(), source))
    }
}
