//! Error types for the anton kernel.
//!
//! A single [`Error`] enum covers every failure the kernel can surface to a
//! caller. Most failures never escape the run loop; they are folded into
//! attempt records, so the variants here are the ones a caller can actually
//! observe: invalid task files, lock contention, and runtime setup failures,
//! plus the session/git/command variants the controller matches on
//! internally.

use std::path::PathBuf;

use thiserror::Error;

/// A type alias for `Result<T, anton::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a session failure, used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// Transient infrastructure failure: connection refused, 503,
    /// model still loading. Recovered once per attempt without
    /// consuming a retry.
    Infra,
    /// The session exhausted its iteration cap before answering.
    MaxIterations,
    /// The session observed the abort signal and cancelled.
    Aborted,
    /// A stage or attempt timer fired.
    Timeout,
    /// Any other session failure.
    Other,
}

/// The error type for anton operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The task file could not be parsed into a checklist.
    #[error("task file '{path}' is invalid: {detail}")]
    TaskFileInvalid {
        /// Path to the offending file.
        path: PathBuf,
        /// What made it unreadable.
        detail: String,
    },

    /// A mutation referenced a task key that is not in the file.
    #[error("unknown task key '{0}'")]
    UnknownTask(String),

    /// Another anton process holds the lock for this task file.
    #[error("anton lock '{path}' is held by pid {pid}; remove the file if that process is gone")]
    LockHeld {
        /// Path to the lock file.
        path: PathBuf,
        /// Pid recorded in the lock file.
        pid: u32,
    },

    /// The agent session failed.
    #[error("agent session failed: {message}")]
    Session {
        /// Failure classification for the retry policy.
        kind: SessionErrorKind,
        /// The underlying message.
        message: String,
    },

    /// The agent runtime could not be brought up even after a restart.
    #[error("agent runtime not ready: {0}")]
    RuntimeNotReady(String),

    /// A git command failed.
    #[error("git {command} failed: {stderr}")]
    Git {
        /// The git subcommand that was run.
        command: String,
        /// Captured stderr.
        stderr: String,
    },

    /// A verification command could not be spawned.
    #[error("command '{command}' could not be run: {message}")]
    Command {
        /// The command line.
        command: String,
        /// The spawn failure.
        message: String,
    },

    /// Invalid run configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The vault backend failed.
    #[error("vault error: {0}")]
    Vault(String),

    /// JSON serialization or deserialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a session error with an explicit classification.
    #[must_use]
    pub fn session(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self::Session {
            kind,
            message: message.into(),
        }
    }

    /// Create a transient infrastructure session error.
    #[must_use]
    pub fn infra(message: impl Into<String>) -> Self {
        Self::session(SessionErrorKind::Infra, message)
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error should be recovered through `ensure_runtime_ready`
    /// rather than consuming a retry.
    ///
    /// Typed classification is authoritative; message sniffing remains only
    /// as a compatibility fallback for sessions that report `Other`.
    #[must_use]
    pub fn is_infra(&self) -> bool {
        match self {
            Self::Session {
                kind: SessionErrorKind::Infra,
                ..
            } => true,
            Self::Session {
                kind: SessionErrorKind::Other,
                message,
            } => {
                let lower = message.to_ascii_lowercase();
                lower.contains("connection refused")
                    || lower.contains("503")
                    || lower.contains("model is loading")
            }
            _ => false,
        }
    }

    /// Whether this error is a session iteration-cap exhaustion.
    #[must_use]
    pub const fn is_max_iterations(&self) -> bool {
        matches!(
            self,
            Self::Session {
                kind: SessionErrorKind::MaxIterations,
                ..
            }
        )
    }

    /// Whether this error came from the abort signal.
    #[must_use]
    pub const fn is_aborted(&self) -> bool {
        matches!(
            self,
            Self::Session {
                kind: SessionErrorKind::Aborted,
                ..
            }
        )
    }

    /// Whether this error is a stage or attempt timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Session {
                kind: SessionErrorKind::Timeout,
                ..
            }
        )
    }
}
