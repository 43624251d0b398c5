//! Typed errors at the store, dispatch and generation boundaries.
//!
//! Orchestration code wraps these in `anyhow` with context; callers that need
//! to branch on the class (lock timeout vs. parse failure, for example) use
//! `downcast_ref`.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::workflow::WorkflowState;

/// Which lock a store operation was waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => f.write_str("shared"),
            LockMode::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// A single invariant or schema violation, naming the offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Path of the offending field, e.g. `stories[3].priority`.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// The lock could not be acquired in time; the caller may retry.
    #[error("timed out after {waited:?} waiting for {mode} lock on {}", .path.display())]
    LockTimeout {
        path: PathBuf,
        mode: LockMode,
        waited: Duration,
    },

    #[error("cancelled while waiting for {mode} lock on {}", .path.display())]
    Cancelled { path: PathBuf, mode: LockMode },

    #[error("task set not found at {}", .path.display())]
    NotFound { path: PathBuf },

    /// The document is not valid JSON. Carries the raw text for repair.
    #[error("parse {}: {message}", .path.display())]
    Parse {
        path: PathBuf,
        message: String,
        raw: String,
    },

    #[error("invalid task set: {0}")]
    Validation(#[from] ValidationError),

    /// Reserved: saves are last-writer-wins and never produce this today.
    #[error("version conflict: expected {expected}, found {found}")]
    VersionConflict { expected: u64, found: u64 },

    #[error("{action} {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            action,
            path: path.into(),
            source,
        }
    }

    /// Short class name used in failure reports.
    pub fn class(&self) -> &'static str {
        match self {
            StoreError::LockTimeout { .. } => "LockTimeout",
            StoreError::Cancelled { .. } => "Cancelled",
            StoreError::NotFound { .. } => "NotFound",
            StoreError::Parse { .. } => "ParseError",
            StoreError::Validation(_) => "ValidationError",
            StoreError::VersionConflict { .. } => "VersionConflict",
            StoreError::Io { .. } => "IoError",
        }
    }
}

/// The delegate could not be run to completion.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("dispatch timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{program} exited with status {code:?}: {stderr_tail}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr_tail: String,
    },

    #[error("dispatch i/o: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("generation dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// No JSON object could be extracted, or it is not valid JSON.
    #[error("malformed generation response: {0}")]
    MalformedResponse(String),

    /// The payload parsed but violates the schema or domain rules.
    #[error("invalid generation response: {0}")]
    InvalidResponse(String),

    #[error("render generation prompt: {0}")]
    Prompt(String),

    #[error(transparent)]
    State(#[from] StateError),
}

impl GenerateError {
    pub fn class(&self) -> &'static str {
        match self {
            GenerateError::Dispatch(_) => "DispatchError",
            GenerateError::MalformedResponse(_) => "MalformedResponse",
            GenerateError::InvalidResponse(_) => "InvalidResponse",
            GenerateError::Prompt(_) => "PromptError",
            GenerateError::State(_) => "StateError",
        }
    }
}

/// A workflow operation was called in a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("workflow is {state}; cannot {operation}")]
pub struct StateError {
    pub state: WorkflowState,
    pub operation: &'static str,
}

/// The bounded repair flow could not produce a parseable task set.
#[derive(Debug, Error)]
#[error("task set at {} still unparseable after {attempts} repair attempts: {last_error}", .path.display())]
pub struct RepairExhausted {
    pub path: PathBuf,
    pub attempts: u32,
    pub last_error: String,
}
