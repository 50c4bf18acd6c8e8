//! Error taxonomy for the task engine.
//!
//! Lifecycle actions validate locally and return the specific error kind to
//! the caller without retrying; resubmission of work is always an explicit
//! Retry/Skip decision.

use thiserror::Error;

/// Errors surfaced by lifecycle actions and the dispatcher.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed request or a task with an empty/inconsistent step sequence.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Persistence failure from the task store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Broker unreachable or rejected enqueue.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    /// Retry/Skip attempted from a status that does not allow it.
    #[error("cannot {action} task {task_id}: {reason}")]
    StateConflict {
        task_id: String,
        action: &'static str,
        reason: String,
    },
}

/// Errors from the task store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} already exists")]
    AlreadyExists { kind: &'static str, id: String },

    /// Update would persist a task that violates its own invariants.
    #[error("task {task_id} update rejected: {reason}")]
    InvalidTask { task_id: String, reason: String },

    /// Compare-and-swap update lost against a concurrent writer.
    #[error("task {task_id} version conflict (expected {expected})")]
    VersionConflict { task_id: String, expected: i64 },

    #[error("database error: {0}")]
    Backend(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
