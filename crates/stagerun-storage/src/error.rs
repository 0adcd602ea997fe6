//! Storage errors and their retry classification.

use thiserror::Error;

use stagerun_core::{SubtaskId, TaskId, TaskState};

/// Errors returned by a [`crate::TaskStore`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Task row does not exist.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// Subtask row does not exist.
    #[error("subtask not found: {0}")]
    SubtaskNotFound(SubtaskId),

    /// A task with the same idempotency key already exists.
    #[error("duplicate task key: {0}")]
    DuplicateKey(String),

    /// The persisted state no longer matches what the caller observed; the
    /// write was rejected and storage is unchanged.
    #[error("task {id}: expected state {expected}, found {actual}")]
    StaleState {
        id: TaskId,
        expected: TaskState,
        actual: TaskState,
    },

    /// Rejected input (empty key, empty type, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Transient backend failure (lock contention, network, ...).
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient failures may be retried with backoff; everything else means
    /// the caller must re-read and re-decide.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(StoreError::Unavailable("lock wait timeout".into()).is_retryable());
        assert!(!StoreError::TaskNotFound(TaskId::new(1)).is_retryable());
        assert!(!StoreError::StaleState {
            id: TaskId::new(1),
            expected: TaskState::Pending,
            actual: TaskState::Cancelling,
        }
        .is_retryable());
        assert!(!StoreError::DuplicateKey("k".into()).is_retryable());
    }
}
