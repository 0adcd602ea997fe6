//! The global task row.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TaskId, TaskState};

/// Step value of a task before its strategy has planned any stage.
pub const STEP_INIT: i64 = 0;
/// First stage planned by a strategy.
pub const STEP_ONE: i64 = 1;
/// Second stage planned by a strategy.
pub const STEP_TWO: i64 = 2;

/// A Task is a user-submitted unit of work driven through a multi-stage
/// lifecycle by the dispatcher.
///
/// The row is created by external submission in Pending and mutated only by
/// the driver that owns it; steps only move forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Storage-assigned identifier.
    pub id: TaskId,

    /// User-chosen idempotency key, unique across all tasks.
    pub key: String,

    /// Task type, selects the registered strategy.
    pub task_type: String,

    /// Current task state.
    pub state: TaskState,

    /// Current stage counter, monotone non-decreasing.
    pub step: i64,

    /// Requested subtask concurrency; 0 means "use the default".
    pub concurrency: u32,

    /// When the first dispatch happened.
    pub start_time: Option<DateTime<Utc>>,

    /// When the state last changed.
    pub state_update_time: Option<DateTime<Utc>>,

    /// Opaque payload handed to the strategy.
    pub meta: Vec<u8>,

    /// Error blob, populated when the task fails.
    pub error: Option<String>,
}

impl Task {
    /// Create a new unsubmitted Task in Pending.
    pub fn new(
        key: impl Into<String>,
        task_type: impl Into<String>,
        concurrency: u32,
        meta: Vec<u8>,
    ) -> Self {
        Self {
            id: TaskId::default(),
            key: key.into(),
            task_type: task_type.into(),
            state: TaskState::Pending,
            step: STEP_INIT,
            concurrency,
            start_time: None,
            state_update_time: None,
            meta,
            error: None,
        }
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("import-42", "example", 0, b"payload".to_vec());
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.step, STEP_INIT);
        assert_eq!(task.concurrency, 0);
        assert!(task.start_time.is_none());
        assert!(task.error.is_none());
        assert!(!task.is_terminal());
    }

    #[test]
    fn test_terminal_check_follows_state() {
        let mut task = Task::new("k", "example", 0, Vec::new());
        task.state = TaskState::Succeed;
        assert!(task.is_terminal());
        task.state = TaskState::Reverting;
        assert!(!task.is_terminal());
    }
}
