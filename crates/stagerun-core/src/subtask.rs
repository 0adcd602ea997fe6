//! The subtask row: one shard of a task's current stage.

use serde::{Deserialize, Serialize};

use crate::{SubtaskId, SubtaskState, TaskId};

/// A Subtask belongs to exactly one stage of one task and is executed by a
/// single worker node. The dispatcher creates rows in Pending (forward
/// stages) or RevertPending (rollback); worker executors advance them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    /// Storage-assigned identifier.
    pub id: SubtaskId,

    /// Owning task.
    pub task_id: TaskId,

    /// Task step during which this subtask was created.
    pub step: i64,

    /// Task type, copied from the owning task.
    pub task_type: String,

    /// Canonical `ip:port` of the node this subtask is assigned to.
    pub scheduler_id: String,

    /// Current subtask state.
    pub state: SubtaskState,

    /// Opaque payload produced by the strategy.
    pub meta: Vec<u8>,

    /// Error blob, populated by the executor on failure.
    pub error: Option<String>,
}

impl Subtask {
    /// Create a forward-stage subtask in Pending.
    pub fn new(
        task_id: TaskId,
        step: i64,
        task_type: impl Into<String>,
        scheduler_id: impl Into<String>,
        meta: Vec<u8>,
    ) -> Self {
        Self {
            id: SubtaskId::default(),
            task_id,
            step,
            task_type: task_type.into(),
            scheduler_id: scheduler_id.into(),
            state: SubtaskState::Pending,
            meta,
            error: None,
        }
    }

    /// Create a rollback subtask in RevertPending.
    pub fn new_revert(
        task_id: TaskId,
        step: i64,
        task_type: impl Into<String>,
        scheduler_id: impl Into<String>,
        meta: Vec<u8>,
    ) -> Self {
        Self {
            state: SubtaskState::RevertPending,
            ..Self::new(task_id, step, task_type, scheduler_id, meta)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_subtask_is_pending() {
        let st = Subtask::new(TaskId::new(1), 1, "example", "10.0.0.1:4000", b"m".to_vec());
        assert_eq!(st.state, SubtaskState::Pending);
        assert_eq!(st.task_id, TaskId::new(1));
        assert_eq!(st.scheduler_id, "10.0.0.1:4000");
    }

    #[test]
    fn test_revert_subtask_is_revert_pending() {
        let st = Subtask::new_revert(TaskId::new(1), 1, "example", "10.0.0.1:4000", Vec::new());
        assert_eq!(st.state, SubtaskState::RevertPending);
        assert!(st.state.is_revert_active());
    }
}
