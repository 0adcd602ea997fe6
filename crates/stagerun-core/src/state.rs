//! State enums for Tasks and Subtasks, and the task transition rules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a Task in the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Task created but not yet dispatched.
    #[default]
    Pending,
    /// Task has outstanding subtasks for its current stage.
    Running,
    /// Task completed successfully.
    Succeed,
    /// Rollback subtasks are in flight.
    Reverting,
    /// Rollback finished.
    Reverted,
    /// Task failed (planning error or unsupported type).
    Failed,
    /// Reserved sink; the dispatcher never produces it.
    RevertFailed,
    /// A cancel request was observed; rollback not yet dispatched.
    Cancelling,
    /// Reserved sink; the dispatcher never produces it.
    Cancelled,
    /// A pause request was observed; waiting for the stage to drain.
    Pausing,
    /// Task is paused and has no owning driver.
    Paused,
    /// A resume request was observed; about to re-enter Running.
    Resuming,
    /// Reserved sink; the dispatcher never produces it.
    RevertPending,
}

impl TaskState {
    /// Returns true if the task state is terminal: the row is immutable and
    /// the owning driver exits.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeed
                | Self::Reverted
                | Self::Failed
                | Self::RevertFailed
                | Self::Cancelled
                | Self::RevertPending
        )
    }

    /// Returns true if the `self -> to` transition is legal.
    ///
    /// Identity transitions are always legal (re-persisting the same state is
    /// a no-op from the state machine's point of view). Cancellation flows
    /// through rollback, and pause/resume round-trips back to Running.
    pub fn can_transition_to(&self, to: TaskState) -> bool {
        if *self == to {
            return true;
        }
        match self {
            Self::Pending => matches!(
                to,
                Self::Running | Self::Cancelling | Self::Pausing | Self::Succeed | Self::Failed
            ),
            Self::Running => matches!(
                to,
                Self::Succeed | Self::Reverting | Self::Failed | Self::Cancelling | Self::Pausing
            ),
            Self::Reverting => matches!(to, Self::Reverted),
            Self::Cancelling => matches!(to, Self::Reverting),
            Self::Pausing => matches!(to, Self::Paused),
            Self::Paused => matches!(to, Self::Resuming),
            Self::Resuming => matches!(to, Self::Running),
            Self::Succeed
            | Self::Reverted
            | Self::Failed
            | Self::RevertFailed
            | Self::Cancelled
            | Self::RevertPending => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeed => "succeed",
            Self::Reverting => "reverting",
            Self::Reverted => "reverted",
            Self::Failed => "failed",
            Self::RevertFailed => "revert_failed",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Resuming => "resuming",
            Self::RevertPending => "revert_pending",
        };
        f.write_str(name)
    }
}

/// State of a Subtask on a worker node.
///
/// Subtask states are advanced by the worker executors; the dispatcher only
/// creates rows (Pending or RevertPending) and observes the rest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubtaskState {
    /// Subtask created, not yet picked up by its node.
    #[default]
    Pending,
    /// Subtask executing on its node.
    Running,
    /// Subtask finished successfully.
    Succeed,
    /// Subtask failed; its error blob is populated.
    Failed,
    /// Rollback subtask created, not yet picked up.
    RevertPending,
    /// Rollback executing on its node.
    Reverting,
    /// Rollback finished.
    Reverted,
    /// Subtask was cancelled.
    Cancelled,
    /// Subtask is paused.
    Paused,
}

impl SubtaskState {
    /// Returns true while the forward stage still holds this subtask.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Returns true while the rollback stage still holds this subtask.
    pub fn is_revert_active(&self) -> bool {
        matches!(self, Self::RevertPending | Self::Reverting)
    }
}

impl fmt::Display for SubtaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeed => "succeed",
            Self::Failed => "failed",
            Self::RevertPending => "revert_pending",
            Self::Reverting => "reverting",
            Self::Reverted => "reverted",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}
