//! Core domain errors.

use thiserror::Error;

use crate::state::TaskState;

/// Core domain errors for stagerun.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// A state change that the transition rules reject.
    #[error("invalid task state transition: {from} -> {to}")]
    InvalidStateTransition { from: TaskState, to: TaskState },
}
