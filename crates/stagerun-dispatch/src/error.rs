//! Dispatch errors.

use thiserror::Error;

use stagerun_core::CoreError;
use stagerun_storage::StoreError;

use crate::cluster::ClusterError;

/// Errors surfaced by drivers and the manager.
///
/// Inside the schedule loop these never escape: they are logged and the
/// failing step is retried on the next tick. The only terminal outcomes are
/// explicit state moves.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Storage failure, transient or not (see [`StoreError::is_retryable`]).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Membership lookup failure.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// A state move the transition rules reject.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The strategy restricted the target set down to nothing.
    #[error("no available node to dispatch subtasks")]
    NoAvailableNode,

    /// A Running task without assigned nodes: dispatch never happened under
    /// this driver (ownership moved here after the stage was fanned out).
    #[error("task has no assigned nodes")]
    NoTaskNodes,

    /// No strategy registered for the task's type.
    #[error("unsupported task type: {0}")]
    UnsupportedTaskType(String),

    /// Error raised by a strategy callback; classified by the strategy's own
    /// `is_retryable`.
    #[error("{0}")]
    Strategy(String),
}
