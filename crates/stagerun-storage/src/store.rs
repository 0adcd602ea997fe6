//! The typed storage contract the dispatcher runs against.

use std::collections::HashMap;

use async_trait::async_trait;

use stagerun_core::{Subtask, SubtaskId, SubtaskState, Task, TaskId, TaskState};

use crate::error::StoreError;

/// Transactional access to the task and subtask tables.
///
/// Every method is one atomic unit against the backend. The critical
/// primitive is [`TaskStore::update_task_and_add_subtasks`]: it verifies the
/// persisted state still matches what the driver observed, writes the new
/// task row, and inserts the given subtasks — all in one transaction.
/// Callers use [`StoreError::is_retryable`] to decide between backing off
/// and re-reading.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task row in Pending. Fails with
    /// [`StoreError::DuplicateKey`] when the idempotency key is taken.
    async fn add_task(
        &self,
        key: &str,
        task_type: &str,
        concurrency: u32,
        meta: Vec<u8>,
    ) -> Result<TaskId, StoreError>;

    /// Fetch one task row.
    async fn get_task(&self, id: TaskId) -> Result<Task, StoreError>;

    /// Fetch a task by its idempotency key, if any.
    async fn get_task_by_key(&self, key: &str) -> Result<Option<Task>, StoreError>;

    /// List tasks whose state is any of `states`, ordered by id.
    async fn tasks_in_states(&self, states: &[TaskState]) -> Result<Vec<Task>, StoreError>;

    /// Request cancellation: Pending/Running -> Cancelling. A task in any
    /// other state is left untouched.
    async fn cancel_task(&self, id: TaskId) -> Result<(), StoreError>;

    /// Request a pause: Pending/Running -> Pausing. A task in any other
    /// state is left untouched.
    async fn pause_task(&self, id: TaskId) -> Result<(), StoreError>;

    /// Request a resume: Paused -> Resuming. A task in any other state is
    /// left untouched.
    async fn resume_task(&self, id: TaskId) -> Result<(), StoreError>;

    /// Atomically verify `expected_prev_state`, write the task row, and
    /// insert `subtasks`. On [`StoreError::StaleState`] nothing is written.
    /// Moving the task to Reverting also cancels its still pending/running
    /// forward subtasks within the same transaction.
    async fn update_task_and_add_subtasks(
        &self,
        task: &Task,
        subtasks: &[Subtask],
        expected_prev_state: TaskState,
    ) -> Result<(), StoreError>;

    /// Count the task's subtasks whose state is any of `states`.
    async fn count_subtasks_in_states(
        &self,
        task_id: TaskId,
        states: &[SubtaskState],
    ) -> Result<u64, StoreError>;

    /// Collect the error blobs of the task's failed subtasks.
    async fn collect_subtask_errors(&self, task_id: TaskId) -> Result<Vec<String>, StoreError>;

    /// Fetch the task's succeeded subtasks for one step.
    async fn succeed_subtasks_by_step(
        &self,
        task_id: TaskId,
        step: i64,
    ) -> Result<Vec<Subtask>, StoreError>;

    /// Fetch all of the task's subtasks for one step, ordered by id. This is
    /// the executor-side read path; the dispatcher itself only counts.
    async fn subtasks_for_step(
        &self,
        task_id: TaskId,
        step: i64,
    ) -> Result<Vec<Subtask>, StoreError>;

    /// Distinct scheduler ids present on the task's subtask rows.
    async fn scheduler_ids_for_task(&self, task_id: TaskId) -> Result<Vec<String>, StoreError>;

    /// Reassign not-yet-finished subtasks from dead nodes: every row whose
    /// `scheduler_id` is a key of `replacements` and whose state is still
    /// pending/running (forward or revert) moves to the mapped node.
    async fn update_failed_scheduler_ids(
        &self,
        task_id: TaskId,
        replacements: &HashMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Advance one subtask's state, recording an error blob if given. Called
    /// by worker executors; the dispatcher only observes the result.
    async fn update_subtask_state(
        &self,
        id: SubtaskId,
        state: SubtaskState,
        error: Option<String>,
    ) -> Result<(), StoreError>;
}
