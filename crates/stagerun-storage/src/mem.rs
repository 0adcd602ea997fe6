//! In-memory implementation of the storage contract.
//!
//! Backs tests and single-process embedders. All tables live behind one
//! lock so the compare-state update is atomic, the same guarantee a
//! relational backend gives through its transaction.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tokio::sync::RwLock;

use async_trait::async_trait;

use stagerun_core::{Subtask, SubtaskId, SubtaskState, Task, TaskId, TaskState};

use crate::error::StoreError;
use crate::store::TaskStore;

#[derive(Default)]
struct Inner {
    tasks: BTreeMap<TaskId, Task>,
    subtasks: BTreeMap<SubtaskId, Subtask>,
    next_task_id: i64,
    next_subtask_id: i64,
    update_errors_to_inject: u32,
}

/// In-memory [`TaskStore`].
#[derive(Default)]
pub struct MemTaskStore {
    inner: RwLock<Inner>,
}

impl MemTaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `update_task_and_add_subtasks` fail with a
    /// retryable [`StoreError::Unavailable`]. Lets tests exercise the
    /// dispatcher's retry discipline without a real backend.
    pub async fn inject_update_errors(&self, n: u32) {
        self.inner.write().await.update_errors_to_inject = n;
    }

    /// Total number of subtask rows, across all tasks and steps.
    pub async fn subtask_count(&self) -> usize {
        self.inner.read().await.subtasks.len()
    }

    async fn request_transition(
        &self,
        id: TaskId,
        from: &[TaskState],
        to: TaskState,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
        if from.contains(&task.state) {
            task.state = to;
            task.state_update_time = Some(Utc::now());
        }
        Ok(())
    }
}

#[async_trait]
impl TaskStore for MemTaskStore {
    async fn add_task(
        &self,
        key: &str,
        task_type: &str,
        concurrency: u32,
        meta: Vec<u8>,
    ) -> Result<TaskId, StoreError> {
        if key.is_empty() {
            return Err(StoreError::InvalidInput("task key must not be empty".into()));
        }
        if task_type.is_empty() {
            return Err(StoreError::InvalidInput("task type must not be empty".into()));
        }
        let mut inner = self.inner.write().await;
        if inner.tasks.values().any(|t| t.key == key) {
            return Err(StoreError::DuplicateKey(key.to_string()));
        }
        inner.next_task_id += 1;
        let id = TaskId::new(inner.next_task_id);
        let mut task = Task::new(key, task_type, concurrency, meta);
        task.id = id;
        inner.tasks.insert(id, task);
        Ok(id)
    }

    async fn get_task(&self, id: TaskId) -> Result<Task, StoreError> {
        let inner = self.inner.read().await;
        inner.tasks.get(&id).cloned().ok_or(StoreError::TaskNotFound(id))
    }

    async fn get_task_by_key(&self, key: &str) -> Result<Option<Task>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.tasks.values().find(|t| t.key == key).cloned())
    }

    async fn tasks_in_states(&self, states: &[TaskState]) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .tasks
            .values()
            .filter(|t| states.contains(&t.state))
            .cloned()
            .collect())
    }

    async fn cancel_task(&self, id: TaskId) -> Result<(), StoreError> {
        self.request_transition(
            id,
            &[TaskState::Pending, TaskState::Running],
            TaskState::Cancelling,
        )
        .await
    }

    async fn pause_task(&self, id: TaskId) -> Result<(), StoreError> {
        self.request_transition(
            id,
            &[TaskState::Pending, TaskState::Running],
            TaskState::Pausing,
        )
        .await
    }

    async fn resume_task(&self, id: TaskId) -> Result<(), StoreError> {
        self.request_transition(id, &[TaskState::Paused], TaskState::Resuming)
            .await
    }

    async fn update_task_and_add_subtasks(
        &self,
        task: &Task,
        subtasks: &[Subtask],
        expected_prev_state: TaskState,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.update_errors_to_inject > 0 {
            inner.update_errors_to_inject -= 1;
            return Err(StoreError::Unavailable("injected update failure".into()));
        }
        let persisted = inner
            .tasks
            .get(&task.id)
            .ok_or(StoreError::TaskNotFound(task.id))?;
        if persisted.state != expected_prev_state {
            return Err(StoreError::StaleState {
                id: task.id,
                expected: expected_prev_state,
                actual: persisted.state,
            });
        }
        inner.tasks.insert(task.id, task.clone());
        // Entering rollback cancels whatever the forward stage still had in
        // flight, so executors stop picking those rows up.
        if task.state == TaskState::Reverting {
            for subtask in inner
                .subtasks
                .values_mut()
                .filter(|s| s.task_id == task.id && s.state.is_active())
            {
                subtask.state = SubtaskState::Cancelled;
            }
        }
        for subtask in subtasks {
            inner.next_subtask_id += 1;
            let mut row = subtask.clone();
            row.id = SubtaskId::new(inner.next_subtask_id);
            inner.subtasks.insert(row.id, row);
        }
        Ok(())
    }

    async fn count_subtasks_in_states(
        &self,
        task_id: TaskId,
        states: &[SubtaskState],
    ) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id && states.contains(&s.state))
            .count() as u64)
    }

    async fn collect_subtask_errors(&self, task_id: TaskId) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id && s.state == SubtaskState::Failed)
            .filter_map(|s| s.error.clone())
            .collect())
    }

    async fn succeed_subtasks_by_step(
        &self,
        task_id: TaskId,
        step: i64,
    ) -> Result<Vec<Subtask>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .subtasks
            .values()
            .filter(|s| {
                s.task_id == task_id && s.step == step && s.state == SubtaskState::Succeed
            })
            .cloned()
            .collect())
    }

    async fn subtasks_for_step(
        &self,
        task_id: TaskId,
        step: i64,
    ) -> Result<Vec<Subtask>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .subtasks
            .values()
            .filter(|s| s.task_id == task_id && s.step == step)
            .cloned()
            .collect())
    }

    async fn scheduler_ids_for_task(&self, task_id: TaskId) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut ids = Vec::new();
        for subtask in inner.subtasks.values().filter(|s| s.task_id == task_id) {
            if !ids.contains(&subtask.scheduler_id) {
                ids.push(subtask.scheduler_id.clone());
            }
        }
        Ok(ids)
    }

    async fn update_failed_scheduler_ids(
        &self,
        task_id: TaskId,
        replacements: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        for subtask in inner.subtasks.values_mut().filter(|s| s.task_id == task_id) {
            if !(subtask.state.is_active() || subtask.state.is_revert_active()) {
                continue;
            }
            if let Some(new_id) = replacements.get(&subtask.scheduler_id) {
                subtask.scheduler_id = new_id.clone();
            }
        }
        Ok(())
    }

    async fn update_subtask_state(
        &self,
        id: SubtaskId,
        state: SubtaskState,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let subtask = inner
            .subtasks
            .get_mut(&id)
            .ok_or(StoreError::SubtaskNotFound(id))?;
        subtask.state = state;
        if error.is_some() {
            subtask.error = error;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use stagerun_core::task::STEP_ONE;

    async fn store_with_task() -> (MemTaskStore, TaskId) {
        let store = MemTaskStore::new();
        let id = store
            .add_task("key-1", "example", 0, b"meta".to_vec())
            .await
            .expect("add task");
        (store, id)
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let (store, id) = store_with_task().await;
        assert_eq!(id, TaskId::new(1));

        let task = store.get_task(id).await.unwrap();
        assert_eq!(task.key, "key-1");
        assert_eq!(task.state, TaskState::Pending);

        let by_key = store.get_task_by_key("key-1").await.unwrap();
        assert_eq!(by_key.map(|t| t.id), Some(id));
        assert!(store.get_task_by_key("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() {
        let (store, _) = store_with_task().await;
        let err = store
            .add_task("key-1", "example", 0, Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::DuplicateKey("key-1".into()));
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let store = MemTaskStore::new();
        assert!(matches!(
            store.add_task("", "example", 0, Vec::new()).await,
            Err(StoreError::InvalidInput(_))
        ));
        assert!(matches!(
            store.add_task("k", "", 0, Vec::new()).await,
            Err(StoreError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_tasks_in_states_ordered_by_id() {
        let store = MemTaskStore::new();
        for i in 0..3 {
            store
                .add_task(&format!("key-{i}"), "example", 0, Vec::new())
                .await
                .unwrap();
        }
        let tasks = store.tasks_in_states(&[TaskState::Pending]).await.unwrap();
        let ids: Vec<i64> = tasks.iter().map(|t| t.id.value()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(store
            .tasks_in_states(&[TaskState::Running])
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_cancel_from_pending_and_noop_elsewhere() {
        let (store, id) = store_with_task().await;
        store.cancel_task(id).await.unwrap();
        assert_eq!(
            store.get_task(id).await.unwrap().state,
            TaskState::Cancelling
        );

        // Cancelling a task already past Pending/Running leaves it alone.
        store.cancel_task(id).await.unwrap();
        assert_eq!(
            store.get_task(id).await.unwrap().state,
            TaskState::Cancelling
        );
    }

    #[tokio::test]
    async fn test_pause_and_resume_requests() {
        let (store, id) = store_with_task().await;
        store.pause_task(id).await.unwrap();
        assert_eq!(store.get_task(id).await.unwrap().state, TaskState::Pausing);

        // resume only applies to Paused
        store.resume_task(id).await.unwrap();
        assert_eq!(store.get_task(id).await.unwrap().state, TaskState::Pausing);

        let mut task = store.get_task(id).await.unwrap();
        task.state = TaskState::Paused;
        store
            .update_task_and_add_subtasks(&task, &[], TaskState::Pausing)
            .await
            .unwrap();
        store.resume_task(id).await.unwrap();
        assert_eq!(store.get_task(id).await.unwrap().state, TaskState::Resuming);
    }

    #[tokio::test]
    async fn test_update_inserts_subtasks_with_ids() {
        let (store, id) = store_with_task().await;
        let mut task = store.get_task(id).await.unwrap();
        task.state = TaskState::Running;
        task.step = STEP_ONE;

        let subtasks = vec![
            Subtask::new(id, STEP_ONE, "example", "10.0.0.1:4000", b"a".to_vec()),
            Subtask::new(id, STEP_ONE, "example", "10.0.0.2:4000", b"b".to_vec()),
        ];
        store
            .update_task_and_add_subtasks(&task, &subtasks, TaskState::Pending)
            .await
            .unwrap();

        assert_eq!(store.get_task(id).await.unwrap().state, TaskState::Running);
        let rows = store.subtasks_for_step(id, STEP_ONE).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].id, SubtaskId::new(1));
        assert_eq!(rows[1].id, SubtaskId::new(2));
        assert_eq!(
            store
                .count_subtasks_in_states(id, &[SubtaskState::Pending])
                .await
                .unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_stale_state_rejected_and_storage_unchanged() {
        let (store, id) = store_with_task().await;
        let mut task = store.get_task(id).await.unwrap();
        task.state = TaskState::Running;

        let subtasks = vec![Subtask::new(id, STEP_ONE, "example", "10.0.0.1:4000", Vec::new())];
        let err = store
            .update_task_and_add_subtasks(&task, &subtasks, TaskState::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StaleState { .. }));
        assert!(!err.is_retryable());

        // nothing was written
        assert_eq!(store.get_task(id).await.unwrap().state, TaskState::Pending);
        assert_eq!(store.subtask_count().await, 0);
    }

    #[tokio::test]
    async fn test_subtask_errors_and_succeed_by_step() {
        let (store, id) = store_with_task().await;
        let mut task = store.get_task(id).await.unwrap();
        task.state = TaskState::Running;
        task.step = STEP_ONE;
        let subtasks = vec![
            Subtask::new(id, STEP_ONE, "example", "10.0.0.1:4000", b"a".to_vec()),
            Subtask::new(id, STEP_ONE, "example", "10.0.0.2:4000", b"b".to_vec()),
        ];
        store
            .update_task_and_add_subtasks(&task, &subtasks, TaskState::Pending)
            .await
            .unwrap();

        store
            .update_subtask_state(SubtaskId::new(1), SubtaskState::Succeed, None)
            .await
            .unwrap();
        store
            .update_subtask_state(
                SubtaskId::new(2),
                SubtaskState::Failed,
                Some("disk full".into()),
            )
            .await
            .unwrap();

        let errors = store.collect_subtask_errors(id).await.unwrap();
        assert_eq!(errors, vec!["disk full".to_string()]);

        let succeeded = store.succeed_subtasks_by_step(id, STEP_ONE).await.unwrap();
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].meta, b"a".to_vec());
    }

    #[tokio::test]
    async fn test_reverting_cancels_in_flight_forward_subtasks() {
        let (store, id) = store_with_task().await;
        let mut task = store.get_task(id).await.unwrap();
        task.state = TaskState::Running;
        task.step = STEP_ONE;
        let subtasks = vec![
            Subtask::new(id, STEP_ONE, "example", "10.0.0.1:4000", Vec::new()),
            Subtask::new(id, STEP_ONE, "example", "10.0.0.2:4000", Vec::new()),
        ];
        store
            .update_task_and_add_subtasks(&task, &subtasks, TaskState::Pending)
            .await
            .unwrap();
        store
            .update_subtask_state(SubtaskId::new(1), SubtaskState::Failed, Some("boom".into()))
            .await
            .unwrap();

        task.state = TaskState::Reverting;
        let reverts = vec![Subtask::new_revert(
            id,
            STEP_ONE,
            "example",
            "10.0.0.1:4000",
            Vec::new(),
        )];
        store
            .update_task_and_add_subtasks(&task, &reverts, TaskState::Running)
            .await
            .unwrap();

        let rows = store.subtasks_for_step(id, STEP_ONE).await.unwrap();
        assert_eq!(rows[0].state, SubtaskState::Failed); // already finished, kept
        assert_eq!(rows[1].state, SubtaskState::Cancelled); // was pending
        assert_eq!(rows[2].state, SubtaskState::RevertPending);
        assert_eq!(
            store
                .count_subtasks_in_states(id, &[SubtaskState::Pending, SubtaskState::Running])
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_scheduler_ids_distinct() {
        let (store, id) = store_with_task().await;
        let mut task = store.get_task(id).await.unwrap();
        task.state = TaskState::Running;
        task.step = STEP_ONE;
        let subtasks = vec![
            Subtask::new(id, STEP_ONE, "example", "10.0.0.1:4000", Vec::new()),
            Subtask::new(id, STEP_ONE, "example", "10.0.0.2:4000", Vec::new()),
            Subtask::new(id, STEP_ONE, "example", "10.0.0.1:4000", Vec::new()),
        ];
        store
            .update_task_and_add_subtasks(&task, &subtasks, TaskState::Pending)
            .await
            .unwrap();

        let ids = store.scheduler_ids_for_task(id).await.unwrap();
        assert_eq!(ids, vec!["10.0.0.1:4000".to_string(), "10.0.0.2:4000".to_string()]);
    }

    #[tokio::test]
    async fn test_replace_failed_scheduler_ids_skips_finished_rows() {
        let (store, id) = store_with_task().await;
        let mut task = store.get_task(id).await.unwrap();
        task.state = TaskState::Running;
        task.step = STEP_ONE;
        let subtasks = vec![
            Subtask::new(id, STEP_ONE, "example", "10.0.0.1:4000", Vec::new()),
            Subtask::new(id, STEP_ONE, "example", "10.0.0.1:4000", Vec::new()),
        ];
        store
            .update_task_and_add_subtasks(&task, &subtasks, TaskState::Pending)
            .await
            .unwrap();
        store
            .update_subtask_state(SubtaskId::new(1), SubtaskState::Succeed, None)
            .await
            .unwrap();

        let replacements =
            HashMap::from([("10.0.0.1:4000".to_string(), "10.0.0.9:4000".to_string())]);
        store
            .update_failed_scheduler_ids(id, &replacements)
            .await
            .unwrap();

        let rows = store.subtasks_for_step(id, STEP_ONE).await.unwrap();
        assert_eq!(rows[0].scheduler_id, "10.0.0.1:4000"); // finished, untouched
        assert_eq!(rows[1].scheduler_id, "10.0.0.9:4000"); // pending, moved
    }

    #[tokio::test]
    async fn test_injected_errors_are_retryable_and_run_out() {
        let (store, id) = store_with_task().await;
        store.inject_update_errors(2).await;

        let task = store.get_task(id).await.unwrap();
        for _ in 0..2 {
            let err = store
                .update_task_and_add_subtasks(&task, &[], TaskState::Pending)
                .await
                .unwrap_err();
            assert!(err.is_retryable());
        }
        store
            .update_task_and_add_subtasks(&task, &[], TaskState::Pending)
            .await
            .unwrap();
    }
}
