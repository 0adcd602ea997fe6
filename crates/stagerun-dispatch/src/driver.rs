//! Per-task driver: owns one task row and advances its state machine.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stagerun_core::node::matches_exec_id;
use stagerun_core::{CoreError, NodeInfo, Subtask, SubtaskState, Task, TaskId, TaskState};
use stagerun_storage::TaskStore;

use crate::cluster::ClusterView;
use crate::config::DispatchConfig;
use crate::error::DispatchError;
use crate::strategy::{StageHandle, TaskStrategy};

/// Storage view handed to strategy callbacks.
struct DriverHandle {
    store: Arc<dyn TaskStore>,
}

#[async_trait::async_trait]
impl StageHandle for DriverHandle {
    async fn previous_subtask_metas(
        &self,
        task_id: TaskId,
        step: i64,
    ) -> Result<Vec<Vec<u8>>, DispatchError> {
        let subtasks = self.store.succeed_subtasks_by_step(task_id, step).await?;
        Ok(subtasks.into_iter().map(|s| s.meta).collect())
    }

    fn store(&self) -> Arc<dyn TaskStore> {
        self.store.clone()
    }
}

/// Drives a single task until it reaches a terminal state.
///
/// The driver is the only writer of its task row while it runs; every
/// persisted transition re-verifies the previously observed state inside the
/// store's transaction, so a concurrent owner change loses cleanly.
pub struct Driver {
    store: Arc<dyn TaskStore>,
    cluster: Arc<dyn ClusterView>,
    strategy: Arc<dyn TaskStrategy>,
    config: Arc<DispatchConfig>,
    server_id: String,
    task: Task,

    // Live-node snapshot, refreshed every `live_nodes_check_interval` ticks.
    live_nodes: Vec<NodeInfo>,
    live_node_fetch_tick: u32,
    // Canonical ids of the nodes the current stage was fanned out to.
    task_nodes: Vec<String>,
    rng: StdRng,
}

impl std::fmt::Debug for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Driver")
            .field("server_id", &self.server_id)
            .field("task", &self.task)
            .field("live_nodes", &self.live_nodes)
            .field("live_node_fetch_tick", &self.live_node_fetch_tick)
            .field("task_nodes", &self.task_nodes)
            .finish_non_exhaustive()
    }
}

impl Driver {
    /// Create a driver for `task`.
    pub fn new(
        store: Arc<dyn TaskStore>,
        cluster: Arc<dyn ClusterView>,
        strategy: Arc<dyn TaskStrategy>,
        config: Arc<DispatchConfig>,
        server_id: impl Into<String>,
        task: Task,
    ) -> Self {
        Self {
            store,
            cluster,
            strategy,
            config,
            server_id: server_id.into(),
            task,
            live_nodes: Vec::new(),
            live_node_fetch_tick: 0,
            task_nodes: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// The driver's current task snapshot.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Run the schedule loop until the task is terminal or `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            task_id = %self.task.id,
            task_type = %self.task.task_type,
            state = %self.task.state,
            server_id = %self.server_id,
            "driving task"
        );
        let mut ticker = tokio::time::interval(self.config.task_check_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(task_id = %self.task.id, "schedule loop cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    if self.refresh_task().await.is_err() {
                        continue;
                    }
                    let state = self.task.state;
                    let result = match state {
                        TaskState::Pending => self.on_pending().await,
                        TaskState::Running => self.on_running().await,
                        TaskState::Cancelling => self.on_cancelling().await,
                        TaskState::Reverting => self.on_reverting().await,
                        TaskState::Pausing => self.on_pausing().await,
                        TaskState::Resuming => self.on_resuming().await,
                        TaskState::Paused => {
                            info!(task_id = %self.task.id, "task paused, releasing it");
                            return;
                        }
                        TaskState::Succeed
                        | TaskState::Reverted
                        | TaskState::Failed
                        | TaskState::RevertFailed
                        | TaskState::Cancelled
                        | TaskState::RevertPending => {
                            info!(task_id = %self.task.id, state = %state, "task finished");
                            return;
                        }
                    };
                    if let Err(err) = result {
                        info!(
                            task_id = %self.task.id,
                            state = %state,
                            error = %err,
                            "schedule tick failed, rescheduling"
                        );
                    }
                }
            }
        }
    }

    async fn refresh_task(&mut self) -> Result<(), DispatchError> {
        match self.store.get_task(self.task.id).await {
            Ok(task) => {
                self.task = task;
                Ok(())
            }
            Err(err) => {
                error!(task_id = %self.task.id, error = %err, "refresh task failed");
                Err(err.into())
            }
        }
    }

    fn handle(&self) -> DriverHandle {
        DriverHandle {
            store: self.store.clone(),
        }
    }

    /// Pending: plan and fan out the first stage.
    async fn on_pending(&mut self) -> Result<(), DispatchError> {
        debug!(task_id = %self.task.id, step = self.task.step, "on pending");
        self.on_next_stage().await
    }

    /// Running: collect errors, otherwise wait for the stage to drain and
    /// move on.
    async fn on_running(&mut self) -> Result<(), DispatchError> {
        debug!(task_id = %self.task.id, step = self.task.step, "on running");
        let errors = self.store.collect_subtask_errors(self.task.id).await?;
        if !errors.is_empty() {
            warn!(task_id = %self.task.id, errors = errors.len(), "subtasks encountered errors");
            return self.on_err_stage(&errors).await;
        }

        let active = self
            .store
            .count_subtasks_in_states(
                self.task.id,
                &[SubtaskState::Pending, SubtaskState::Running],
            )
            .await?;
        if active == 0 {
            info!(task_id = %self.task.id, step = self.task.step, "stage finished, planning the next one");
            return self.on_next_stage().await;
        }

        self.replace_dead_nodes().await?;
        self.strategy.on_tick(&self.task).await;
        Ok(())
    }

    /// Cancelling: route a synthetic error through the rollback path.
    async fn on_cancelling(&mut self) -> Result<(), DispatchError> {
        debug!(task_id = %self.task.id, step = self.task.step, "on cancelling");
        let errors = vec!["cancel".to_string()];
        self.on_err_stage(&errors).await
    }

    /// Reverting: wait for rollback subtasks to drain, then finish.
    async fn on_reverting(&mut self) -> Result<(), DispatchError> {
        debug!(task_id = %self.task.id, step = self.task.step, "on reverting");
        let active = self
            .store
            .count_subtasks_in_states(
                self.task.id,
                &[SubtaskState::RevertPending, SubtaskState::Reverting],
            )
            .await?;
        if active == 0 {
            info!(task_id = %self.task.id, "rollback finished, task reverted");
            self.task.state_update_time = Some(Utc::now());
            return self
                .update_task(TaskState::Reverted, Vec::new(), self.config.store_retry_times)
                .await;
        }
        self.strategy.on_tick(&self.task).await;
        Ok(())
    }

    /// Pausing: wait for the stage to drain, then release the task.
    async fn on_pausing(&mut self) -> Result<(), DispatchError> {
        debug!(task_id = %self.task.id, step = self.task.step, "on pausing");
        let active = self
            .store
            .count_subtasks_in_states(
                self.task.id,
                &[SubtaskState::Pending, SubtaskState::Running],
            )
            .await?;
        if active == 0 {
            info!(task_id = %self.task.id, "stage drained, task paused");
            self.task.state_update_time = Some(Utc::now());
            return self
                .update_task(TaskState::Paused, Vec::new(), self.config.store_retry_times)
                .await;
        }
        self.strategy.on_tick(&self.task).await;
        Ok(())
    }

    /// Resuming: hand the task back to the Running handler.
    async fn on_resuming(&mut self) -> Result<(), DispatchError> {
        debug!(task_id = %self.task.id, step = self.task.step, "on resuming");
        self.task.state_update_time = Some(Utc::now());
        self.update_task(TaskState::Running, Vec::new(), self.config.store_retry_times)
            .await
    }

    /// Ask the strategy for the next stage and fan it out.
    async fn on_next_stage(&mut self) -> Result<(), DispatchError> {
        let handle = self.handle();
        let strategy = self.strategy.clone();
        let metas = match strategy.on_next_stage(&handle, &mut self.task).await {
            Ok(metas) => metas,
            Err(err) => return self.handle_plan_err(err).await,
        };
        self.dispatch_subtasks(metas).await
    }

    async fn handle_plan_err(&mut self, err: DispatchError) -> Result<(), DispatchError> {
        warn!(
            task_id = %self.task.id,
            state = %self.task.state,
            error = %err,
            "stage planning failed"
        );
        if self.strategy.is_retryable(&err) {
            return Err(err);
        }
        self.task.error = Some(err.to_string());
        self.task.state_update_time = Some(Utc::now());
        self.update_task(TaskState::Failed, Vec::new(), self.config.store_retry_times)
            .await
    }

    /// Fan `metas` out to the eligible nodes round-robin and persist the
    /// stage together with the state move.
    async fn dispatch_subtasks(&mut self, metas: Vec<Vec<u8>>) -> Result<(), DispatchError> {
        info!(
            task_id = %self.task.id,
            state = %self.task.state,
            concurrency = self.task.concurrency,
            subtasks = metas.len(),
            "dispatch subtasks"
        );
        self.task.concurrency = self.config.normalize_concurrency(self.task.concurrency);

        // The first dispatch is a single shot so a concurrent cancel or
        // ownership change wins instead of being fought with retries.
        let mut retry_times = self.config.store_retry_times;
        if self.task.state == TaskState::Pending {
            let now = Utc::now();
            self.task.start_time = Some(now);
            self.task.state_update_time = Some(now);
            retry_times = 1;
        }

        if metas.is_empty() {
            self.task.state_update_time = Some(Utc::now());
            return self.update_task(TaskState::Succeed, Vec::new(), retry_times).await;
        }

        let nodes = self.strategy.eligible_instances(&self.task).await?;
        debug!(task_id = %self.task.id, eligible = nodes.len(), "eligible instances");
        if nodes.is_empty() {
            return Err(DispatchError::NoAvailableNode);
        }
        self.task_nodes = nodes.iter().map(NodeInfo::exec_id).collect();

        let mut subtasks = Vec::with_capacity(metas.len());
        for (i, meta) in metas.into_iter().enumerate() {
            let scheduler_id = self.task_nodes[i % self.task_nodes.len()].clone();
            debug!(task_id = %self.task.id, scheduler_id = %scheduler_id, "create subtask");
            subtasks.push(Subtask::new(
                self.task.id,
                self.task.step,
                &self.task.task_type,
                scheduler_id,
                meta,
            ));
        }
        self.update_task(TaskState::Running, subtasks, retry_times).await
    }

    /// Ask the strategy for a rollback plan and fan it out to every node
    /// that ran a subtask and is still eligible.
    async fn on_err_stage(&mut self, errors: &[String]) -> Result<(), DispatchError> {
        let handle = self.handle();
        let strategy = self.strategy.clone();
        // The rollback planner must be retry-safe; a failure here is
        // re-attempted on the next tick, never promoted to Failed, so no
        // resources are orphaned.
        let meta = match strategy.on_err_stage(&handle, &mut self.task, errors).await {
            Ok(meta) => meta,
            Err(err) => {
                warn!(task_id = %self.task.id, error = %err, "rollback planning failed");
                return Err(err);
            }
        };

        let scheduler_ids = self.all_scheduler_ids().await?;
        let subtasks: Vec<Subtask> = scheduler_ids
            .into_iter()
            .map(|id| {
                Subtask::new_revert(
                    self.task.id,
                    self.task.step,
                    &self.task.task_type,
                    id,
                    meta.clone(),
                )
            })
            .collect();
        self.task.state_update_time = Some(Utc::now());
        self.update_task(TaskState::Reverting, subtasks, self.config.store_retry_times)
            .await
    }

    /// Scheduler ids recorded on the task's subtask rows, restricted to
    /// nodes the strategy still considers eligible.
    async fn all_scheduler_ids(&self) -> Result<Vec<String>, DispatchError> {
        let eligible = self.strategy.eligible_instances(&self.task).await?;
        if eligible.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self.store.scheduler_ids_for_task(self.task.id).await?;
        Ok(ids
            .into_iter()
            .filter(|id| matches_exec_id(&eligible, id))
            .collect())
    }

    /// Reassign subtasks away from nodes that fell out of the live set.
    ///
    /// The live-node snapshot is only refreshed every
    /// `live_nodes_check_interval` ticks; replacements draw uniformly from
    /// the live eligible nodes.
    async fn replace_dead_nodes(&mut self) -> Result<(), DispatchError> {
        if self.task_nodes.is_empty() {
            return Err(DispatchError::NoTaskNodes);
        }
        self.live_node_fetch_tick += 1;
        if self.live_node_fetch_tick >= self.config.live_nodes_check_interval {
            self.live_node_fetch_tick = 0;
            let nodes = self.cluster.live_nodes().await?;
            let eligible = self.strategy.eligible_instances(&self.task).await?;
            self.live_nodes = nodes
                .into_iter()
                .filter(|n| eligible.iter().any(|e| e.id == n.id))
                .collect();
        }
        if self.live_nodes.is_empty() {
            return Ok(());
        }

        let mut replacements = HashMap::new();
        for node_id in &self.task_nodes {
            if !matches_exec_id(&self.live_nodes, node_id) {
                let pick = self.rng.gen_range(0..self.live_nodes.len());
                replacements.insert(node_id.clone(), self.live_nodes[pick].exec_id());
            }
        }
        if replacements.is_empty() {
            return Ok(());
        }
        warn!(task_id = %self.task.id, replaced = replacements.len(), "replacing dead nodes");
        self.store
            .update_failed_scheduler_ids(self.task.id, &replacements)
            .await?;
        for node in &mut self.task_nodes {
            if let Some(new_id) = replacements.get(node) {
                *node = new_id.clone();
            }
        }
        Ok(())
    }

    /// Persist a state move (plus any new subtasks), retrying transient
    /// store failures up to `retry_times`.
    async fn update_task(
        &mut self,
        to: TaskState,
        subtasks: Vec<Subtask>,
        retry_times: u32,
    ) -> Result<(), DispatchError> {
        let prev = self.task.state;
        if !prev.can_transition_to(to) {
            return Err(CoreError::InvalidStateTransition { from: prev, to }.into());
        }
        self.task.state = to;

        let mut attempt = 0;
        loop {
            match self
                .store
                .update_task_and_add_subtasks(&self.task, &subtasks, prev)
                .await
            {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempt + 1 < retry_times => {
                    if attempt % 10 == 0 {
                        warn!(
                            task_id = %self.task.id,
                            from = %prev,
                            to = %to,
                            attempt,
                            error = %err,
                            "task update failed, backing off"
                        );
                    }
                    attempt += 1;
                    tokio::time::sleep(self.config.store_retry_interval).await;
                }
                Err(err) => {
                    if retry_times > 1 {
                        warn!(
                            task_id = %self.task.id,
                            from = %prev,
                            to = %to,
                            attempt,
                            error = %err,
                            "task update failed"
                        );
                    }
                    return Err(err.into());
                }
            }
        }
    }
}
