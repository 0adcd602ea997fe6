//! The dispatch manager: polls the task table and bounds per-task drivers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stagerun_core::{Task, TaskId, TaskState};
use stagerun_storage::TaskStore;

use crate::cluster::ClusterView;
use crate::config::DispatchConfig;
use crate::driver::Driver;
use crate::error::DispatchError;
use crate::strategy::{StrategyRegistry, TaskStrategy};

struct Inner {
    store: Arc<dyn TaskStore>,
    cluster: Arc<dyn ClusterView>,
    registry: StrategyRegistry,
    config: Arc<DispatchConfig>,
    server_id: String,
    running: Mutex<HashSet<TaskId>>,
    shutdown: CancellationToken,
}

/// Owns the strategy registry and the set of live drivers.
///
/// `start` launches two cooperative loops sharing the manager's shutdown
/// token: the dispatch loop claims runnable tasks up to the concurrency cap
/// and the detect loop makes sure cancel/pause/resume requests always have
/// an owning driver. Drivers communicate with each other only through the
/// store.
pub struct DispatchManager {
    inner: Arc<Inner>,
}

impl DispatchManager {
    /// Create a manager with the default configuration.
    pub fn new(
        store: Arc<dyn TaskStore>,
        cluster: Arc<dyn ClusterView>,
        server_id: impl Into<String>,
    ) -> Self {
        Self::with_config(store, cluster, server_id, DispatchConfig::default())
    }

    /// Create a manager with an explicit configuration.
    pub fn with_config(
        store: Arc<dyn TaskStore>,
        cluster: Arc<dyn ClusterView>,
        server_id: impl Into<String>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                cluster,
                registry: StrategyRegistry::new(),
                config: Arc::new(config),
                server_id: server_id.into(),
                running: Mutex::new(HashSet::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Register the strategy for a task type, replacing any previous one.
    pub fn register_strategy(&self, task_type: impl Into<String>, strategy: Arc<dyn TaskStrategy>) {
        self.inner.registry.register(task_type, strategy);
    }

    /// Drop all registered strategies.
    pub fn clear_strategies(&self) {
        self.inner.registry.clear();
    }

    /// Snapshot of the registered task type names, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        self.inner.registry.registered_types()
    }

    /// Number of tasks currently owned by a driver.
    pub fn running_task_count(&self) -> usize {
        self.inner.running.lock().expect("driver map poisoned").len()
    }

    /// Forget a driver entry. The driver itself keeps running until its task
    /// is terminal; this only releases the dispatch slot.
    pub fn remove_running_task(&self, id: TaskId) {
        self.inner
            .running
            .lock()
            .expect("driver map poisoned")
            .remove(&id);
    }

    /// Build an unmanaged driver for `task`, without claiming a slot.
    pub fn mock_driver(&self, task: Task) -> Result<Driver, DispatchError> {
        let strategy = self
            .inner
            .registry
            .get(&task.task_type)
            .ok_or_else(|| DispatchError::UnsupportedTaskType(task.task_type.clone()))?;
        Ok(Driver::new(
            self.inner.store.clone(),
            self.inner.cluster.clone(),
            strategy,
            self.inner.config.clone(),
            self.inner.server_id.clone(),
            task,
        ))
    }

    /// Launch the dispatch and detect loops.
    pub fn start(&self) {
        info!(server_id = %self.inner.server_id, "starting dispatch manager");
        tokio::spawn(self.inner.clone().dispatch_loop());
        tokio::spawn(self.inner.clone().detect_loop());
    }

    /// Signal every loop and driver to exit after its current tick.
    pub fn stop(&self) {
        info!(server_id = %self.inner.server_id, "stopping dispatch manager");
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    /// Claims Pending tasks (and re-adopts Running ones after an ownership
    /// change) up to the concurrency cap.
    async fn dispatch_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.task_poll_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("dispatch loop exits");
                    return;
                }
                _ = ticker.tick() => self.dispatch_runnable_tasks().await,
            }
        }
    }

    /// Makes sure cancel/pause/resume requests always get an owning driver;
    /// their state handlers pick the request up on the next tick.
    async fn detect_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.task_poll_interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("detect loop exits");
                    return;
                }
                _ = ticker.tick() => self.detect_interrupted_tasks().await,
            }
        }
    }

    async fn dispatch_runnable_tasks(self: &Arc<Self>) {
        let tasks = match self
            .store
            .tasks_in_states(&[TaskState::Pending, TaskState::Running])
            .await
        {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(error = %err, "poll runnable tasks failed");
                return;
            }
        };
        for task in tasks {
            {
                let running = self.running.lock().expect("driver map poisoned");
                if running.contains(&task.id) {
                    continue;
                }
                if running.len() >= self.config.dispatch_concurrency {
                    break;
                }
            }
            self.start_driver(task).await;
        }
    }

    async fn detect_interrupted_tasks(self: &Arc<Self>) {
        let tasks = match self
            .store
            .tasks_in_states(&[TaskState::Cancelling, TaskState::Pausing, TaskState::Resuming])
            .await
        {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(error = %err, "poll interrupted tasks failed");
                return;
            }
        };
        for task in tasks {
            let owned = self
                .running
                .lock()
                .expect("driver map poisoned")
                .contains(&task.id);
            if !owned {
                self.start_driver(task).await;
            }
        }
    }

    async fn start_driver(self: &Arc<Self>, task: Task) {
        let strategy = match self.registry.get(&task.task_type) {
            Some(strategy) => strategy,
            None => {
                self.fail_unsupported_task(task).await;
                return;
            }
        };
        {
            let mut running = self.running.lock().expect("driver map poisoned");
            if !running.insert(task.id) {
                return;
            }
        }
        info!(task_id = %task.id, task_type = %task.task_type, "claiming task");
        let driver = Driver::new(
            self.store.clone(),
            self.cluster.clone(),
            strategy,
            self.config.clone(),
            self.server_id.clone(),
            task.clone(),
        );
        let inner = self.clone();
        let shutdown = self.shutdown.clone();
        let id = task.id;
        tokio::spawn(async move {
            driver.run(shutdown).await;
            inner
                .running
                .lock()
                .expect("driver map poisoned")
                .remove(&id);
        });
    }

    /// A task whose type has no registered strategy cannot be driven at all:
    /// fail it in place, one shot.
    async fn fail_unsupported_task(&self, mut task: Task) {
        warn!(
            task_id = %task.id,
            task_type = %task.task_type,
            "no strategy registered for task type"
        );
        let prev = task.state;
        task.error = Some("unsupported task type".into());
        task.state = TaskState::Failed;
        task.state_update_time = Some(Utc::now());
        if let Err(err) = self.store.update_task_and_add_subtasks(&task, &[], prev).await {
            error!(task_id = %task.id, error = %err, "failing unsupported task did not stick");
        }
    }
}
