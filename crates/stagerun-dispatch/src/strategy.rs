//! Task-type strategies: the per-type plugin contract and its registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use stagerun_core::{NodeInfo, Task, TaskId};
use stagerun_storage::TaskStore;

use crate::error::DispatchError;

/// Narrow view of a driver handed to strategy callbacks.
///
/// Gives a stage planner what it needs from the dispatcher side — the output
/// of the previous stage and a storage handle for its own queries — without
/// a back-pointer to the driver.
#[async_trait]
pub trait StageHandle: Send + Sync {
    /// Metas of the succeeded subtasks of `step`, in row order.
    async fn previous_subtask_metas(
        &self,
        task_id: TaskId,
        step: i64,
    ) -> Result<Vec<Vec<u8>>, DispatchError>;

    /// The store the owning driver runs against.
    fn store(&self) -> Arc<dyn TaskStore>;
}

/// Per-task-type callbacks consulted by a driver.
///
/// A strategy is a plain value registered under its type name; it owns the
/// business logic of stage planning and rollback while the driver owns the
/// state machine.
#[async_trait]
pub trait TaskStrategy: Send + Sync {
    /// Cooperative hook invoked while a stage is draining. Must not mutate
    /// dispatcher state.
    async fn on_tick(&self, task: &Task);

    /// Plan the next stage: return one meta per subtask and advance
    /// `task.step`. An empty plan means "no more stages" and completes the
    /// task.
    async fn on_next_stage(
        &self,
        handle: &dyn StageHandle,
        task: &mut Task,
    ) -> Result<Vec<Vec<u8>>, DispatchError>;

    /// Plan the rollback stage for the collected `errors`: one meta, fanned
    /// out to every node that ran a subtask. Must be retry-safe; the driver
    /// keeps calling it until it succeeds.
    async fn on_err_stage(
        &self,
        handle: &dyn StageHandle,
        task: &mut Task,
        errors: &[String],
    ) -> Result<Vec<u8>, DispatchError>;

    /// Restrict dispatch targets to a subset of the cluster.
    async fn eligible_instances(&self, task: &Task) -> Result<Vec<NodeInfo>, DispatchError>;

    /// Classify an error returned by [`TaskStrategy::on_next_stage`]:
    /// retryable errors are re-planned on the next tick, anything else fails
    /// the task.
    fn is_retryable(&self, err: &DispatchError) -> bool;
}

/// Name-keyed registry of strategies, owned by the manager.
///
/// Registration normally happens once at process start; `clear` exists so
/// tests can reset the set explicitly.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: RwLock<HashMap<String, Arc<dyn TaskStrategy>>>,
}

impl StrategyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `strategy` under `task_type`, replacing any previous entry.
    pub fn register(&self, task_type: impl Into<String>, strategy: Arc<dyn TaskStrategy>) {
        self.strategies
            .write()
            .expect("strategy registry poisoned")
            .insert(task_type.into(), strategy);
    }

    /// Look up the strategy for a task type.
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskStrategy>> {
        self.strategies
            .read()
            .expect("strategy registry poisoned")
            .get(task_type)
            .cloned()
    }

    /// Drop every registered strategy.
    pub fn clear(&self) {
        self.strategies
            .write()
            .expect("strategy registry poisoned")
            .clear();
    }

    /// Snapshot of the registered type names, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .strategies
            .read()
            .expect("strategy registry poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
