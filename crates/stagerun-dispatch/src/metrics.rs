//! Prometheus metrics collection and formatting.
//!
//! This module provides dispatcher metrics in Prometheus text exposition
//! format.

use std::fmt::Write;
use std::sync::Arc;

use tracing::error;

use stagerun_core::TaskState;
use stagerun_storage::TaskStore;

use crate::manager::DispatchManager;

const ALL_TASK_STATES: [TaskState; 13] = [
    TaskState::Pending,
    TaskState::Running,
    TaskState::Succeed,
    TaskState::Reverting,
    TaskState::Reverted,
    TaskState::Failed,
    TaskState::RevertFailed,
    TaskState::Cancelling,
    TaskState::Cancelled,
    TaskState::Pausing,
    TaskState::Paused,
    TaskState::Resuming,
    TaskState::RevertPending,
];

/// Collect all dispatcher metrics and format as Prometheus text.
pub async fn collect_metrics(store: &Arc<dyn TaskStore>, manager: &DispatchManager) -> String {
    let mut output = String::new();

    collect_task_metrics(store, &mut output).await;
    collect_driver_metrics(manager, &mut output);

    output
}

/// Collect task counts by state.
async fn collect_task_metrics(store: &Arc<dyn TaskStore>, output: &mut String) {
    let tasks = match store.tasks_in_states(&ALL_TASK_STATES).await {
        Ok(tasks) => tasks,
        Err(err) => {
            error!(error = %err, "collecting task metrics failed");
            return;
        }
    };

    writeln!(
        output,
        "# HELP stagerun_tasks_total Total number of tasks by state"
    )
    .ok();
    writeln!(output, "# TYPE stagerun_tasks_total gauge").ok();
    for state in ALL_TASK_STATES {
        let count = tasks.iter().filter(|t| t.state == state).count();
        writeln!(output, "stagerun_tasks_total{{state=\"{state}\"}} {count}").ok();
    }
}

/// Collect the running-driver gauge.
fn collect_driver_metrics(manager: &DispatchManager, output: &mut String) {
    writeln!(output).ok();
    writeln!(
        output,
        "# HELP stagerun_drivers_running Number of tasks currently owned by a driver"
    )
    .ok();
    writeln!(output, "# TYPE stagerun_drivers_running gauge").ok();
    writeln!(
        output,
        "stagerun_drivers_running {}",
        manager.running_task_count()
    )
    .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    use stagerun_core::NodeInfo;
    use stagerun_storage::MemTaskStore;

    use crate::cluster::StaticCluster;

    fn manager(store: Arc<MemTaskStore>) -> DispatchManager {
        let cluster = Arc::new(StaticCluster::with_nodes(vec![NodeInfo::new(
            "n1", "10.0.0.1", 4000,
        )]));
        DispatchManager::new(store, cluster, "host:4000")
    }

    #[tokio::test]
    async fn test_collect_metrics_empty_store() {
        let store = Arc::new(MemTaskStore::new());
        let manager = manager(store.clone());
        let store: Arc<dyn TaskStore> = store;

        let output = collect_metrics(&store, &manager).await;
        assert!(output.contains("stagerun_tasks_total"));
        assert!(output.contains("stagerun_tasks_total{state=\"pending\"} 0"));
        assert!(output.contains("stagerun_drivers_running 0"));
    }

    #[tokio::test]
    async fn test_collect_metrics_counts_tasks() {
        let store = Arc::new(MemTaskStore::new());
        let manager = manager(store.clone());
        store.add_task("t1", "example", 0, Vec::new()).await.unwrap();
        store.add_task("t2", "example", 0, Vec::new()).await.unwrap();
        let store: Arc<dyn TaskStore> = store;

        let output = collect_metrics(&store, &manager).await;
        assert!(output.contains("stagerun_tasks_total{state=\"pending\"} 2"));
        assert!(output.contains("stagerun_tasks_total{state=\"running\"} 0"));
    }
}
