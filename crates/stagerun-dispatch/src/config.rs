//! Dispatcher configuration.

use std::time::Duration;

/// Tunable parameters of the dispatch manager and its drivers.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum number of concurrently driven tasks per manager.
    pub dispatch_concurrency: usize,

    /// Subtask concurrency used when a task requests 0.
    pub subtask_concurrency: u32,

    /// Hard cap on a task's subtask concurrency.
    pub max_subtask_concurrency: u32,

    /// Driver ticks between refreshes of the live-node snapshot.
    pub live_nodes_check_interval: u32,

    /// Driver tick: how often a task's stage progress is re-examined.
    pub task_check_interval: Duration,

    /// Manager tick: how often the dispatch and detect loops poll storage.
    pub task_poll_interval: Duration,

    /// Attempts for a retryable store update before giving up on the tick.
    pub store_retry_times: u32,

    /// Sleep between store update attempts.
    pub store_retry_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            dispatch_concurrency: 4,
            subtask_concurrency: 16,
            max_subtask_concurrency: 256,
            live_nodes_check_interval: 2,
            task_check_interval: Duration::from_millis(500),
            task_poll_interval: Duration::from_millis(300),
            store_retry_times: 512,
            store_retry_interval: Duration::from_millis(500),
        }
    }
}

impl DispatchConfig {
    /// Clamp a task's requested concurrency: 0 means "use the default",
    /// anything above the cap is cut down to it.
    pub fn normalize_concurrency(&self, requested: u32) -> u32 {
        if requested == 0 {
            self.subtask_concurrency
        } else {
            requested.min(self.max_subtask_concurrency)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DispatchConfig::default();
        assert_eq!(config.dispatch_concurrency, 4);
        assert_eq!(config.subtask_concurrency, 16);
        assert_eq!(config.max_subtask_concurrency, 256);
        assert_eq!(config.live_nodes_check_interval, 2);
        assert_eq!(config.task_check_interval, Duration::from_millis(500));
        assert_eq!(config.task_poll_interval, Duration::from_millis(300));
    }

    #[test]
    fn test_normalize_concurrency() {
        let config = DispatchConfig::default();
        assert_eq!(config.normalize_concurrency(0), 16);
        assert_eq!(config.normalize_concurrency(8), 8);
        assert_eq!(config.normalize_concurrency(1000), 256);
    }
}
