//! Cluster membership view.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use stagerun_core::NodeInfo;

/// Membership lookup failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClusterError {
    /// The membership source answered but knows no live member.
    #[error("no live node found in the cluster")]
    NoInstances,

    /// The membership source itself could not be reached.
    #[error("membership source unavailable: {0}")]
    Unavailable(String),
}

/// Read access to the set of live control-plane members.
///
/// Production wires an implementation backed by the cluster's membership
/// store; tests and single-process embedders use [`StaticCluster`].
#[async_trait]
pub trait ClusterView: Send + Sync {
    /// The currently reachable members. Fails with
    /// [`ClusterError::NoInstances`] when the source is reachable but empty.
    async fn live_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError>;
}

/// A cluster view over an explicit member list.
#[derive(Default)]
pub struct StaticCluster {
    nodes: RwLock<Vec<NodeInfo>>,
}

impl StaticCluster {
    /// Create an empty cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cluster from an initial member list.
    pub fn with_nodes(nodes: Vec<NodeInfo>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    /// Add a member.
    pub async fn add_node(&self, node: NodeInfo) {
        self.nodes.write().await.push(node);
    }

    /// Remove a member by its membership id.
    pub async fn remove_node(&self, id: &str) {
        self.nodes.write().await.retain(|n| n.id != id);
    }

    /// Drop all members.
    pub async fn clear(&self) {
        self.nodes.write().await.clear();
    }
}

#[async_trait]
impl ClusterView for StaticCluster {
    async fn live_nodes(&self) -> Result<Vec<NodeInfo>, ClusterError> {
        let nodes = self.nodes.read().await;
        if nodes.is_empty() {
            return Err(ClusterError::NoInstances);
        }
        Ok(nodes.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_cluster_reports_no_instances() {
        let cluster = StaticCluster::new();
        assert_eq!(cluster.live_nodes().await.unwrap_err(), ClusterError::NoInstances);
    }

    #[tokio::test]
    async fn test_membership_changes() {
        let cluster = StaticCluster::with_nodes(vec![NodeInfo::new("n1", "10.0.0.1", 4000)]);
        cluster.add_node(NodeInfo::new("n2", "10.0.0.2", 4000)).await;

        let nodes = cluster.live_nodes().await.unwrap();
        assert_eq!(nodes.len(), 2);

        cluster.remove_node("n1").await;
        let nodes = cluster.live_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "n2");

        cluster.clear().await;
        assert_eq!(cluster.live_nodes().await.unwrap_err(), ClusterError::NoInstances);
    }
}
