//! Cluster node identity.

use serde::{Deserialize, Serialize};

/// A control-plane member as reported by the membership source.
///
/// `id` is the member's own identity string; subtask assignment uses the
/// canonical `ip:port` form from [`NodeInfo::exec_id`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Membership identity (stable across address changes).
    pub id: String,

    /// IP address, v4 or v6.
    pub ip: String,

    /// Service port.
    pub port: u16,
}

impl NodeInfo {
    /// Create a new NodeInfo.
    pub fn new(id: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            ip: ip.into(),
            port,
        }
    }

    /// Canonical `ip:port` form; IPv6 addresses are wrapped in brackets.
    pub fn exec_id(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

/// Returns true iff `exec_id` names any of the given nodes.
pub fn matches_exec_id(nodes: &[NodeInfo], exec_id: &str) -> bool {
    nodes.iter().any(|n| n.exec_id() == exec_id)
}
