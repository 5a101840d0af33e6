//! Fleet node model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Operational status of a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Degraded,
    Draining,
    Unreachable,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Online => "online",
            NodeStatus::Offline => "offline",
            NodeStatus::Degraded => "degraded",
            NodeStatus::Draining => "draining",
            NodeStatus::Unreachable => "unreachable",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(NodeStatus::Online),
            "offline" => Ok(NodeStatus::Offline),
            "degraded" => Ok(NodeStatus::Degraded),
            "draining" => Ok(NodeStatus::Draining),
            "unreachable" => Ok(NodeStatus::Unreachable),
            other => Err(format!("unknown node status: {}", other)),
        }
    }
}

/// Resource snapshot reported by the agent at registration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NodeResources {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
    pub os: String,
    pub arch: String,
}

/// A managed host. `id` is globally unique and doubles as the Common Name of
/// the node's client certificate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    pub hostname: String,
    /// Network address captured from the relay connection.
    pub address: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub groups: Vec<String>,
    pub status: NodeStatus,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub resources: NodeResources,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
}

impl Node {
    /// A fresh online node as created at first agent connect.
    pub fn new(id: impl Into<String>, hostname: impl Into<String>, address: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            hostname: hostname.into(),
            address: address.into(),
            labels: HashMap::new(),
            groups: Vec::new(),
            status: NodeStatus::Online,
            capabilities: Vec::new(),
            resources: NodeResources::default(),
            registered_at: now,
            last_seen: now,
            version: String::new(),
            tunnel_id: None,
        }
    }

    /// Whether `required` is a subset of this node's labels.
    pub fn matches_labels(&self, required: &HashMap<String, String>) -> bool {
        required
            .iter()
            .all(|(k, v)| self.labels.get(k).map(|have| have == v).unwrap_or(false))
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}
