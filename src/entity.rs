//! Domain entities whose status the engine reconciles.
//!
//! Clusters, node groups and nodes are owned by the wider control plane; the
//! engine only flips their status when a task begins work on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Initializing,
    Running,
    Deleting,
    Failed,
}

impl ClusterStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Deleting => "DELETING",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeGroupStatus {
    Creating,
    Running,
    Updating,
    Deleting,
    Failed,
}

impl NodeGroupStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Running => "RUNNING",
            Self::Updating => "UPDATING",
            Self::Deleting => "DELETING",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Initializing,
    Running,
    Deleting,
    Failed,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Deleting => "DELETING",
            Self::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIALIZING" => Ok(Self::Initializing),
            "RUNNING" => Ok(Self::Running),
            "DELETING" => Ok(Self::Deleting),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown node status: {other}")),
        }
    }
}

/// A managed Kubernetes cluster record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: String,
    pub project_id: String,
    pub provider: String,
    pub status: ClusterStatus,
    pub updated_at: DateTime<Utc>,
}

/// A node group within a cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroup {
    pub node_group_id: String,
    pub cluster_id: String,
    pub desired_size: i32,
    pub status: NodeGroupStatus,
    pub updated_at: DateTime<Utc>,
}

/// A single node, keyed by its inner IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub inner_ip: String,
    pub cluster_id: String,
    pub node_group_id: String,
    pub status: NodeStatus,
    pub updated_at: DateTime<Utc>,
}
