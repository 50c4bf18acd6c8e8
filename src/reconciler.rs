//! Entity status reconciliation at task creation.
//!
//! When a task starts, the entity it operates on is flipped to the matching
//! transitional status so readers see work in progress before any step has
//! run. Matching is by substring on the task type, so provider-prefixed
//! variants of a workflow reconcile the same way.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::entity::{ClusterStatus, NodeGroupStatus, NodeStatus};
use crate::error::StoreError;
use crate::store::TaskStore;
use crate::task::Task;

pub struct StatusReconciler {
    store: Arc<dyn TaskStore>,
}

impl StatusReconciler {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self { store }
    }

    /// Applies the transitional status for the task's type. A missing entity
    /// is logged and tolerated: the task may be importing or pre-creating it.
    pub async fn reconcile(&self, task: &Task) -> Result<(), StoreError> {
        let task_type = task.task_type.as_str();

        if task_type.contains("CreateCluster") || task_type.contains("ImportCluster") {
            self.set_cluster(task, ClusterStatus::Initializing).await?;
        } else if task_type.contains("DeleteCluster") {
            self.set_cluster(task, ClusterStatus::Deleting).await?;
        } else if task_type.contains("AddNodes") {
            self.set_nodes(task, NodeStatus::Initializing).await?;
        } else if task_type.contains("RemoveNodes") || task_type.contains("CleanNodes") {
            self.set_nodes(task, NodeStatus::Deleting).await?;
        } else if task_type.contains("CreateNodeGroup") {
            self.set_node_group(task, NodeGroupStatus::Creating).await?;
        } else if task_type.contains("DeleteNodeGroup") {
            self.set_node_group(task, NodeGroupStatus::Deleting).await?;
        } else if task_type.contains("UpdateDesiredNode") || task_type.contains("AutoScale") {
            self.set_node_group(task, NodeGroupStatus::Updating).await?;
        } else {
            debug!(task_type, "no entity reconciliation for task type");
        }
        Ok(())
    }

    async fn set_cluster(&self, task: &Task, status: ClusterStatus) -> Result<(), StoreError> {
        if task.cluster_id.is_empty() {
            warn!(task_id = %task.task_id, "cluster task without cluster id");
            return Ok(());
        }
        let updated = self
            .store
            .update_cluster_status(&task.cluster_id, status)
            .await?;
        if !updated {
            warn!(
                task_id = %task.task_id,
                cluster_id = %task.cluster_id,
                "cluster not found during reconciliation"
            );
        }
        Ok(())
    }

    async fn set_node_group(&self, task: &Task, status: NodeGroupStatus) -> Result<(), StoreError> {
        if task.node_group_id.is_empty() {
            warn!(task_id = %task.task_id, "node group task without node group id");
            return Ok(());
        }
        let updated = self
            .store
            .update_node_group_status(&task.node_group_id, status)
            .await?;
        if !updated {
            warn!(
                task_id = %task.task_id,
                node_group_id = %task.node_group_id,
                "node group not found during reconciliation"
            );
        }
        Ok(())
    }

    async fn set_nodes(&self, task: &Task, status: NodeStatus) -> Result<(), StoreError> {
        let ips = node_ips(task);
        if ips.is_empty() {
            warn!(task_id = %task.task_id, "node task without node IPs");
            return Ok(());
        }
        let updated = self.store.update_node_status(&ips, status).await?;
        if updated < ips.len() as u64 {
            warn!(
                task_id = %task.task_id,
                requested = ips.len(),
                updated,
                "some nodes not found during reconciliation"
            );
        }
        Ok(())
    }
}

/// Node IPs come from the task's IP list, falling back to the comma-joined
/// common param written by older callers.
fn node_ips(task: &Task) -> Vec<String> {
    if !task.node_ip_list.is_empty() {
        return task.node_ip_list.clone();
    }
    task.common_params
        .get("nodeIPList")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
