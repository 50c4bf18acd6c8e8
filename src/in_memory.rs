//! In-memory store used by unit and integration tests and local runs.
//!
//! Mirrors the Postgres store's semantics exactly, including version CAS on
//! task updates, so engine tests exercise the same conflict paths.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::audit::OperationLog;
use crate::entity::{Cluster, ClusterStatus, Node, NodeGroup, NodeGroupStatus, NodeStatus};
use crate::error::StoreError;
use crate::store::{ListOptions, TaskFilter, TaskStore};
use crate::task::{Task, TaskStepLog};

#[derive(Default)]
struct MemoryStoreInner {
    tasks: HashMap<String, Task>,
    step_logs: Vec<TaskStepLog>,
    clusters: HashMap<String, Cluster>,
    node_groups: HashMap<String, NodeGroup>,
    nodes: HashMap<String, Node>,
    operation_logs: Vec<OperationLog>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn matches_filter(task: &Task, filter: &TaskFilter) -> bool {
    if let Some(cluster_id) = &filter.cluster_id {
        if &task.cluster_id != cluster_id {
            return false;
        }
    }
    if let Some(project_id) = &filter.project_id {
        if &task.project_id != project_id {
            return false;
        }
    }
    if let Some(node_group_id) = &filter.node_group_id {
        if &task.node_group_id != node_group_id {
            return false;
        }
    }
    if let Some(creator) = &filter.creator {
        if &task.creator != creator {
            return false;
        }
    }
    if let Some(updater) = &filter.updater {
        if &task.updater != updater {
            return false;
        }
    }
    if let Some(task_type) = &filter.task_type {
        if &task.task_type != task_type {
            return false;
        }
    }
    if let Some(status) = filter.status {
        if task.status != status {
            return false;
        }
    }
    if let Some(node_ip) = &filter.node_ip {
        if !task.node_ip_list.iter().any(|ip| ip == node_ip) {
            return false;
        }
    }
    true
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.tasks.contains_key(&task.task_id) {
            return Err(StoreError::AlreadyExists {
                kind: "task",
                id: task.task_id.clone(),
            });
        }
        inner.tasks.insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<Task, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let existing = inner
            .tasks
            .get_mut(&task.task_id)
            .ok_or_else(|| StoreError::not_found("task", &task.task_id))?;
        if existing.version != task.version {
            return Err(StoreError::VersionConflict {
                task_id: task.task_id.clone(),
                expected: task.version,
            });
        }
        let mut stored = task.clone();
        stored.version += 1;
        *existing = stored.clone();
        Ok(stored)
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("task", task_id))
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner
            .tasks
            .remove(task_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found("task", task_id))
    }

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        opts: &ListOptions,
    ) -> Result<Vec<Task>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|task| matches_filter(task, filter))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.start.cmp(&a.start));
        let offset = opts.offset.max(0) as usize;
        let limit = opts.limit.max(0) as usize;
        Ok(tasks.into_iter().skip(offset).take(limit).collect())
    }

    async fn append_step_log(&self, log: &TaskStepLog) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.step_logs.push(log.clone());
        Ok(())
    }

    async fn list_step_logs(
        &self,
        task_id: &str,
        step_name: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<Vec<TaskStepLog>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let limit = if limit == 0 { 100 } else { limit } as usize;
        let offset = page.saturating_sub(1) as usize * limit;
        Ok(inner
            .step_logs
            .iter()
            .filter(|log| {
                log.task_id == task_id
                    && step_name.map_or(true, |name| log.step_name == name)
            })
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_cluster(&self, cluster: &Cluster) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner
            .clusters
            .insert(cluster.cluster_id.clone(), cluster.clone());
        Ok(())
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<Cluster>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.clusters.get(cluster_id).cloned())
    }

    async fn update_cluster_status(
        &self,
        cluster_id: &str,
        status: ClusterStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        match inner.clusters.get_mut(cluster_id) {
            Some(cluster) => {
                cluster.status = status;
                cluster.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_node_group(&self, group: &NodeGroup) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner
            .node_groups
            .insert(group.node_group_id.clone(), group.clone());
        Ok(())
    }

    async fn get_node_group(&self, node_group_id: &str) -> Result<Option<NodeGroup>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.node_groups.get(node_group_id).cloned())
    }

    async fn update_node_group_status(
        &self,
        node_group_id: &str,
        status: NodeGroupStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        match inner.node_groups.get_mut(node_group_id) {
            Some(group) => {
                group.status = status;
                group.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn upsert_node(&self, node: &Node) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.nodes.insert(node.inner_ip.clone(), node.clone());
        Ok(())
    }

    async fn get_node(&self, inner_ip: &str) -> Result<Option<Node>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        Ok(inner.nodes.get(inner_ip).cloned())
    }

    async fn update_node_status(
        &self,
        inner_ips: &[String],
        status: NodeStatus,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let mut updated = 0;
        for ip in inner_ips {
            if let Some(node) = inner.nodes.get_mut(ip) {
                node.status = status;
                node.updated_at = Utc::now();
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn append_operation_log(&self, log: &OperationLog) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.operation_logs.push(log.clone());
        Ok(())
    }

    async fn list_operation_logs(
        &self,
        task_id: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<Vec<OperationLog>, StoreError> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let limit = if limit == 0 { 100 } else { limit } as usize;
        let offset = page.saturating_sub(1) as usize * limit;
        let mut logs: Vec<OperationLog> = inner
            .operation_logs
            .iter()
            .filter(|log| task_id.map_or(true, |id| log.task_id == id))
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(logs.into_iter().skip(offset).take(limit).collect())
    }
}
