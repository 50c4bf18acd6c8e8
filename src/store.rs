//! Task store contract and the Postgres implementation.
//!
//! The store is the single source of truth for tasks, step logs, domain
//! entities and operation logs. Task updates are compare-and-swap on the
//! task's version field, so concurrent writers (lifecycle actions, worker
//! callbacks) cannot silently lose writes.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::audit::OperationLog;
use crate::broker::{Broker, Chain, ChainOutcome, StepInvocation};
use crate::entity::{Cluster, ClusterStatus, Node, NodeGroup, NodeGroupStatus, NodeStatus};
use crate::error::StoreError;
use crate::task::{Task, TaskPatch, TaskStatus, TaskStepLog};

/// Filters accepted by the List action. All fields are ANDed.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub cluster_id: Option<String>,
    pub project_id: Option<String>,
    pub node_group_id: Option<String>,
    pub creator: Option<String>,
    pub updater: Option<String>,
    pub task_type: Option<String>,
    pub status: Option<TaskStatus>,
    pub node_ip: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ListOptions {
    pub offset: i64,
    pub limit: i64,
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 1000,
        }
    }
}

const MUTATE_ATTEMPTS: u32 = 3;

/// Durable CRUD consumed by the engine.
///
/// Results of `list_tasks` are sorted by start time descending.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Compare-and-swap on `task.version`; returns the stored task with the
    /// incremented version.
    async fn update_task(&self, task: &Task) -> Result<Task, StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Task, StoreError>;

    async fn delete_task(&self, task_id: &str) -> Result<(), StoreError>;

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        opts: &ListOptions,
    ) -> Result<Vec<Task>, StoreError>;

    /// Partial-field merge with bounded CAS retry. The merged task is
    /// re-validated before the write, so a patch cannot store a
    /// `current_step` that is missing from the step sequence.
    async fn patch_task(&self, task_id: &str, patch: &TaskPatch) -> Result<Task, StoreError> {
        for attempt in 0..MUTATE_ATTEMPTS {
            let mut task = self.get_task(task_id).await?;
            patch.apply(&mut task);
            task.validate().map_err(|err| StoreError::InvalidTask {
                task_id: task_id.to_string(),
                reason: err.to_string(),
            })?;
            match self.update_task(&task).await {
                Ok(stored) => return Ok(stored),
                Err(StoreError::VersionConflict { .. }) if attempt + 1 < MUTATE_ATTEMPTS => {
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::VersionConflict {
            task_id: task_id.to_string(),
            expected: -1,
        })
    }

    async fn append_step_log(&self, log: &TaskStepLog) -> Result<(), StoreError>;

    async fn list_step_logs(
        &self,
        task_id: &str,
        step_name: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<Vec<TaskStepLog>, StoreError>;

    async fn upsert_cluster(&self, cluster: &Cluster) -> Result<(), StoreError>;

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<Cluster>, StoreError>;

    /// Returns false when the cluster no longer exists.
    async fn update_cluster_status(
        &self,
        cluster_id: &str,
        status: ClusterStatus,
    ) -> Result<bool, StoreError>;

    async fn upsert_node_group(&self, group: &NodeGroup) -> Result<(), StoreError>;

    async fn get_node_group(&self, node_group_id: &str) -> Result<Option<NodeGroup>, StoreError>;

    async fn update_node_group_status(
        &self,
        node_group_id: &str,
        status: NodeGroupStatus,
    ) -> Result<bool, StoreError>;

    async fn upsert_node(&self, node: &Node) -> Result<(), StoreError>;

    async fn get_node(&self, inner_ip: &str) -> Result<Option<Node>, StoreError>;

    /// Returns the number of nodes updated.
    async fn update_node_status(
        &self,
        inner_ips: &[String],
        status: NodeStatus,
    ) -> Result<u64, StoreError>;

    async fn append_operation_log(&self, log: &OperationLog) -> Result<(), StoreError>;

    async fn list_operation_logs(
        &self,
        task_id: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<Vec<OperationLog>, StoreError>;
}

/// Load-mutate-update with bounded retry on version conflicts.
pub async fn mutate_task<F>(
    store: &dyn TaskStore,
    task_id: &str,
    mutate: F,
) -> Result<Task, StoreError>
where
    F: Fn(&mut Task) + Send + Sync,
{
    for attempt in 0..MUTATE_ATTEMPTS {
        let mut task = store.get_task(task_id).await?;
        mutate(&mut task);
        task.last_update = Utc::now();
        match store.update_task(&task).await {
            Ok(stored) => return Ok(stored),
            Err(StoreError::VersionConflict { .. }) if attempt + 1 < MUTATE_ATTEMPTS => continue,
            Err(err) => return Err(err),
        }
    }
    Err(StoreError::VersionConflict {
        task_id: task_id.to_string(),
        expected: -1,
    })
}

/// Postgres-backed store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        task_id TEXT PRIMARY KEY,
        task_type TEXT NOT NULL,
        status TEXT NOT NULL,
        current_step TEXT,
        step_sequence JSONB NOT NULL,
        steps JSONB NOT NULL,
        common_params JSONB NOT NULL,
        cluster_id TEXT NOT NULL DEFAULT '',
        project_id TEXT NOT NULL DEFAULT '',
        node_group_id TEXT NOT NULL DEFAULT '',
        node_ip_list JSONB NOT NULL,
        creator TEXT NOT NULL DEFAULT '',
        updater TEXT NOT NULL DEFAULT '',
        message TEXT NOT NULL DEFAULT '',
        origin TEXT NOT NULL,
        start_time TIMESTAMPTZ NOT NULL,
        end_time TIMESTAMPTZ,
        last_update TIMESTAMPTZ NOT NULL,
        execution_time_ms BIGINT NOT NULL DEFAULT 0,
        version BIGINT NOT NULL DEFAULT 0
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_cluster ON tasks(cluster_id)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_start ON tasks(start_time DESC)",
    r#"
    CREATE TABLE IF NOT EXISTS task_step_logs (
        id BIGSERIAL PRIMARY KEY,
        task_id TEXT NOT NULL,
        step_name TEXT NOT NULL,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_step_logs_task ON task_step_logs(task_id, step_name, created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS task_chains (
        id UUID PRIMARY KEY,
        task_id TEXT NOT NULL,
        invocations JSONB NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_task_chains_pending
        ON task_chains(status, created_at)
        WHERE status = 'pending'
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS clusters (
        cluster_id TEXT PRIMARY KEY,
        project_id TEXT NOT NULL DEFAULT '',
        provider TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS node_groups (
        node_group_id TEXT PRIMARY KEY,
        cluster_id TEXT NOT NULL DEFAULT '',
        desired_size INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        inner_ip TEXT PRIMARY KEY,
        cluster_id TEXT NOT NULL DEFAULT '',
        node_group_id TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS operation_logs (
        id UUID PRIMARY KEY,
        task_id TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        resource_id TEXT NOT NULL,
        operator TEXT NOT NULL DEFAULT '',
        message TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_operation_logs_task ON operation_logs(task_id, created_at)",
];

impl PostgresStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let status: String = row.get("status");
    let origin: String = row.get("origin");
    Ok(Task {
        task_id: row.get("task_id"),
        task_type: row.get("task_type"),
        status: serde_json::from_value(Value::String(status))?,
        current_step: row.get("current_step"),
        step_sequence: serde_json::from_value(row.get("step_sequence"))?,
        steps: serde_json::from_value(row.get("steps"))?,
        common_params: serde_json::from_value(row.get("common_params"))?,
        cluster_id: row.get("cluster_id"),
        project_id: row.get("project_id"),
        node_group_id: row.get("node_group_id"),
        node_ip_list: serde_json::from_value(row.get("node_ip_list"))?,
        creator: row.get("creator"),
        updater: row.get("updater"),
        message: row.get("message"),
        origin: serde_json::from_value(Value::String(origin))?,
        start: row.get("start_time"),
        end: row.get("end_time"),
        last_update: row.get("last_update"),
        execution_time_ms: row.get("execution_time_ms"),
        version: row.get("version"),
    })
}

#[async_trait]
impl TaskStore for PostgresStore {
    async fn create_task(&self, task: &Task) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, task_type, status, current_step, step_sequence, steps,
                common_params, cluster_id, project_id, node_group_id, node_ip_list,
                creator, updater, message, origin, start_time, end_time, last_update,
                execution_time_ms, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.task_type)
        .bind(task.status.as_str())
        .bind(&task.current_step)
        .bind(serde_json::to_value(&task.step_sequence)?)
        .bind(serde_json::to_value(&task.steps)?)
        .bind(serde_json::to_value(&task.common_params)?)
        .bind(&task.cluster_id)
        .bind(&task.project_id)
        .bind(&task.node_group_id)
        .bind(serde_json::to_value(&task.node_ip_list)?)
        .bind(&task.creator)
        .bind(&task.updater)
        .bind(&task.message)
        .bind(task.origin.as_str())
        .bind(task.start)
        .bind(task.end)
        .bind(task.last_update)
        .bind(task.execution_time_ms)
        .bind(task.version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_task(&self, task: &Task) -> Result<Task, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                task_type = $2, status = $3, current_step = $4, step_sequence = $5,
                steps = $6, common_params = $7, cluster_id = $8, project_id = $9,
                node_group_id = $10, node_ip_list = $11, creator = $12, updater = $13,
                message = $14, origin = $15, start_time = $16, end_time = $17,
                last_update = $18, execution_time_ms = $19, version = version + 1
            WHERE task_id = $1 AND version = $20
            "#,
        )
        .bind(&task.task_id)
        .bind(&task.task_type)
        .bind(task.status.as_str())
        .bind(&task.current_step)
        .bind(serde_json::to_value(&task.step_sequence)?)
        .bind(serde_json::to_value(&task.steps)?)
        .bind(serde_json::to_value(&task.common_params)?)
        .bind(&task.cluster_id)
        .bind(&task.project_id)
        .bind(&task.node_group_id)
        .bind(serde_json::to_value(&task.node_ip_list)?)
        .bind(&task.creator)
        .bind(&task.updater)
        .bind(&task.message)
        .bind(task.origin.as_str())
        .bind(task.start)
        .bind(task.end)
        .bind(task.last_update)
        .bind(task.execution_time_ms)
        .bind(task.version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Either the task is gone or a concurrent writer advanced the
            // version; a fresh read tells them apart.
            let exists = sqlx::query("SELECT 1 FROM tasks WHERE task_id = $1")
                .bind(&task.task_id)
                .fetch_optional(&self.pool)
                .await?;
            return Err(match exists {
                Some(_) => StoreError::VersionConflict {
                    task_id: task.task_id.clone(),
                    expected: task.version,
                },
                None => StoreError::not_found("task", &task.task_id),
            });
        }

        let mut stored = task.clone();
        stored.version += 1;
        Ok(stored)
    }

    async fn get_task(&self, task_id: &str) -> Result<Task, StoreError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::not_found("task", task_id))?;
        task_from_row(&row)
    }

    async fn delete_task(&self, task_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM tasks WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("task", task_id));
        }
        Ok(())
    }

    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        opts: &ListOptions,
    ) -> Result<Vec<Task>, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM tasks WHERE 1=1");
        if let Some(cluster_id) = &filter.cluster_id {
            qb.push(" AND cluster_id = ").push_bind(cluster_id);
        }
        if let Some(project_id) = &filter.project_id {
            qb.push(" AND project_id = ").push_bind(project_id);
        }
        if let Some(node_group_id) = &filter.node_group_id {
            qb.push(" AND node_group_id = ").push_bind(node_group_id);
        }
        if let Some(creator) = &filter.creator {
            qb.push(" AND creator = ").push_bind(creator);
        }
        if let Some(updater) = &filter.updater {
            qb.push(" AND updater = ").push_bind(updater);
        }
        if let Some(task_type) = &filter.task_type {
            qb.push(" AND task_type = ").push_bind(task_type);
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(node_ip) = &filter.node_ip {
            qb.push(" AND node_ip_list @> ")
                .push_bind(serde_json::json!([node_ip]));
        }
        qb.push(" ORDER BY start_time DESC LIMIT ")
            .push_bind(opts.limit)
            .push(" OFFSET ")
            .push_bind(opts.offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn append_step_log(&self, log: &TaskStepLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO task_step_logs (task_id, step_name, level, message, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&log.task_id)
        .bind(&log.step_name)
        .bind(&log.level)
        .bind(&log.message)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_step_logs(
        &self,
        task_id: &str,
        step_name: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<Vec<TaskStepLog>, StoreError> {
        let limit = effective_limit(limit);
        let offset = page_offset(page, limit);
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT task_id, step_name, level, message, created_at FROM task_step_logs WHERE task_id = ",
        );
        qb.push_bind(task_id);
        if let Some(step_name) = step_name {
            qb.push(" AND step_name = ").push_bind(step_name);
        }
        qb.push(" ORDER BY id ASC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| TaskStepLog {
                task_id: row.get("task_id"),
                step_name: row.get("step_name"),
                level: row.get("level"),
                message: row.get("message"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn upsert_cluster(&self, cluster: &Cluster) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO clusters (cluster_id, project_id, provider, status, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (cluster_id) DO UPDATE SET
                project_id = EXCLUDED.project_id,
                provider = EXCLUDED.provider,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&cluster.cluster_id)
        .bind(&cluster.project_id)
        .bind(&cluster.provider)
        .bind(cluster.status.as_str())
        .bind(cluster.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_cluster(&self, cluster_id: &str) -> Result<Option<Cluster>, StoreError> {
        let row = sqlx::query("SELECT * FROM clusters WHERE cluster_id = $1")
            .bind(cluster_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let status: String = row.get("status");
            Ok(Cluster {
                cluster_id: row.get("cluster_id"),
                project_id: row.get("project_id"),
                provider: row.get("provider"),
                status: serde_json::from_value(Value::String(status))?,
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }

    async fn update_cluster_status(
        &self,
        cluster_id: &str,
        status: ClusterStatus,
    ) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE clusters SET status = $2, updated_at = $3 WHERE cluster_id = $1")
                .bind(cluster_id)
                .bind(status.as_str())
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_node_group(&self, group: &NodeGroup) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO node_groups (node_group_id, cluster_id, desired_size, status, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (node_group_id) DO UPDATE SET
                cluster_id = EXCLUDED.cluster_id,
                desired_size = EXCLUDED.desired_size,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&group.node_group_id)
        .bind(&group.cluster_id)
        .bind(group.desired_size)
        .bind(group.status.as_str())
        .bind(group.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_node_group(&self, node_group_id: &str) -> Result<Option<NodeGroup>, StoreError> {
        let row = sqlx::query("SELECT * FROM node_groups WHERE node_group_id = $1")
            .bind(node_group_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let status: String = row.get("status");
            Ok(NodeGroup {
                node_group_id: row.get("node_group_id"),
                cluster_id: row.get("cluster_id"),
                desired_size: row.get("desired_size"),
                status: serde_json::from_value(Value::String(status))?,
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }

    async fn update_node_group_status(
        &self,
        node_group_id: &str,
        status: NodeGroupStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE node_groups SET status = $2, updated_at = $3 WHERE node_group_id = $1",
        )
        .bind(node_group_id)
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_node(&self, node: &Node) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO nodes (inner_ip, cluster_id, node_group_id, status, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (inner_ip) DO UPDATE SET
                cluster_id = EXCLUDED.cluster_id,
                node_group_id = EXCLUDED.node_group_id,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&node.inner_ip)
        .bind(&node.cluster_id)
        .bind(&node.node_group_id)
        .bind(node.status.as_str())
        .bind(node.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_node(&self, inner_ip: &str) -> Result<Option<Node>, StoreError> {
        let row = sqlx::query("SELECT * FROM nodes WHERE inner_ip = $1")
            .bind(inner_ip)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let status: String = row.get("status");
            Ok(Node {
                inner_ip: row.get("inner_ip"),
                cluster_id: row.get("cluster_id"),
                node_group_id: row.get("node_group_id"),
                status: serde_json::from_value(Value::String(status))?,
                updated_at: row.get("updated_at"),
            })
        })
        .transpose()
    }

    async fn update_node_status(
        &self,
        inner_ips: &[String],
        status: NodeStatus,
    ) -> Result<u64, StoreError> {
        if inner_ips.is_empty() {
            return Ok(0);
        }
        let result =
            sqlx::query("UPDATE nodes SET status = $2, updated_at = $3 WHERE inner_ip = ANY($1)")
                .bind(inner_ips)
                .bind(status.as_str())
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn append_operation_log(&self, log: &OperationLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO operation_logs (id, task_id, resource_type, resource_id, operator, message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(log.id)
        .bind(&log.task_id)
        .bind(&log.resource_type)
        .bind(&log.resource_id)
        .bind(&log.operator)
        .bind(&log.message)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_operation_logs(
        &self,
        task_id: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<Vec<OperationLog>, StoreError> {
        let limit = effective_limit(limit);
        let offset = page_offset(page, limit);
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM operation_logs WHERE 1=1");
        if let Some(task_id) = task_id {
            qb.push(" AND task_id = ").push_bind(task_id);
        }
        qb.push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| OperationLog {
                id: row.get("id"),
                task_id: row.get("task_id"),
                resource_type: row.get("resource_type"),
                resource_id: row.get("resource_id"),
                operator: row.get("operator"),
                message: row.get("message"),
                created_at: row.get("created_at"),
            })
            .collect())
    }
}

fn effective_limit(limit: u32) -> i64 {
    if limit == 0 {
        100
    } else {
        limit as i64
    }
}

fn page_offset(page: u32, limit: i64) -> i64 {
    (page.saturating_sub(1) as i64) * limit
}

/// Postgres-backed broker: the chain queue lives next to the task data and
/// workers claim chains with `FOR UPDATE SKIP LOCKED`.
pub struct PostgresBroker {
    pool: Pool<Postgres>,
}

impl PostgresBroker {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Broker for PostgresBroker {
    async fn submit(&self, chain: Chain) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO task_chains (id, task_id, invocations, status) VALUES ($1, $2, $3, 'pending')",
        )
        .bind(chain.id)
        .bind(&chain.task_id)
        .bind(serde_json::to_value(&chain.invocations)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dequeue(&self) -> anyhow::Result<Option<Chain>> {
        let row = sqlx::query(
            r#"
            UPDATE task_chains
            SET status = 'running', started_at = NOW()
            WHERE id = (
                SELECT id FROM task_chains
                WHERE status = 'pending'
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, task_id, invocations
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let invocations: Vec<StepInvocation> =
                    serde_json::from_value(row.get("invocations"))?;
                Ok(Some(Chain {
                    id: row.get("id"),
                    task_id: row.get("task_id"),
                    invocations,
                }))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, chain_id: Uuid, outcome: ChainOutcome) -> anyhow::Result<()> {
        let status = match outcome {
            ChainOutcome::Succeeded => "succeeded",
            ChainOutcome::Failed => "failed",
        };
        sqlx::query("UPDATE task_chains SET status = $2, completed_at = NOW() WHERE id = $1")
            .bind(chain_id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn result(&self, chain_id: Uuid) -> anyhow::Result<Option<ChainOutcome>> {
        let row = sqlx::query("SELECT status FROM task_chains WHERE id = $1")
            .bind(chain_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|row| {
            let status: String = row.get("status");
            match status.as_str() {
                "succeeded" => Some(ChainOutcome::Succeeded),
                "failed" => Some(ChainOutcome::Failed),
                _ => None,
            }
        }))
    }
}
