//! Task lifecycle actions: the engine's public surface.
//!
//! Every action validates state locally, mutates through the store's CAS
//! path and emits an operation log entry. Tasks returned to callers are
//! always scrubbed of secret-bearing params, and their status is the
//! derived one so a partial failure is visible without being stored.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::audit::OperationLog;
use crate::dispatcher::Dispatch;
use crate::error::EngineError;
use crate::reconciler::StatusReconciler;
use crate::store::{mutate_task, ListOptions, TaskFilter, TaskStore};
use crate::task::{task_types, NewTask, StepStatus, Task, TaskOrigin, TaskPatch, TaskStatus, TaskStepLog};

pub struct TaskLifecycle {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<dyn Dispatch>,
    reconciler: StatusReconciler,
}

impl TaskLifecycle {
    pub fn new(store: Arc<dyn TaskStore>, dispatcher: Arc<dyn Dispatch>) -> Self {
        let reconciler = StatusReconciler::new(Arc::clone(&store));
        Self {
            store,
            dispatcher,
            reconciler,
        }
    }

    /// Creates, persists and dispatches a new task. On dispatch failure the
    /// task is left in FAILURE with the broker error as its message.
    pub async fn create(&self, new: NewTask) -> Result<Task, EngineError> {
        let task = new.build();
        task.validate()?;
        self.store.create_task(&task).await.map_err(EngineError::Store)?;
        self.reconciler.reconcile(&task).await?;

        let running = mutate_task(self.store.as_ref(), &task.task_id, |t| {
            t.status = TaskStatus::Running;
        })
        .await?;

        match self.dispatcher.dispatch(&running).await {
            Ok(chain_id) => {
                info!(task_id = %running.task_id, %chain_id, "task created and dispatched");
                self.audit(&running, &running.creator, "task created").await;
                Ok(running.scrubbed())
            }
            Err(err) => {
                let message = format!("dispatch failed: {err}");
                let failed = mutate_task(self.store.as_ref(), &running.task_id, |t| {
                    t.status = TaskStatus::Failure;
                    t.message = message.clone();
                    t.end = Some(Utc::now());
                })
                .await?;
                self.audit(&failed, &failed.creator, "task creation failed at dispatch")
                    .await;
                Err(err)
            }
        }
    }

    pub async fn get(&self, task_id: &str) -> Result<Task, EngineError> {
        let mut task = self.store.get_task(task_id).await?.scrubbed();
        task.status = task.derived_status();
        Ok(task)
    }

    /// Filtered list, newest first. Also returns the most recent matching
    /// task so dashboards can show the latest operation without a second
    /// query.
    pub async fn list(
        &self,
        filter: &TaskFilter,
        opts: &ListOptions,
    ) -> Result<(Vec<Task>, Option<Task>), EngineError> {
        let tasks: Vec<Task> = self
            .store
            .list_tasks(filter, opts)
            .await?
            .into_iter()
            .map(|t| {
                let mut t = t.scrubbed();
                t.status = t.derived_status();
                t
            })
            .collect();
        let latest = tasks.first().cloned();
        Ok((tasks, latest))
    }

    /// Admin-level partial update. No state gating: operators use this to
    /// repair stuck records, including writing PARTIAL_FAILURE explicitly.
    pub async fn update(&self, task_id: &str, patch: &TaskPatch) -> Result<Task, EngineError> {
        let updated = self.store.patch_task(task_id, patch).await?;
        let operator = patch.updater.clone().unwrap_or_default();
        self.audit(&updated, &operator, "task updated").await;
        Ok(updated.scrubbed())
    }

    /// Redispatches a failed or timed-out task's full chain. Completed steps
    /// are passed over by the worker, so only remaining work reruns.
    pub async fn retry(&self, task_id: &str, operator: &str) -> Result<Task, EngineError> {
        let task = self.store.get_task(task_id).await?;
        if !task.status.is_retryable() {
            return Err(EngineError::StateConflict {
                task_id: task_id.to_string(),
                action: "retry",
                reason: format!("status is {}", task.status),
            });
        }
        if task_types::retry_requires_manual(&task.task_type) && task.origin != TaskOrigin::Manual
        {
            return Err(EngineError::StateConflict {
                task_id: task_id.to_string(),
                action: "retry",
                reason: format!(
                    "{} tasks of automated origin cannot be retried",
                    task.task_type
                ),
            });
        }

        let operator_owned = operator.to_string();
        let running = mutate_task(self.store.as_ref(), task_id, move |t| {
            t.status = TaskStatus::Running;
            t.message.clear();
            t.end = None;
            t.updater = operator_owned.clone();
        })
        .await?;

        match self.dispatcher.dispatch(&running).await {
            Ok(chain_id) => {
                info!(%task_id, %chain_id, operator, "task retried");
                self.audit(&running, operator, "task retried").await;
                Ok(running.scrubbed())
            }
            Err(err) => {
                let message = format!("retry dispatch failed: {err}");
                mutate_task(self.store.as_ref(), task_id, |t| {
                    t.status = TaskStatus::Failure;
                    t.message = message.clone();
                    t.end = Some(Utc::now());
                })
                .await?;
                Err(err)
            }
        }
    }

    /// Marks the failed step SKIP and resumes from the step after it. When
    /// the skipped step was the last one, nothing is dispatched and the task
    /// stays RUNNING until an operator resolves it.
    pub async fn skip_current_step(
        &self,
        task_id: &str,
        operator: &str,
    ) -> Result<Task, EngineError> {
        let task = self.store.get_task(task_id).await?;
        if !task.status.is_retryable() {
            return Err(EngineError::StateConflict {
                task_id: task_id.to_string(),
                action: "skip",
                reason: format!("status is {}", task.status),
            });
        }
        let current = task.current_step.clone().ok_or_else(|| EngineError::StateConflict {
            task_id: task_id.to_string(),
            action: "skip",
            reason: "task has no current step".to_string(),
        })?;
        if !task.steps.contains_key(&current) {
            return Err(EngineError::StateConflict {
                task_id: task_id.to_string(),
                action: "skip",
                reason: format!("current step {current} is not in the step map"),
            });
        }
        if let Some(step) = task.steps.get(&current) {
            if !step.allow_skip {
                warn!(%task_id, step = %current, "skipping a step not marked skippable");
            }
        }

        let current_for_update = current.clone();
        let operator_owned = operator.to_string();
        let running = mutate_task(self.store.as_ref(), task_id, move |t| {
            if let Some(step) = t.steps.get_mut(&current_for_update) {
                step.status = StepStatus::Skip;
                step.end = Some(Utc::now());
                step.message = format!("skipped by {operator_owned}");
            }
            t.status = TaskStatus::Running;
            t.message.clear();
            t.end = None;
            t.updater = operator_owned.clone();
        })
        .await?;

        match self.dispatcher.dispatch_from(&running, &current).await {
            Ok(Some(chain_id)) => {
                info!(%task_id, %chain_id, skipped = %current, operator, "task resumed past step");
                self.audit(&running, operator, "step skipped, task resumed").await;
                Ok(running.scrubbed())
            }
            Ok(None) => {
                info!(%task_id, skipped = %current, operator, "last step skipped; no dispatch");
                self.audit(&running, operator, "final step skipped").await;
                Ok(running.scrubbed())
            }
            Err(err) => {
                let message = format!("skip dispatch failed: {err}");
                mutate_task(self.store.as_ref(), task_id, |t| {
                    t.status = TaskStatus::Failure;
                    t.message = message.clone();
                    t.end = Some(Utc::now());
                })
                .await?;
                Err(err)
            }
        }
    }

    /// Admin delete of a task record. The chain, if any, is left to drain;
    /// workers tolerate a missing task.
    pub async fn delete(&self, task_id: &str, operator: &str) -> Result<(), EngineError> {
        let task = self.store.get_task(task_id).await?;
        self.store.delete_task(task_id).await?;
        self.audit(&task, operator, "task deleted").await;
        Ok(())
    }

    pub async fn step_logs(
        &self,
        task_id: &str,
        step_name: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<Vec<TaskStepLog>, EngineError> {
        Ok(self
            .store
            .list_step_logs(task_id, step_name, page, limit)
            .await?)
    }

    pub async fn operation_logs(
        &self,
        task_id: Option<&str>,
        page: u32,
        limit: u32,
    ) -> Result<Vec<OperationLog>, EngineError> {
        Ok(self.store.list_operation_logs(task_id, page, limit).await?)
    }

    /// Audit failures are logged and swallowed: the action already happened.
    async fn audit(&self, task: &Task, operator: &str, message: &str) {
        let (resource_type, resource_id) = if !task.node_group_id.is_empty() {
            ("node_group", task.node_group_id.as_str())
        } else {
            ("cluster", task.cluster_id.as_str())
        };
        let log = OperationLog::new(
            &task.task_id,
            resource_type,
            resource_id,
            operator,
            message,
        );
        if let Err(err) = self.store.append_operation_log(&log).await {
            warn!(task_id = %task.task_id, error = %err, "failed to write operation log");
        }
    }
}
