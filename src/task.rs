//! Task and step data model.
//!
//! A `Task` is a persisted record of one multi-step asynchronous workflow.
//! `step_sequence` is authoritative for ordering; `steps` is unordered
//! storage keyed by step name. `PARTIAL_FAILURE` is derived from step
//! statuses at read time and never written by normal completion.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Task-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    NotStarted,
    Initializing,
    Running,
    Success,
    Failure,
    PartialFailure,
    Timeout,
    Skip,
}

impl TaskStatus {
    /// Retry and Skip are only allowed from these states.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Failure | Self::Timeout)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::PartialFailure | Self::Timeout | Self::Skip
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Initializing => "INITIALIZING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::PartialFailure => "PARTIAL_FAILURE",
            Self::Timeout => "TIMEOUT",
            Self::Skip => "SKIP",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_STARTED" => Ok(Self::NotStarted),
            "INITIALIZING" => Ok(Self::Initializing),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "FAILURE" => Ok(Self::Failure),
            "PARTIAL_FAILURE" => Ok(Self::PartialFailure),
            "TIMEOUT" => Ok(Self::Timeout),
            "SKIP" => Ok(Self::Skip),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Step-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    NotStarted,
    Running,
    Success,
    Failure,
    Skip,
    Timeout,
}

impl StepStatus {
    /// A completed step is not re-executed when its chain is redispatched.
    pub fn is_complete(self) -> bool {
        matches!(self, Self::Success | Self::Skip)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "NOT_STARTED",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Skip => "SKIP",
            Self::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a task was created by an operator or by a control loop.
///
/// Automated task types (desired-node scaling, node cleanup) refuse Retry
/// unless the task origin is Manual, so a human retry cannot race the loop
/// that produced the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOrigin {
    Manual,
    Automated,
}

impl TaskOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "MANUAL",
            Self::Automated => "AUTOMATED",
        }
    }
}

impl FromStr for TaskOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MANUAL" => Ok(Self::Manual),
            "AUTOMATED" => Ok(Self::Automated),
            other => Err(format!("unknown task origin: {other}")),
        }
    }
}

/// One unit of work within a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// Step Registry lookup key.
    pub method: String,
    /// Human-readable name for display; never used for routing.
    pub display_name: String,
    pub params: HashMap<String, String>,
    pub status: StepStatus,
    pub message: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Advisory: whether an operator may reasonably mark this step SKIP on
    /// failure. The engine does not enforce it.
    pub allow_skip: bool,
}

impl Step {
    pub fn new(name: impl Into<String>, method: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            name,
            method: method.into(),
            params: HashMap::new(),
            status: StepStatus::NotStarted,
            message: String::new(),
            start: None,
            end: None,
            allow_skip: false,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn allow_skip(mut self) -> Self {
        self.allow_skip = true;
        self
    }
}

/// Append-only log line tied to `(task_id, step_name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStepLog {
    pub task_id: String,
    pub step_name: String,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl TaskStepLog {
    pub fn info(task_id: &str, step_name: &str, message: impl Into<String>) -> Self {
        Self::with_level(task_id, step_name, "INFO", message)
    }

    pub fn error(task_id: &str, step_name: &str, message: impl Into<String>) -> Self {
        Self::with_level(task_id, step_name, "ERROR", message)
    }

    fn with_level(
        task_id: &str,
        step_name: &str,
        level: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            step_name: step_name.to_string(),
            level: level.to_string(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// A persisted multi-step workflow instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    /// Workflow kind, composed as `"<Domain>-<Operation>"`.
    pub task_type: String,
    pub status: TaskStatus,
    /// Name of the step currently executing or last attempted.
    pub current_step: Option<String>,
    /// Authoritative execution order.
    pub step_sequence: Vec<String>,
    pub steps: HashMap<String, Step>,
    /// Free-form context shared by all steps. Secret-bearing keys are
    /// scrubbed before any task crosses the API boundary.
    pub common_params: HashMap<String, String>,
    pub cluster_id: String,
    pub project_id: String,
    pub node_group_id: String,
    pub node_ip_list: Vec<String>,
    pub creator: String,
    pub updater: String,
    pub message: String,
    pub origin: TaskOrigin,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    pub execution_time_ms: i64,
    /// Optimistic-concurrency token; incremented on every store update.
    pub version: i64,
}

impl Task {
    /// Step sequence and map must be consistent before a task is persisted
    /// or dispatched.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.step_sequence.is_empty() {
            return Err(EngineError::Validation(format!(
                "task {} has an empty step sequence",
                self.task_id
            )));
        }
        for name in &self.step_sequence {
            if !self.steps.contains_key(name) {
                return Err(EngineError::Validation(format!(
                    "task {}: step {name} is in the sequence but missing from the step map",
                    self.task_id
                )));
            }
        }
        if let Some(current) = &self.current_step {
            if !self.step_sequence.iter().any(|s| s == current) {
                return Err(EngineError::Validation(format!(
                    "task {}: current step {current} is not in the step sequence",
                    self.task_id
                )));
            }
        }
        Ok(())
    }

    /// Steps in `step_sequence` order.
    pub fn ordered_steps(&self) -> impl Iterator<Item = &Step> {
        self.step_sequence
            .iter()
            .filter_map(|name| self.steps.get(name))
    }

    /// Terminal status derived from step statuses at read time.
    ///
    /// A later failure after successful steps surfaces as PARTIAL_FAILURE
    /// here; the stored status remains what the worker wrote.
    pub fn derived_status(&self) -> TaskStatus {
        let steps: Vec<&Step> = self.ordered_steps().collect();
        if steps.is_empty() {
            return self.status;
        }
        let any_success = steps.iter().any(|s| s.status == StepStatus::Success);
        if steps.iter().any(|s| s.status == StepStatus::Failure) {
            return if any_success {
                TaskStatus::PartialFailure
            } else {
                TaskStatus::Failure
            };
        }
        if steps.iter().any(|s| s.status == StepStatus::Timeout) {
            return TaskStatus::Timeout;
        }
        if steps.iter().all(|s| s.status.is_complete()) {
            return TaskStatus::Success;
        }
        self.status
    }

    /// Clone with secret-bearing params removed. Mandatory on every read
    /// path out of the lifecycle API.
    pub fn scrubbed(&self) -> Task {
        let mut task = self.clone();
        task.common_params.retain(|k, _| !is_secret_key(k));
        for step in task.steps.values_mut() {
            step.params.retain(|k, _| !is_secret_key(k));
        }
        task
    }
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ["password", "passwd", "secret", "token"]
        .iter()
        .any(|marker| key.contains(marker))
}

/// Parameters for building a new task.
///
/// Steps are given in execution order; the sequence and the step map are
/// derived from them.
pub struct NewTask {
    pub task_type: String,
    pub steps: Vec<Step>,
    pub cluster_id: String,
    pub project_id: String,
    pub node_group_id: String,
    pub node_ip_list: Vec<String>,
    pub common_params: HashMap<String, String>,
    pub creator: String,
    pub origin: TaskOrigin,
}

impl NewTask {
    pub fn new(task_type: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            task_type: task_type.into(),
            steps,
            cluster_id: String::new(),
            project_id: String::new(),
            node_group_id: String::new(),
            node_ip_list: Vec::new(),
            common_params: HashMap::new(),
            creator: String::new(),
            origin: TaskOrigin::Manual,
        }
    }

    pub fn cluster(mut self, cluster_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        self.cluster_id = cluster_id.into();
        self.project_id = project_id.into();
        self
    }

    pub fn node_group(mut self, node_group_id: impl Into<String>) -> Self {
        self.node_group_id = node_group_id.into();
        self
    }

    pub fn node_ips(mut self, ips: Vec<String>) -> Self {
        self.node_ip_list = ips;
        self
    }

    pub fn creator(mut self, creator: impl Into<String>) -> Self {
        self.creator = creator.into();
        self
    }

    pub fn origin(mut self, origin: TaskOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn common_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.common_params.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Task {
        let now = Utc::now();
        let step_sequence: Vec<String> = self.steps.iter().map(|s| s.name.clone()).collect();
        let steps: HashMap<String, Step> = self
            .steps
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        Task {
            task_id: Uuid::new_v4().to_string(),
            task_type: self.task_type,
            status: TaskStatus::Initializing,
            current_step: None,
            step_sequence,
            steps,
            common_params: self.common_params,
            cluster_id: self.cluster_id,
            project_id: self.project_id,
            node_group_id: self.node_group_id,
            node_ip_list: self.node_ip_list,
            updater: self.creator.clone(),
            creator: self.creator,
            message: String::new(),
            origin: self.origin,
            start: now,
            end: None,
            last_update: now,
            execution_time_ms: 0,
            version: 0,
        }
    }
}

/// Partial-field merge applied by the Update action and worker callbacks.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub message: Option<String>,
    pub current_step: Option<String>,
    /// Replaces matching entries of the step map; other steps are untouched.
    pub steps: Option<HashMap<String, Step>>,
    pub end: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub updater: Option<String>,
}

impl TaskPatch {
    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(message) = &self.message {
            task.message = message.clone();
        }
        if let Some(current) = &self.current_step {
            task.current_step = Some(current.clone());
        }
        if let Some(steps) = &self.steps {
            for (name, step) in steps {
                task.steps.insert(name.clone(), step.clone());
            }
        }
        if let Some(end) = self.end {
            task.end = Some(end);
        }
        if let Some(execution_time_ms) = self.execution_time_ms {
            task.execution_time_ms = execution_time_ms;
        }
        if let Some(updater) = &self.updater {
            task.updater = updater.clone();
        }
        task.last_update = Utc::now();
    }
}

/// Workflow kinds produced by the domain actions.
pub mod task_types {
    pub const CREATE_CLUSTER: &str = "Cluster-CreateCluster";
    pub const IMPORT_CLUSTER: &str = "Cluster-ImportCluster";
    pub const DELETE_CLUSTER: &str = "Cluster-DeleteCluster";
    pub const ADD_NODES: &str = "Cluster-AddNodes";
    pub const REMOVE_NODES: &str = "Cluster-RemoveNodes";
    pub const CREATE_NODE_GROUP: &str = "NodeGroup-CreateNodeGroup";
    pub const DELETE_NODE_GROUP: &str = "NodeGroup-DeleteNodeGroup";
    pub const UPDATE_DESIRED_NODE: &str = "NodeGroup-UpdateDesiredNode";
    pub const CLEAN_NODES: &str = "NodeGroup-CleanNodes";
    pub const ENABLE_AUTO_SCALE: &str = "NodeGroup-EnableAutoScale";
    pub const DISABLE_AUTO_SCALE: &str = "NodeGroup-DisableAutoScale";

    /// Task types also produced by autoscaling control loops. Retrying one
    /// of these requires a Manual origin so an operator cannot race the
    /// loop by accident.
    pub fn retry_requires_manual(task_type: &str) -> bool {
        task_type == UPDATE_DESIRED_NODE || task_type == CLEAN_NODES
    }
}
