//! Operation log records emitted by lifecycle actions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One audit line correlated to a task by `task_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLog {
    pub id: Uuid,
    pub task_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub operator: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl OperationLog {
    pub fn new(
        task_id: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        operator: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            operator: operator.into(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}
