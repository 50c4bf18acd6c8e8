//! Process-wide step registry.
//!
//! Populated once at startup by every cloud-provider module and by the
//! shared/common actions, then frozen; duplicate method names are a fatal
//! configuration error. Only the worker pool resolves entries; the
//! dispatcher references method names without resolving them.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{EngineError, StoreError};
use crate::store::TaskStore;
use crate::task::{Step, Task};

pub type StepFuture = BoxFuture<'static, anyhow::Result<()>>;

/// An executable unit of work, looked up by a step's method name.
pub type StepFn = Arc<dyn Fn(StepContext) -> StepFuture + Send + Sync>;

/// The two-argument invocation contract: executables receive the task id and
/// step name, and re-fetch their params from the store themselves.
#[derive(Clone)]
pub struct StepContext {
    pub task_id: String,
    pub step_name: String,
    pub store: Arc<dyn TaskStore>,
}

impl StepContext {
    pub async fn load_task(&self) -> Result<Task, StoreError> {
        self.store.get_task(&self.task_id).await
    }

    pub async fn load_step(&self) -> Result<Step, StoreError> {
        let task = self.load_task().await?;
        task.steps.get(&self.step_name).cloned().ok_or_else(|| {
            StoreError::not_found("step", format!("{}/{}", self.task_id, self.step_name))
        })
    }
}

#[derive(Default)]
pub struct StepRegistryBuilder {
    entries: HashMap<String, StepFn>,
}

impl std::fmt::Debug for StepRegistryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistryBuilder")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StepRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registration is fail-fast: two modules registering the same method
    /// name would silently shadow each other otherwise.
    pub fn register<F>(
        &mut self,
        method: impl Into<String>,
        step: F,
    ) -> Result<&mut Self, EngineError>
    where
        F: Fn(StepContext) -> StepFuture + Send + Sync + 'static,
    {
        let method = method.into();
        if self.entries.contains_key(&method) {
            return Err(EngineError::Validation(format!(
                "step method {method} registered twice"
            )));
        }
        self.entries.insert(method, Arc::new(step));
        Ok(self)
    }

    pub fn build(self) -> StepRegistry {
        StepRegistry {
            entries: Arc::new(self.entries),
        }
    }
}

/// Immutable after build; shared across workers without locking.
#[derive(Clone)]
pub struct StepRegistry {
    entries: Arc<HashMap<String, StepFn>>,
}

impl StepRegistry {
    pub fn resolve(&self, method: &str) -> Option<StepFn> {
        self.entries.get(method).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_ctx: StepContext) -> StepFuture {
        Box::pin(async { Ok(()) })
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut builder = StepRegistryBuilder::new();
        builder.register("provider-createVPC", noop).unwrap();
        let err = builder.register("provider-createVPC", noop).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn resolve_finds_registered_methods() {
        let mut builder = StepRegistryBuilder::new();
        builder.register("provider-createVPC", noop).unwrap();
        builder.register("provider-createNodes", noop).unwrap();
        let registry = builder.build();
        assert_eq!(registry.len(), 2);
        assert!(registry.resolve("provider-createVPC").is_some());
        assert!(registry.resolve("provider-missing").is_none());
    }
}
