//! Chain construction and submission.
//!
//! The dispatcher validates a task, builds the invocation chain from its
//! step sequence and hands it to the broker. Submission is synchronous; a
//! detached watcher then polls the broker for the chain's terminal outcome
//! and logs it. The watcher observes only: task state is written by the
//! worker executing the chain, never from here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, Chain, ChainOutcome};
use crate::error::EngineError;
use crate::task::Task;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Interval between completion-watcher polls.
    pub result_poll_interval: Duration,
    /// Polls before the watcher gives up on observing an outcome.
    pub result_poll_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            result_poll_interval: Duration::from_secs(5),
            result_poll_attempts: 720,
        }
    }
}

/// Dispatch seam injected into the lifecycle service; tests substitute a
/// recording implementation.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Submits the task's full chain. Returns the chain id.
    async fn dispatch(&self, task: &Task) -> Result<Uuid, EngineError>;

    /// Submits the chain suffix after `after_step`. Returns None when no
    /// steps remain, in which case nothing was submitted.
    async fn dispatch_from(
        &self,
        task: &Task,
        after_step: &str,
    ) -> Result<Option<Uuid>, EngineError>;
}

pub struct TaskDispatcher {
    broker: Arc<dyn Broker>,
    config: DispatcherConfig,
}

impl TaskDispatcher {
    pub fn new(broker: Arc<dyn Broker>, config: DispatcherConfig) -> Self {
        Self { broker, config }
    }

    async fn submit(&self, task: &Task, chain: Chain) -> Result<Uuid, EngineError> {
        let chain_id = chain.id;
        let invocations = chain.invocations.len();
        self.broker
            .submit(chain)
            .await
            .map_err(|err| EngineError::Dispatch(err.to_string()))?;
        metrics::counter!("clusterline_chains_submitted").increment(1);
        info!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            %chain_id,
            invocations,
            "chain submitted"
        );
        self.spawn_watcher(task.task_id.clone(), chain_id);
        Ok(chain_id)
    }

    fn spawn_watcher(&self, task_id: String, chain_id: Uuid) {
        let broker = Arc::clone(&self.broker);
        let interval = self.config.result_poll_interval;
        let attempts = self.config.result_poll_attempts;
        tokio::spawn(async move {
            for _ in 0..attempts {
                tokio::time::sleep(interval).await;
                match broker.result(chain_id).await {
                    Ok(Some(ChainOutcome::Succeeded)) => {
                        metrics::counter!("clusterline_chains_succeeded").increment(1);
                        info!(%task_id, %chain_id, "chain completed");
                        return;
                    }
                    Ok(Some(ChainOutcome::Failed)) => {
                        metrics::counter!("clusterline_chains_failed").increment(1);
                        info!(%task_id, %chain_id, "chain failed");
                        return;
                    }
                    Ok(None) => {
                        debug!(%task_id, %chain_id, "chain still running");
                    }
                    Err(err) => {
                        warn!(%task_id, %chain_id, error = %err, "result poll failed");
                    }
                }
            }
            warn!(%task_id, %chain_id, "gave up watching chain outcome");
        });
    }
}

#[async_trait]
impl Dispatch for TaskDispatcher {
    async fn dispatch(&self, task: &Task) -> Result<Uuid, EngineError> {
        task.validate()?;
        // validate() guarantees a non-empty sequence, so the full chain
        // always exists.
        let chain = Chain::for_task(task, None).ok_or_else(|| {
            EngineError::Validation(format!("task {} produced an empty chain", task.task_id))
        })?;
        self.submit(task, chain).await
    }

    async fn dispatch_from(
        &self,
        task: &Task,
        after_step: &str,
    ) -> Result<Option<Uuid>, EngineError> {
        task.validate()?;
        match Chain::for_task(task, Some(after_step)) {
            Some(chain) => Ok(Some(self.submit(task, chain).await?)),
            None => {
                info!(
                    task_id = %task.task_id,
                    after_step,
                    "no steps remain after skip point; nothing dispatched"
                );
                Ok(None)
            }
        }
    }
}
