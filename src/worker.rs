//! Worker pool: claims chains from the broker and executes them.
//!
//! Invocations run strictly in chain order. Steps already SUCCESS or SKIP
//! are passed over, which makes redispatching a full chain after Retry
//! idempotent. The first failure or timeout halts the chain and writes the
//! task's terminal status; full completion writes SUCCESS.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Chain, ChainOutcome};
use crate::error::StoreError;
use crate::registry::{StepContext, StepRegistry};
use crate::store::{mutate_task, TaskStore};
use crate::task::{StepStatus, TaskStatus, TaskStepLog};

/// Step param key overriding the pool-wide step timeout, in seconds.
const STEP_TIMEOUT_PARAM: &str = "timeoutSeconds";

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    /// Broker poll interval when the queue is empty.
    pub poll_interval: Duration,
    pub default_step_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            poll_interval: Duration::from_millis(500),
            default_step_timeout: Duration::from_secs(3600),
        }
    }
}

pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(
        config: WorkerPoolConfig,
        broker: Arc<dyn Broker>,
        store: Arc<dyn TaskStore>,
        registry: StepRegistry,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = (0..config.workers.max(1))
            .map(|worker_id| {
                let worker = Worker {
                    worker_id,
                    broker: Arc::clone(&broker),
                    store: Arc::clone(&store),
                    registry: registry.clone(),
                    default_step_timeout: config.default_step_timeout,
                };
                let poll_interval = config.poll_interval;
                let mut shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    info!(worker_id, "worker started");
                    loop {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                        match worker.broker.dequeue().await {
                            Ok(Some(chain)) => worker.run_chain(chain).await,
                            Ok(None) => {
                                tokio::select! {
                                    _ = tokio::time::sleep(poll_interval) => {}
                                    _ = shutdown_rx.changed() => {}
                                }
                            }
                            Err(err) => {
                                warn!(worker_id, error = %err, "dequeue failed");
                                tokio::time::sleep(poll_interval).await;
                            }
                        }
                    }
                    info!(worker_id, "worker stopped");
                })
            })
            .collect();
        Self {
            shutdown_tx,
            handles,
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

struct Worker {
    worker_id: usize,
    broker: Arc<dyn Broker>,
    store: Arc<dyn TaskStore>,
    registry: StepRegistry,
    default_step_timeout: Duration,
}

enum StepResult {
    Succeeded,
    Failed(String),
    TimedOut(Duration),
}

impl Worker {
    async fn run_chain(&self, chain: Chain) {
        let chain_id = chain.id;
        let task_id = chain.task_id.clone();
        debug!(worker_id = self.worker_id, %chain_id, %task_id, "chain claimed");

        let outcome = match self.execute(&chain).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(%task_id, %chain_id, error = %err, "chain aborted on store error");
                ChainOutcome::Failed
            }
        };
        if let Err(err) = self.broker.complete(chain_id, outcome).await {
            warn!(%task_id, %chain_id, error = %err, "failed to report chain outcome");
        }
    }

    async fn execute(&self, chain: &Chain) -> Result<ChainOutcome, StoreError> {
        let task_id = &chain.task_id;
        let started = Utc::now();

        for invocation in &chain.invocations {
            let step_name = &invocation.step_name;
            let task = self.store.get_task(task_id).await?;
            let step = match task.steps.get(step_name) {
                Some(step) => step.clone(),
                None => {
                    self.finish_task(
                        task_id,
                        TaskStatus::Failure,
                        format!("step {step_name} missing from task"),
                        started,
                    )
                    .await?;
                    return Ok(ChainOutcome::Failed);
                }
            };

            // Already done in a previous dispatch of this task.
            if step.status.is_complete() {
                debug!(%task_id, step_name, status = %step.status, "step already complete");
                continue;
            }

            let step_fn = match self.registry.resolve(&step.method) {
                Some(step_fn) => step_fn,
                None => {
                    let msg = format!("no executable registered for method {}", step.method);
                    self.append_log(TaskStepLog::error(task_id, step_name, &msg)).await;
                    self.mark_step(task_id, step_name, StepStatus::Failure, &msg).await?;
                    self.finish_task(task_id, TaskStatus::Failure, msg, started).await?;
                    return Ok(ChainOutcome::Failed);
                }
            };

            self.begin_step(task_id, step_name).await?;
            self.append_log(TaskStepLog::info(task_id, step_name, "step started"))
                .await;

            let timeout = step
                .params
                .get(STEP_TIMEOUT_PARAM)
                .and_then(|raw| raw.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(self.default_step_timeout);
            let ctx = StepContext {
                task_id: task_id.clone(),
                step_name: step_name.clone(),
                store: Arc::clone(&self.store),
            };
            let result = match tokio::time::timeout(timeout, step_fn(ctx)).await {
                Ok(Ok(())) => StepResult::Succeeded,
                Ok(Err(err)) => StepResult::Failed(err.to_string()),
                Err(_) => StepResult::TimedOut(timeout),
            };

            match result {
                StepResult::Succeeded => {
                    self.mark_step(task_id, step_name, StepStatus::Success, "").await?;
                    self.append_log(TaskStepLog::info(task_id, step_name, "step succeeded"))
                        .await;
                    metrics::counter!("clusterline_steps_succeeded").increment(1);
                }
                StepResult::Failed(msg) => {
                    self.append_log(TaskStepLog::error(task_id, step_name, &msg)).await;
                    self.mark_step(task_id, step_name, StepStatus::Failure, &msg).await?;
                    self.finish_task(task_id, TaskStatus::Failure, msg, started).await?;
                    metrics::counter!("clusterline_steps_failed").increment(1);
                    return Ok(ChainOutcome::Failed);
                }
                StepResult::TimedOut(timeout) => {
                    let msg = format!("step timed out after {}s", timeout.as_secs());
                    self.append_log(TaskStepLog::error(task_id, step_name, &msg)).await;
                    self.mark_step(task_id, step_name, StepStatus::Timeout, &msg).await?;
                    self.finish_task(task_id, TaskStatus::Timeout, msg, started).await?;
                    metrics::counter!("clusterline_steps_timed_out").increment(1);
                    return Ok(ChainOutcome::Failed);
                }
            }
        }

        self.finish_task(task_id, TaskStatus::Success, String::new(), started)
            .await?;
        Ok(ChainOutcome::Succeeded)
    }

    async fn begin_step(&self, task_id: &str, step_name: &str) -> Result<(), StoreError> {
        let step_name = step_name.to_string();
        mutate_task(self.store.as_ref(), task_id, move |task| {
            task.current_step = Some(step_name.clone());
            if let Some(step) = task.steps.get_mut(&step_name) {
                step.status = StepStatus::Running;
                step.start = Some(Utc::now());
                step.end = None;
                step.message.clear();
            }
        })
        .await?;
        Ok(())
    }

    async fn mark_step(
        &self,
        task_id: &str,
        step_name: &str,
        status: StepStatus,
        message: &str,
    ) -> Result<(), StoreError> {
        let step_name = step_name.to_string();
        let message = message.to_string();
        mutate_task(self.store.as_ref(), task_id, move |task| {
            if let Some(step) = task.steps.get_mut(&step_name) {
                step.status = status;
                step.message = message.clone();
                step.end = Some(Utc::now());
            }
        })
        .await?;
        Ok(())
    }

    async fn finish_task(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: String,
        started: chrono::DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let end = Utc::now();
        let execution_time_ms = (end - started).num_milliseconds();
        mutate_task(self.store.as_ref(), task_id, move |task| {
            task.status = status;
            task.message = message.clone();
            task.end = Some(end);
            task.execution_time_ms = execution_time_ms;
        })
        .await?;
        info!(%task_id, status = %status, "task finished");
        Ok(())
    }

    async fn append_log(&self, log: TaskStepLog) {
        // Log persistence is best-effort; a lost line never fails a step.
        if let Err(err) = self.store.append_step_log(&log).await {
            warn!(task_id = %log.task_id, error = %err, "failed to append step log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::in_memory::MemoryStore;
    use crate::registry::{StepFuture, StepRegistryBuilder};
    use crate::task::{NewTask, Step, Task};

    fn quick_pool_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: 1,
            poll_interval: Duration::from_millis(5),
            default_step_timeout: Duration::from_secs(5),
        }
    }

    fn ok_step(_ctx: StepContext) -> StepFuture {
        Box::pin(async { Ok(()) })
    }

    fn failing_step(_ctx: StepContext) -> StepFuture {
        Box::pin(async { anyhow::bail!("provider quota exceeded") })
    }

    fn slow_step(_ctx: StepContext) -> StepFuture {
        Box::pin(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        })
    }

    async fn run_one_chain(
        task: &Task,
        registry: StepRegistry,
        store: Arc<MemoryStore>,
    ) -> ChainOutcome {
        store.create_task(task).await.unwrap();
        let broker = Arc::new(MemoryBroker::new());
        let chain = crate::broker::Chain::for_task(task, None).unwrap();
        let chain_id = chain.id;
        broker.submit(chain).await.unwrap();

        let pool = WorkerPool::start(
            quick_pool_config(),
            Arc::clone(&broker) as Arc<dyn Broker>,
            store as Arc<dyn TaskStore>,
            registry,
        );
        let outcome = loop {
            if let Some(outcome) = broker.result(chain_id).await.unwrap() {
                break outcome;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        pool.shutdown().await;
        outcome
    }

    #[tokio::test]
    async fn successful_chain_completes_task() {
        let mut builder = StepRegistryBuilder::new();
        builder.register("m-a", ok_step).unwrap();
        builder.register("m-b", ok_step).unwrap();
        let task = NewTask::new(
            "Cluster-CreateCluster",
            vec![Step::new("a", "m-a"), Step::new("b", "m-b")],
        )
        .build();
        let store = Arc::new(MemoryStore::new());

        let outcome = run_one_chain(&task, builder.build(), Arc::clone(&store)).await;
        assert_eq!(outcome, ChainOutcome::Succeeded);

        let stored = store.get_task(&task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Success);
        assert!(stored.end.is_some());
        assert_eq!(stored.steps["a"].status, StepStatus::Success);
        assert_eq!(stored.steps["b"].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn failure_halts_chain_and_marks_task() {
        let mut builder = StepRegistryBuilder::new();
        builder.register("m-a", ok_step).unwrap();
        builder.register("m-b", failing_step).unwrap();
        builder.register("m-c", ok_step).unwrap();
        let task = NewTask::new(
            "Cluster-AddNodes",
            vec![
                Step::new("a", "m-a"),
                Step::new("b", "m-b"),
                Step::new("c", "m-c"),
            ],
        )
        .build();
        let store = Arc::new(MemoryStore::new());

        let outcome = run_one_chain(&task, builder.build(), Arc::clone(&store)).await;
        assert_eq!(outcome, ChainOutcome::Failed);

        let stored = store.get_task(&task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failure);
        assert_eq!(stored.current_step.as_deref(), Some("b"));
        assert_eq!(stored.steps["b"].status, StepStatus::Failure);
        // halted before c
        assert_eq!(stored.steps["c"].status, StepStatus::NotStarted);
        assert!(stored.message.contains("quota"));
    }

    #[tokio::test]
    async fn per_step_timeout_override_marks_timeout() {
        let mut builder = StepRegistryBuilder::new();
        builder.register("m-slow", slow_step).unwrap();
        let task = NewTask::new(
            "Cluster-CreateCluster",
            vec![Step::new("slow", "m-slow").with_param(STEP_TIMEOUT_PARAM, "1")],
        )
        .build();
        let store = Arc::new(MemoryStore::new());

        let outcome = run_one_chain(&task, builder.build(), Arc::clone(&store)).await;
        assert_eq!(outcome, ChainOutcome::Failed);

        let stored = store.get_task(&task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Timeout);
        assert_eq!(stored.steps["slow"].status, StepStatus::Timeout);
    }

    #[tokio::test]
    async fn completed_steps_are_not_reexecuted() {
        use std::sync::atomic::{AtomicU32, Ordering};

        static CALLS: AtomicU32 = AtomicU32::new(0);
        fn counting_step(_ctx: StepContext) -> StepFuture {
            CALLS.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        let mut builder = StepRegistryBuilder::new();
        builder.register("m-counted", counting_step).unwrap();
        builder.register("m-b", ok_step).unwrap();
        let mut task = NewTask::new(
            "Cluster-CreateCluster",
            vec![Step::new("a", "m-counted"), Step::new("b", "m-b")],
        )
        .build();
        task.steps.get_mut("a").unwrap().status = StepStatus::Success;
        let store = Arc::new(MemoryStore::new());

        let outcome = run_one_chain(&task, builder.build(), Arc::clone(&store)).await;
        assert_eq!(outcome, ChainOutcome::Succeeded);
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unregistered_method_fails_task() {
        let builder = StepRegistryBuilder::new();
        let task = NewTask::new(
            "Cluster-CreateCluster",
            vec![Step::new("a", "m-missing")],
        )
        .build();
        let store = Arc::new(MemoryStore::new());

        let outcome = run_one_chain(&task, builder.build(), Arc::clone(&store)).await;
        assert_eq!(outcome, ChainOutcome::Failed);

        let stored = store.get_task(&task.task_id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failure);
        assert!(stored.message.contains("m-missing"));
    }
}
