//! Broker contract and the in-memory implementation.
//!
//! A chain is an ordered, dependency-linked set of step invocations
//! submitted together; the worker executing it halts on the first failure,
//! which is the only step-to-step synchronization point the engine relies
//! on. Each invocation carries exactly `(task_id, step_name)`; executables
//! load their own params from the store.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::Task;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInvocation {
    pub task_id: String,
    pub step_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub id: Uuid,
    pub task_id: String,
    pub invocations: Vec<StepInvocation>,
}

impl Chain {
    /// Builds the chain for a task's full step sequence, or for the suffix
    /// after `after_step`. Returns None when nothing remains to run.
    pub fn for_task(task: &Task, after_step: Option<&str>) -> Option<Chain> {
        let skip_until = after_step
            .and_then(|name| task.step_sequence.iter().position(|s| s == name))
            .map(|idx| idx + 1)
            .unwrap_or(0);
        let invocations: Vec<StepInvocation> = task.step_sequence[skip_until..]
            .iter()
            .map(|name| StepInvocation {
                task_id: task.task_id.clone(),
                step_name: name.clone(),
            })
            .collect();
        if invocations.is_empty() {
            return None;
        }
        Some(Chain {
            id: Uuid::new_v4(),
            task_id: task.task_id.clone(),
            invocations,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainOutcome {
    Succeeded,
    Failed,
}

/// Narrow message-broker contract the engine consumes.
///
/// Submission acks synchronously; results are observed asynchronously by the
/// dispatcher's completion watcher and are reported by whichever worker
/// executed the chain.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn submit(&self, chain: Chain) -> anyhow::Result<()>;

    async fn dequeue(&self) -> anyhow::Result<Option<Chain>>;

    async fn complete(&self, chain_id: Uuid, outcome: ChainOutcome) -> anyhow::Result<()>;

    async fn result(&self, chain_id: Uuid) -> anyhow::Result<Option<ChainOutcome>>;
}

/// Single-process broker backed by a queue and a results map. Used by tests
/// and local runs; the production deployment uses the Postgres-backed queue.
#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<MemoryBrokerInner>,
}

#[derive(Default)]
struct MemoryBrokerInner {
    queue: VecDeque<Chain>,
    results: HashMap<Uuid, ChainOutcome>,
    submitted: u64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submitted_count(&self) -> u64 {
        self.inner.lock().expect("broker lock poisoned").submitted
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn submit(&self, chain: Chain) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        inner.submitted += 1;
        inner.queue.push_back(chain);
        Ok(())
    }

    async fn dequeue(&self) -> anyhow::Result<Option<Chain>> {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        Ok(inner.queue.pop_front())
    }

    async fn complete(&self, chain_id: Uuid, outcome: ChainOutcome) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("broker lock poisoned");
        inner.results.insert(chain_id, outcome);
        Ok(())
    }

    async fn result(&self, chain_id: Uuid) -> anyhow::Result<Option<ChainOutcome>> {
        let inner = self.inner.lock().expect("broker lock poisoned");
        Ok(inner.results.get(&chain_id).copied())
    }
}
