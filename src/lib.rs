//! Clusterline: task orchestration for cluster lifecycle operations.
//!
//! A task is a persisted, multi-step workflow (create a cluster, add
//! nodes, scale a node group). The lifecycle service validates and
//! persists tasks, the dispatcher turns them into ordered invocation
//! chains on a broker, and a worker pool executes the chains against a
//! registry of step executables. Failed tasks are resumed by explicit
//! Retry or Skip actions, never automatically.

pub mod audit;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod entity;
pub mod error;
pub mod in_memory;
pub mod lifecycle;
pub mod reconciler;
pub mod registry;
pub mod steps;
pub mod store;
pub mod task;
pub mod worker;

pub use broker::{Broker, Chain, ChainOutcome, MemoryBroker, StepInvocation};
pub use config::Config;
pub use dispatcher::{Dispatch, DispatcherConfig, TaskDispatcher};
pub use error::{EngineError, StoreError};
pub use in_memory::MemoryStore;
pub use lifecycle::TaskLifecycle;
pub use reconciler::StatusReconciler;
pub use registry::{StepContext, StepFn, StepFuture, StepRegistry, StepRegistryBuilder};
pub use store::{ListOptions, PostgresBroker, PostgresStore, TaskFilter, TaskStore};
pub use task::{
    task_types, NewTask, Step, StepStatus, Task, TaskOrigin, TaskPatch, TaskStatus, TaskStepLog,
};
pub use worker::{WorkerPool, WorkerPoolConfig};
