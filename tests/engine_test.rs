//! End-to-end engine tests over the in-memory store and broker: a real
//! dispatcher, a real worker pool, and the full lifecycle surface.

use std::sync::Arc;
use std::time::Duration;

use clusterline::{
    task_types, Broker, Dispatch, DispatcherConfig, ListOptions, MemoryBroker, MemoryStore,
    NewTask, Step, StepContext, StepFuture, StepRegistryBuilder, StepStatus, TaskDispatcher,
    TaskFilter, TaskLifecycle, TaskStatus, TaskStore, WorkerPool, WorkerPoolConfig,
};

struct Engine {
    store: Arc<MemoryStore>,
    lifecycle: TaskLifecycle,
    pool: WorkerPool,
}

fn ok_step(_ctx: StepContext) -> StepFuture {
    Box::pin(async { Ok(()) })
}

fn failing_step(_ctx: StepContext) -> StepFuture {
    Box::pin(async { anyhow::bail!("provider rejected the request") })
}

fn start_engine(registry: StepRegistryBuilder) -> Engine {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new());
    let dispatcher = Arc::new(TaskDispatcher::new(
        Arc::clone(&broker) as Arc<dyn Broker>,
        DispatcherConfig {
            result_poll_interval: Duration::from_millis(10),
            result_poll_attempts: 100,
        },
    ));
    let pool = WorkerPool::start(
        WorkerPoolConfig {
            workers: 2,
            poll_interval: Duration::from_millis(5),
            default_step_timeout: Duration::from_secs(5),
        },
        broker as Arc<dyn Broker>,
        Arc::clone(&store) as Arc<dyn TaskStore>,
        registry.build(),
    );
    let lifecycle = TaskLifecycle::new(
        Arc::clone(&store) as Arc<dyn TaskStore>,
        dispatcher as Arc<dyn Dispatch>,
    );
    Engine {
        store,
        lifecycle,
        pool,
    }
}

async fn wait_for_status(store: &MemoryStore, task_id: &str, wanted: TaskStatus) -> bool {
    for _ in 0..400 {
        let task = store.get_task(task_id).await.unwrap();
        if task.status == wanted {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

fn create_cluster_task() -> NewTask {
    NewTask::new(
        task_types::CREATE_CLUSTER,
        vec![
            Step::new("createVPC", "aws-createVPC"),
            Step::new("createMaster", "aws-createMaster"),
            Step::new("installAddons", "common-installAddons"),
        ],
    )
    .cluster("BCS-K8S-0001", "proj-1")
    .creator("admin")
}

#[tokio::test]
async fn create_runs_chain_to_success() {
    let mut registry = StepRegistryBuilder::new();
    registry.register("aws-createVPC", ok_step).unwrap();
    registry.register("aws-createMaster", ok_step).unwrap();
    registry.register("common-installAddons", ok_step).unwrap();
    let engine = start_engine(registry);

    let created = engine.lifecycle.create(create_cluster_task()).await.unwrap();
    assert!(wait_for_status(&engine.store, &created.task_id, TaskStatus::Success).await);

    let fetched = engine.lifecycle.get(&created.task_id).await.unwrap();
    assert_eq!(fetched.status, TaskStatus::Success);
    assert!(fetched.end.is_some());
    assert!(fetched.execution_time_ms >= 0);
    for step in fetched.steps.values() {
        assert_eq!(step.status, StepStatus::Success);
    }

    engine.pool.shutdown().await;
}

#[tokio::test]
async fn failure_then_retry_resumes_without_redoing_work() {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    static VPC_CALLS: AtomicU32 = AtomicU32::new(0);
    static MASTER_SHOULD_FAIL: AtomicBool = AtomicBool::new(true);
    VPC_CALLS.store(0, Ordering::SeqCst);
    MASTER_SHOULD_FAIL.store(true, Ordering::SeqCst);

    fn vpc_step(_ctx: StepContext) -> StepFuture {
        VPC_CALLS.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    }
    fn flaky_master_step(_ctx: StepContext) -> StepFuture {
        Box::pin(async {
            if MASTER_SHOULD_FAIL.load(Ordering::SeqCst) {
                anyhow::bail!("control plane quota exceeded")
            }
            Ok(())
        })
    }

    let mut registry = StepRegistryBuilder::new();
    registry.register("aws-createVPC", vpc_step).unwrap();
    registry.register("aws-createMaster", flaky_master_step).unwrap();
    registry.register("common-installAddons", ok_step).unwrap();
    let engine = start_engine(registry);

    let created = engine.lifecycle.create(create_cluster_task()).await.unwrap();
    assert!(wait_for_status(&engine.store, &created.task_id, TaskStatus::Failure).await);

    let failed = engine.lifecycle.get(&created.task_id).await.unwrap();
    // one step done, one failed: surfaces as partial failure on read
    assert_eq!(failed.status, TaskStatus::PartialFailure);
    assert_eq!(failed.steps["createMaster"].status, StepStatus::Failure);

    MASTER_SHOULD_FAIL.store(false, Ordering::SeqCst);
    engine.lifecycle.retry(&created.task_id, "oncall").await.unwrap();
    assert!(wait_for_status(&engine.store, &created.task_id, TaskStatus::Success).await);

    // createVPC succeeded the first time and was not re-executed
    assert_eq!(VPC_CALLS.load(Ordering::SeqCst), 1);

    engine.pool.shutdown().await;
}

#[tokio::test]
async fn retry_while_running_is_rejected_and_task_untouched() {
    let mut registry = StepRegistryBuilder::new();
    fn stalling_step(_ctx: StepContext) -> StepFuture {
        Box::pin(async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(())
        })
    }
    registry.register("aws-createVPC", stalling_step).unwrap();
    registry.register("aws-createMaster", ok_step).unwrap();
    registry.register("common-installAddons", ok_step).unwrap();
    let engine = start_engine(registry);

    let created = engine.lifecycle.create(create_cluster_task()).await.unwrap();
    let before = engine.store.get_task(&created.task_id).await.unwrap();

    let err = engine.lifecycle.retry(&created.task_id, "admin").await.unwrap_err();
    assert!(matches!(
        err,
        clusterline::EngineError::StateConflict { action: "retry", .. }
    ));
    let after = engine.store.get_task(&created.task_id).await.unwrap();
    assert_eq!(after.status, before.status);
    assert_eq!(after.updater, before.updater);

    assert!(wait_for_status(&engine.store, &created.task_id, TaskStatus::Success).await);
    engine.pool.shutdown().await;
}

#[tokio::test]
async fn skip_of_failed_final_step_leaves_task_running() {
    let mut registry = StepRegistryBuilder::new();
    registry.register("aws-createVPC", ok_step).unwrap();
    registry.register("aws-createMaster", ok_step).unwrap();
    registry.register("common-installAddons", failing_step).unwrap();
    let engine = start_engine(registry);

    let created = engine.lifecycle.create(create_cluster_task()).await.unwrap();
    assert!(wait_for_status(&engine.store, &created.task_id, TaskStatus::Failure).await);

    let resumed = engine
        .lifecycle
        .skip_current_step(&created.task_id, "oncall")
        .await
        .unwrap();
    // nothing remains after the skipped step, so nothing was dispatched and
    // the stored status stays RUNNING
    assert_eq!(resumed.status, TaskStatus::Running);
    assert_eq!(resumed.steps["installAddons"].status, StepStatus::Skip);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored = engine.store.get_task(&created.task_id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Running);

    // but the derived status the API reports is SUCCESS
    let fetched = engine.lifecycle.get(&created.task_id).await.unwrap();
    assert_eq!(fetched.status, TaskStatus::Success);

    engine.pool.shutdown().await;
}

#[tokio::test]
async fn skip_of_middle_step_resumes_the_rest() {
    let mut registry = StepRegistryBuilder::new();
    registry.register("aws-createVPC", ok_step).unwrap();
    registry.register("aws-createMaster", failing_step).unwrap();
    registry.register("common-installAddons", ok_step).unwrap();
    let engine = start_engine(registry);

    let created = engine.lifecycle.create(create_cluster_task()).await.unwrap();
    assert!(wait_for_status(&engine.store, &created.task_id, TaskStatus::Failure).await);

    engine
        .lifecycle
        .skip_current_step(&created.task_id, "oncall")
        .await
        .unwrap();
    assert!(wait_for_status(&engine.store, &created.task_id, TaskStatus::Success).await);

    let fetched = engine.lifecycle.get(&created.task_id).await.unwrap();
    assert_eq!(fetched.steps["createMaster"].status, StepStatus::Skip);
    assert_eq!(fetched.steps["installAddons"].status, StepStatus::Success);
    assert_eq!(fetched.status, TaskStatus::Success);

    engine.pool.shutdown().await;
}

#[tokio::test]
async fn list_is_newest_first_and_scrubbed() {
    let mut registry = StepRegistryBuilder::new();
    registry.register("aws-createVPC", ok_step).unwrap();
    registry.register("aws-createMaster", ok_step).unwrap();
    registry.register("common-installAddons", ok_step).unwrap();
    let engine = start_engine(registry);

    let first = engine
        .lifecycle
        .create(create_cluster_task().common_param("sshPassword", "hunter2"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = engine.lifecycle.create(create_cluster_task()).await.unwrap();

    let (tasks, latest) = engine
        .lifecycle
        .list(
            &TaskFilter {
                cluster_id: Some("BCS-K8S-0001".to_string()),
                ..Default::default()
            },
            &ListOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].task_id, second.task_id);
    assert_eq!(tasks[1].task_id, first.task_id);
    assert_eq!(latest.unwrap().task_id, second.task_id);
    assert!(tasks
        .iter()
        .all(|t| !t.common_params.contains_key("sshPassword")));

    engine.pool.shutdown().await;
}

#[tokio::test]
async fn step_logs_record_start_and_outcome() {
    let mut registry = StepRegistryBuilder::new();
    registry.register("aws-createVPC", ok_step).unwrap();
    registry.register("aws-createMaster", failing_step).unwrap();
    registry.register("common-installAddons", ok_step).unwrap();
    let engine = start_engine(registry);

    let created = engine.lifecycle.create(create_cluster_task()).await.unwrap();
    assert!(wait_for_status(&engine.store, &created.task_id, TaskStatus::Failure).await);

    let logs = engine
        .lifecycle
        .step_logs(&created.task_id, Some("createMaster"), 1, 50)
        .await
        .unwrap();
    assert!(logs.iter().any(|l| l.level == "INFO"));
    assert!(logs
        .iter()
        .any(|l| l.level == "ERROR" && l.message.contains("rejected")));

    engine.pool.shutdown().await;
}
