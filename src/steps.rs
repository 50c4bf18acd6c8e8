//! Provider-agnostic step executables.
//!
//! Cloud-provider modules register their own methods at startup; these are
//! the shared ones every deployment gets.

use anyhow::Context;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::entity::NodeStatus;
use crate::error::EngineError;
use crate::registry::{StepContext, StepFuture, StepRegistryBuilder};

pub const SLEEP_METHOD: &str = "common-sleep";
pub const SET_NODE_STATUS_METHOD: &str = "common-setNodeStatus";

pub fn register_common(builder: &mut StepRegistryBuilder) -> Result<(), EngineError> {
    builder.register(SLEEP_METHOD, sleep_step)?;
    builder.register(SET_NODE_STATUS_METHOD, set_node_status_step)?;
    Ok(())
}

/// Pauses the chain; used between provider calls that need settle time.
/// Param: `seconds`.
fn sleep_step(ctx: StepContext) -> StepFuture {
    Box::pin(async move {
        let step = ctx.load_step().await?;
        let seconds: u64 = step
            .params
            .get("seconds")
            .context("sleep step requires a 'seconds' param")?
            .parse()
            .context("'seconds' param is not a number")?;
        info!(task_id = %ctx.task_id, step = %ctx.step_name, seconds, "sleeping");
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        Ok(())
    })
}

/// Writes the target status onto every node in the task's IP list.
/// Param: `status` (a node status string).
fn set_node_status_step(ctx: StepContext) -> StepFuture {
    Box::pin(async move {
        let task = ctx.load_task().await?;
        let step = task
            .steps
            .get(&ctx.step_name)
            .context("step missing from task")?;
        let raw = step
            .params
            .get("status")
            .context("setNodeStatus step requires a 'status' param")?;
        let status = parse_node_status(raw)?;
        if task.node_ip_list.is_empty() {
            anyhow::bail!("task has no node IPs to update");
        }
        let updated = ctx
            .store
            .update_node_status(&task.node_ip_list, status)
            .await?;
        info!(
            task_id = %ctx.task_id,
            status = status.as_str(),
            updated,
            "node statuses written"
        );
        Ok(())
    })
}

fn parse_node_status(raw: &str) -> anyhow::Result<NodeStatus> {
    NodeStatus::from_str(raw).map_err(|err| anyhow::anyhow!(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::MemoryStore;
    use crate::store::TaskStore;
    use crate::task::{NewTask, Step};
    use chrono::Utc;
    use std::sync::Arc;

    #[tokio::test]
    async fn set_node_status_updates_listed_nodes() {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_node(&crate::entity::Node {
                inner_ip: "10.0.0.1".into(),
                cluster_id: "cls".into(),
                node_group_id: "ng".into(),
                status: NodeStatus::Initializing,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        let task = NewTask::new(
            "Cluster-AddNodes",
            vec![Step::new("mark", SET_NODE_STATUS_METHOD).with_param("status", "RUNNING")],
        )
        .node_ips(vec!["10.0.0.1".into()])
        .build();
        store.create_task(&task).await.unwrap();

        let ctx = StepContext {
            task_id: task.task_id.clone(),
            step_name: "mark".into(),
            store: Arc::clone(&store) as Arc<dyn TaskStore>,
        };
        set_node_status_step(ctx).await.unwrap();

        let node = store.get_node("10.0.0.1").await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Running);
    }

    #[tokio::test]
    async fn sleep_step_rejects_missing_param() {
        let store = Arc::new(MemoryStore::new());
        let task = NewTask::new("Cluster-CreateCluster", vec![Step::new("wait", SLEEP_METHOD)])
            .build();
        store.create_task(&task).await.unwrap();

        let ctx = StepContext {
            task_id: task.task_id.clone(),
            step_name: "wait".into(),
            store: store as Arc<dyn TaskStore>,
        };
        let err = sleep_step(ctx).await.unwrap_err();
        assert!(err.to_string().contains("seconds"));
    }

    #[test]
    fn common_methods_register_cleanly() {
        let mut builder = crate::registry::StepRegistryBuilder::new();
        register_common(&mut builder).unwrap();
        let registry = builder.build();
        assert!(registry.resolve(SLEEP_METHOD).is_some());
        assert!(registry.resolve(SET_NODE_STATUS_METHOD).is_some());
    }
}
