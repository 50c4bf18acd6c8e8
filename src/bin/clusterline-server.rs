use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use clusterline::{
    steps, Broker, Config, PostgresBroker, PostgresStore, StepRegistryBuilder, TaskStore,
    WorkerPool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(workers = config.worker_count, "starting clusterline server");

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    let store = Arc::new(PostgresStore::new(pool.clone()));
    store.init_schema().await.context("schema init failed")?;
    let broker = Arc::new(PostgresBroker::new(pool));

    let mut registry = StepRegistryBuilder::new();
    steps::register_common(&mut registry)?;
    let registry = registry.build();
    info!(steps = registry.len(), "step registry built");

    let workers = WorkerPool::start(
        config.worker_pool_config(),
        broker as Arc<dyn Broker>,
        store as Arc<dyn TaskStore>,
        registry,
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, draining workers");
    workers.shutdown().await;
    info!("clusterline server stopped");
    Ok(())
}
