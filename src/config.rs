//! Environment-driven configuration.
//!
//! Every knob reads a `CLUSTERLINE_*` variable with a sensible default;
//! only the database URL is required. A `.env` file is honored in
//! development via dotenvy.

use std::env;
use std::time::Duration;

use anyhow::Context;

use crate::dispatcher::DispatcherConfig;
use crate::worker::WorkerPoolConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub worker_count: usize,
    pub poll_interval: Duration,
    pub default_step_timeout: Duration,
    pub result_poll_interval: Duration,
    pub result_poll_attempts: u32,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("CLUSTERLINE_DATABASE_URL")
            .context("CLUSTERLINE_DATABASE_URL must be set")?;
        Ok(Self {
            database_url,
            db_max_connections: parse_env("CLUSTERLINE_DB_MAX_CONNECTIONS", 10)?,
            worker_count: parse_env("CLUSTERLINE_WORKER_COUNT", num_cpus::get())?,
            poll_interval: Duration::from_millis(parse_env(
                "CLUSTERLINE_POLL_INTERVAL_MS",
                500,
            )?),
            default_step_timeout: Duration::from_secs(parse_env(
                "CLUSTERLINE_STEP_TIMEOUT_SECS",
                3600,
            )?),
            result_poll_interval: Duration::from_secs(parse_env(
                "CLUSTERLINE_RESULT_POLL_INTERVAL_SECS",
                5,
            )?),
            result_poll_attempts: parse_env("CLUSTERLINE_RESULT_POLL_ATTEMPTS", 720)?,
        })
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: self.worker_count,
            poll_interval: self.poll_interval,
            default_step_timeout: self.default_step_timeout,
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            result_poll_interval: self.result_poll_interval,
            result_poll_attempts: self.result_poll_attempts,
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("invalid {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        database_url: String::new(),
        db_max_connections: 2,
        worker_count: 1,
        poll_interval: Duration::from_millis(10),
        default_step_timeout: Duration::from_secs(5),
        result_poll_interval: Duration::from_millis(10),
        result_poll_attempts: 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_feed_component_configs() {
        let config = test_config();
        let pool = config.worker_pool_config();
        assert_eq!(pool.workers, 1);
        assert_eq!(pool.poll_interval, Duration::from_millis(10));
        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.result_poll_attempts, 10);
    }

    #[test]
    fn parse_env_falls_back_to_default() {
        let value: u32 = parse_env("CLUSTERLINE_DOES_NOT_EXIST", 42).unwrap();
        assert_eq!(value, 42);
    }
}
