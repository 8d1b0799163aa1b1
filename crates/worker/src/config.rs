// Worker process configuration
// Decision: Everything comes from environment variables (optionally loaded from .env)

use std::time::Duration;

use anyhow::{Context, Result};
use sagaflow_durable::{OrchestratorConfig, PostgresStorageConfig};

/// Configuration for the saga worker process
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL connection string
    pub database_url: String,
    /// Connection pool size
    pub max_connections: u32,
    /// How often expired checkpoints and execution records are purged
    pub reaper_interval: Duration,
    /// Engine settings
    pub orchestrator: OrchestratorConfig,
    /// Storage and scheduler settings
    pub storage: PostgresStorageConfig,
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// - `DATABASE_URL`: required
    /// - `SAGA_DB_MAX_CONNECTIONS`: pool size (default: 10)
    /// - `SAGA_REAPER_INTERVAL_SECS`: purge interval (default: 60)
    /// - plus the variables read by `OrchestratorConfig::from_env` and
    ///   `PostgresStorageConfig::from_env`
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let max_connections = parse_env("SAGA_DB_MAX_CONNECTIONS")?.unwrap_or(10);
        let reaper_secs = parse_env("SAGA_REAPER_INTERVAL_SECS")?.unwrap_or(60);

        Ok(Self {
            database_url,
            max_connections,
            reaper_interval: Duration::from_secs(reaper_secs),
            orchestrator: OrchestratorConfig::from_env(),
            storage: PostgresStorageConfig::from_env(),
        })
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("{name} has an invalid value: {raw}")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_missing_and_invalid() {
        assert_eq!(
            parse_env::<u32>("SAGAFLOW_TEST_SURELY_UNSET").unwrap(),
            None
        );

        std::env::set_var("SAGAFLOW_TEST_BAD_NUMBER", "ten");
        let err = parse_env::<u32>("SAGAFLOW_TEST_BAD_NUMBER").unwrap_err();
        assert!(err.to_string().contains("SAGAFLOW_TEST_BAD_NUMBER"));
        std::env::remove_var("SAGAFLOW_TEST_BAD_NUMBER");
    }
}
