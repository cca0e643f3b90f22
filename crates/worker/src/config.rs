//! Worker configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use common::PartitionKey;

use crate::{Result, WorkerError};

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `DATABASE_URL` — PostgreSQL connection string (required)
/// - `DATABASE_MAX_CONNECTIONS` — pool size (default: `5`)
/// - `PARTITION` — tenant partition to process (default: `"global"`)
/// - `PROCESSOR_ID` — checkpoint and lease name (default: `"client_shopping_summary"`)
/// - `LEASE_TIMEOUT_SECS` — seconds before a silent owner loses the lease (default: `300`)
/// - `POLL_INTERVAL_MS` — idle wait between polls (default: `500`)
/// - `BATCH_SIZE` — messages read per tick (default: `100`)
/// - `METRICS_PORT` — Prometheus scrape port (default: `9000`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub partition: PartitionKey,
    pub processor_id: String,
    pub lease_timeout: Duration,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub metrics_port: u16,
    pub log_level: String,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`; unset values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.is_empty())
            .ok_or(WorkerError::MissingSetting("DATABASE_URL"))?;

        Ok(Self {
            database_url,
            max_connections: parse(&lookup, "DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            partition: lookup("PARTITION")
                .map(PartitionKey::new)
                .unwrap_or(defaults.partition),
            processor_id: lookup("PROCESSOR_ID").unwrap_or(defaults.processor_id),
            lease_timeout: parse(&lookup, "LEASE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_timeout),
            poll_interval: parse(&lookup, "POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            batch_size: parse(&lookup, "BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            metrics_port: parse(&lookup, "METRICS_PORT")?.unwrap_or(defaults.metrics_port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
        })
    }
}

fn parse<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| WorkerError::InvalidSetting { name, value })
        })
        .transpose()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            max_connections: 5,
            partition: PartitionKey::default(),
            processor_id: "client_shopping_summary".to_string(),
            lease_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),
            batch_size: 100,
            metrics_port: 9000,
            log_level: "info".to_string(),
        }
    }
}
