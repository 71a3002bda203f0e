use std::{fs, path::Path};

use serde::Deserialize;

use crate::{BenchError, Result};

/// Default application namespace used for subjects, buckets and streams.
pub const DEFAULT_APP_NAME: &str = "fleetbench";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// prefix for every bucket, stream and subject this process touches
    pub app_name: String,
    /// identity of this process in the node directory
    pub node_id: String,
    /// number of async worker threads, range [1, 32768), defaults to 16
    pub async_worker_thread_number: u16,
    /// heartbeat config
    pub heartbeat: HeartbeatConfig,
    /// substrate config
    pub substrate: SubstrateConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// renewal period in milliseconds
    pub interval_ms: u64,
    /// presence expiry in milliseconds
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubstrateConfig {
    /// substrate type
    #[serde(default)]
    pub substrate_type: SubstrateType,
    /// postgres config
    pub postgres: Option<PostgresConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubstrateType {
    #[default]
    Mem,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresConfig {
    /// postgres database url
    pub database_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            node_id: String::new(),
            async_worker_thread_number: 16,
            heartbeat: HeartbeatConfig::default(),
            substrate: SubstrateConfig::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            ttl_ms: 5000,
        }
    }
}

impl Config {
    pub fn create<T: AsRef<Path>>(path: T) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref()).map_err(|e| BenchError::Config(format!("failed to load config file {:?}: {e}", path.as_ref())))?;

        Self::load_from_str(data.as_str())
    }

    pub fn load_from_str(toml_str: &str) -> Result<Self> {
        let config = toml::from_str::<Config>(toml_str)?;
        Ok(config)
    }

    /// Checks the fields the node cannot run without.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.is_empty() {
            return Err(BenchError::Validation("node id cannot be empty".into()));
        }
        if self.app_name.is_empty() {
            return Err(BenchError::Validation("app name cannot be empty".into()));
        }
        if self.heartbeat.interval_ms == 0 || self.heartbeat.ttl_ms <= self.heartbeat.interval_ms {
            return Err(BenchError::Validation(format!(
                "heartbeat ttl ({}ms) must be greater than its interval ({}ms)",
                self.heartbeat.ttl_ms, self.heartbeat.interval_ms
            )));
        }
        if self.substrate.substrate_type == SubstrateType::Postgres {
            match &self.substrate.postgres {
                Some(pg) if !pg.database_url.is_empty() => {}
                _ => return Err(BenchError::Validation("postgres database url cannot be empty".into())),
            }
        }
        Ok(())
    }
}
