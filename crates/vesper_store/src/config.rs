use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use vesper_core::{VesperError, VesperResult};

const DEFAULT_CONFIG_NAME: &str = "vesper.json";
pub const DEFAULT_DB_NAME: &str = "vesper.sqlite";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    Sqlite { path: Option<String> },
    Postgres { url: String },
    Mysql { url: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_connections: Option<u32>,
    pub min_connections: Option<u32>,
    pub connect_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
}

/// Broker timings. Every field is optional in the file; missing values fall
/// back to the defaults below.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub heartbeat_interval_secs: Option<u64>,
    pub stale_heartbeat_multiplier: Option<u32>,
    pub retention_secs: Option<u64>,
    pub janitor_interval_secs: Option<u64>,
    pub pull_interval_ms: Option<u64>,
    pub pull_batch_size: Option<u64>,
    pub channel_capacity: Option<usize>,
}

impl BrokerConfig {
    pub fn with_defaults() -> Self {
        Self {
            heartbeat_interval_secs: Some(5),
            stale_heartbeat_multiplier: Some(3),
            retention_secs: Some(86_400),
            janitor_interval_secs: Some(60),
            pull_interval_ms: Some(250),
            pull_batch_size: Some(100),
            channel_capacity: Some(64),
        }
    }
}

/// Resolved broker timings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BrokerSettings {
    pub heartbeat_interval: Duration,
    pub stale_heartbeat_multiplier: u32,
    pub retention: Duration,
    pub janitor_interval: Duration,
    pub pull_interval: Duration,
    pub pull_batch_size: u64,
    pub channel_capacity: usize,
}

impl BrokerSettings {
    pub fn from_config(config: Option<&BrokerConfig>) -> Self {
        let defaults = BrokerConfig::with_defaults();
        let config = config.unwrap_or(&defaults);
        let pick = |value: Option<u64>, fallback: Option<u64>| value.or(fallback).unwrap_or(1);
        Self {
            heartbeat_interval: Duration::from_secs(
                pick(config.heartbeat_interval_secs, defaults.heartbeat_interval_secs).max(1),
            ),
            stale_heartbeat_multiplier: config
                .stale_heartbeat_multiplier
                .or(defaults.stale_heartbeat_multiplier)
                .unwrap_or(3)
                .max(1),
            retention: Duration::from_secs(pick(config.retention_secs, defaults.retention_secs)),
            janitor_interval: Duration::from_secs(
                pick(config.janitor_interval_secs, defaults.janitor_interval_secs).max(1),
            ),
            pull_interval: Duration::from_millis(
                pick(config.pull_interval_ms, defaults.pull_interval_ms).max(1),
            ),
            pull_batch_size: pick(config.pull_batch_size, defaults.pull_batch_size).max(1),
            channel_capacity: config
                .channel_capacity
                .or(defaults.channel_capacity)
                .unwrap_or(64)
                .max(1),
        }
    }

    /// A lease not renewed within this window is considered stale.
    pub fn lease_duration(&self) -> Duration {
        self.heartbeat_interval * self.stale_heartbeat_multiplier
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self::from_config(None)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VesperConfig {
    pub database: DatabaseConfig,
    pub pool: Option<PoolConfig>,
    pub broker: Option<BrokerConfig>,
    pub failpoints: Option<Vec<String>>,
}

impl VesperConfig {
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self {
            database: DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
            pool: None,
            broker: Some(BrokerConfig::with_defaults()),
            failpoints: None,
        }
    }

    pub fn load_or_init(base_dir: &Path, default_sqlite_path: &Path) -> VesperResult<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| VesperError::storage(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            let raw = fs::read_to_string(&config_path)
                .map_err(|err| VesperError::storage(format!("read config: {err}")))?;
            let config: VesperConfig =
                serde_json::from_str(&raw).map_err(|err| VesperError::invalid(err.to_string()))?;
            return Ok(config);
        }
        let default = VesperConfig::default_sqlite(default_sqlite_path.to_string_lossy());
        let payload = serde_json::to_string_pretty(&default)
            .map_err(|err| VesperError::storage(format!("serialize config: {err}")))?;
        fs::write(&config_path, payload)
            .map_err(|err| VesperError::storage(format!("write config: {err}")))?;
        Ok(default)
    }

    pub fn sqlite_path(&self, base_dir: &Path) -> VesperResult<PathBuf> {
        match &self.database {
            DatabaseConfig::Sqlite { path } => {
                let path = path.clone().unwrap_or_else(|| DEFAULT_DB_NAME.to_string());
                let candidate = PathBuf::from(path);
                if candidate.is_absolute() {
                    Ok(candidate)
                } else {
                    Ok(base_dir.join(candidate))
                }
            }
            _ => Err(VesperError::invalid("config is not sqlite backend")),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self.database {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Postgres { .. } => "postgres",
            DatabaseConfig::Mysql { .. } => "mysql",
        }
    }

    pub fn connection_url(&self, base_dir: &Path) -> VesperResult<String> {
        match &self.database {
            DatabaseConfig::Sqlite { .. } => {
                let path = self.sqlite_path(base_dir)?;
                Ok(format!("sqlite://{}?mode=rwc", path.display()))
            }
            DatabaseConfig::Postgres { url } | DatabaseConfig::Mysql { url } => Ok(url.clone()),
        }
    }

    pub fn broker_settings(&self) -> BrokerSettings {
        BrokerSettings::from_config(self.broker.as_ref())
    }
}
