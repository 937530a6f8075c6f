pub mod broker;
pub mod config;
pub mod datastore;
mod db;
pub mod migration;

pub use broker::{PurgeReport, SqlBroker};
pub use config::{
    BrokerConfig, BrokerSettings, DEFAULT_DB_NAME, DatabaseConfig, PoolConfig, VesperConfig,
};
pub use datastore::{default_sqlite_path, load_or_init_config, open_broker};
pub use vesper_core::*;
