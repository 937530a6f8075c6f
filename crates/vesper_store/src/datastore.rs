use std::path::{Path, PathBuf};
use std::sync::Arc;

use vesper_core::{Schema, VesperResult};

use crate::{DEFAULT_DB_NAME, SqlBroker, VesperConfig};

pub fn load_or_init_config(base: &Path) -> VesperResult<VesperConfig> {
    let default_sqlite = base.join(DEFAULT_DB_NAME);
    VesperConfig::load_or_init(base, &default_sqlite)
}

/// Loads (or writes) `vesper.json` under `base` and connects the broker it names.
pub async fn open_broker(base: &Path, schema: Arc<Schema>) -> VesperResult<SqlBroker> {
    let config = load_or_init_config(base)?;
    SqlBroker::connect(&config, base, schema).await
}

pub fn default_sqlite_path(base: &Path) -> PathBuf {
    base.join(DEFAULT_DB_NAME)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{default_sqlite_path, load_or_init_config, open_broker};
    use tempfile::tempdir;
    use vesper_core::{LeafKind, NodeDef, Schema};

    #[tokio::test]
    async fn opens_broker_with_default_config() {
        let dir = tempdir().expect("tempdir");
        let base = dir.path();
        let config = load_or_init_config(base).expect("config");
        assert_eq!(config.backend_name(), "sqlite");
        assert!(base.join("vesper.json").exists());
        let schema = Schema::builder()
            .node(NodeDef::new("Article").leaf("id", LeafKind::Int).unique(["id"]))
            .build()
            .expect("schema");
        let broker = open_broker(base, Arc::new(schema)).await.expect("open broker");
        assert!(default_sqlite_path(base).exists());
        assert_eq!(broker.last_mutation_id().await.expect("head").as_i64(), 0);
        broker.close().await.expect("close");
    }
}
