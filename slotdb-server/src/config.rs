//! Node configuration file

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use slotdb_core::storage::{duration, StorageConfig};
use slotdb_core::types::{NodeId, ShardId};

/// Shards of a database hosted by this node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub num_shards: u32,
    /// Hosted shards, every shard when empty
    #[serde(default)]
    pub shards: Vec<ShardId>,
}

impl DatabaseConfig {
    pub fn hosted_shards(&self) -> Vec<ShardId> {
        if self.shards.is_empty() {
            (0..self.num_shards).collect()
        } else {
            self.shards.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub node_id: NodeId,
    #[serde(with = "duration")]
    pub flush_check_interval: Duration,
    #[serde(with = "duration")]
    pub memory_check_interval: Duration,
    #[serde(with = "duration")]
    pub expire_check_interval: Duration,
    #[serde(with = "duration")]
    pub status_interval: Duration,
    #[serde(flatten)]
    pub storage: StorageConfig,
    #[serde(rename = "database")]
    pub databases: Vec<DatabaseConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            flush_check_interval: Duration::from_secs(1),
            memory_check_interval: Duration::from_secs(1),
            expire_check_interval: Duration::from_secs(60),
            status_interval: Duration::from_secs(60),
            storage: StorageConfig::default(),
            databases: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Parse and validate a TOML document
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut config: ServerConfig = toml::from_str(text).context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("load config {}", path.display()))
    }

    pub fn validate(&mut self) -> anyhow::Result<()> {
        self.storage.validate()?;
        let defaults = ServerConfig::default();
        for (value, default) in [
            (&mut self.flush_check_interval, defaults.flush_check_interval),
            (&mut self.memory_check_interval, defaults.memory_check_interval),
            (&mut self.expire_check_interval, defaults.expire_check_interval),
            (&mut self.status_interval, defaults.status_interval),
        ] {
            if value.is_zero() {
                *value = default;
            }
        }
        for db in &self.databases {
            anyhow::ensure!(db.num_shards > 0, "database {} has no shards", db.name);
            if let Some(shard) = db.shards.iter().find(|s| **s >= db.num_shards) {
                anyhow::bail!("database {} has no shard {shard}", db.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.node_id, 1);
        assert_eq!(config.storage.wal.data_size_limit, 512);
        assert!(config.databases.is_empty());
    }

    #[test]
    fn test_load_config_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
node_id = 3
flush_check_interval = "500ms"

[tsdb]
dir = "/tmp/slotdb/data"
mutable_memdb_ttl = "10m"
max_memdb_number = 0

[wal]
data_size_limit = 4096

[write]
batch_timeout = 1

[logging]
json = true

[[database]]
name = "metrics"
num_shards = 4
shards = [1, 3]
"#
        )
        .unwrap();
        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.node_id, 3);
        assert_eq!(config.flush_check_interval, Duration::from_millis(500));
        assert_eq!(config.storage.tsdb.mutable_memdb_ttl, Duration::from_secs(600));
        assert_eq!(config.storage.tsdb.max_memdb_number, 5);
        assert_eq!(config.storage.wal.data_size_limit, 1024);
        assert_eq!(config.storage.write.batch_timeout, Duration::from_secs(1));
        assert!(config.storage.logging.json);
        assert_eq!(config.databases[0].hosted_shards(), vec![1, 3]);
    }

    #[test]
    fn test_reject_unknown_shard() {
        let err = ServerConfig::parse(
            r#"
[[database]]
name = "metrics"
num_shards = 2
shards = [2]
"#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("no shard 2"));
    }
}
