//! Operator configuration

use anyhow::{bail, Context};
use kadroute_core::{generate_random_node_id, Node, NodeAddress, NodeId};
use kadroute_dht::DhtConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory path
    pub data_dir: String,

    /// Local node identity
    pub node: NodeConfig,

    /// DHT configuration
    #[serde(default)]
    pub dht: DhtConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Hex-encoded node identifier
    pub id: String,
    /// Address other nodes reach us at
    pub address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.kadroute".to_string(),
            node: NodeConfig {
                id: String::new(),
                address: "127.0.0.1:7400".to_string(),
            },
            dht: DhtConfig::default(),
        }
    }
}

impl Config {
    /// A default configuration with a fresh random identifier
    pub fn generate() -> anyhow::Result<Self> {
        let mut config = Self::default();
        config.node.id = generate_random_node_id(config.dht.id_length)?.to_hex();
        Ok(config)
    }

    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        config.dht.validate()?;
        Ok(config)
    }

    /// Write configuration to a file, creating its directory
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }

    /// The local node described by the `node` section
    pub fn local_node(&self) -> anyhow::Result<Node> {
        let id = NodeId::from_hex(&self.node.id)?;
        if id.len() != self.dht.id_length {
            bail!(
                "Node id has {} bytes but dht.id_length is {}",
                id.len(),
                self.dht.id_length
            );
        }
        let address: NodeAddress = self.node.address.parse()?;
        Ok(Node::new(id, Some(address)))
    }
}

pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generated_config_is_usable() {
        let config = Config::generate().unwrap();
        let node = config.local_node().unwrap();
        assert_eq!(node.id.len(), 20);
        assert_eq!(node.address.unwrap().address, "127.0.0.1:7400");
    }

    #[test]
    fn test_load_fills_dht_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/var/lib/kadroute"

[node]
id = "0a0b"
address = "10.1.1.1:9000"

[dht]
id_length = 2
bucket_size = 6
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.dht.bucket_size, 6);
        assert_eq!(config.dht.eviction_threshold, 3);
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/kadroute"));
        assert_eq!(config.local_node().unwrap().id.as_bytes(), &[0x0a, 0x0b]);
    }

    #[test]
    fn test_save_creates_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::generate().unwrap();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.node.id, config.node.id);
    }

    #[test]
    fn test_local_node_validation() {
        let mut config = Config::default();
        config.node.id = "0a0b".to_string();
        assert!(config.local_node().is_err());

        config.dht.id_length = 2;
        config.node.address = "no-port".to_string();
        assert!(config.local_node().is_err());

        config.node.address = "127.0.0.1:1".to_string();
        assert!(config.local_node().is_ok());
    }

    #[test]
    fn test_expand_path() {
        assert_eq!(expand_path("/tmp/x"), PathBuf::from("/tmp/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_path("~/.kadroute"), home.join(".kadroute"));
        }
    }
}
