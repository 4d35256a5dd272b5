use std::path::Path;

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};

use crate::{ReplicaId, Timestamp, READ_ONLY_REPLICA_ID};

fn default_max_clock_skew() -> Timestamp { 86_400 }

fn default_strict_compare() -> bool { true }

/// Settings of a single replica.
///
/// ```toml
/// replica_id = 1
/// replica_name = "dc=example,dc=com"
/// supplier_url = "ldap://a.example.com:389"
/// max_clock_skew = 3600
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub replica_id: ReplicaId,
    /// Name under which the RUV of this replica is stored.
    pub replica_name: String,
    #[serde(default)]
    pub supplier_url: String,
    /// How far ahead of the local clock (in seconds) a CSN received from a peer may be.
    #[serde(default = "default_max_clock_skew")]
    pub max_clock_skew: Timestamp,
    /// Whether a peer that has seen updates unknown locally is reported by RUV comparison.
    #[serde(default = "default_strict_compare")]
    pub strict_compare: bool,
}

impl ReplicaConfig {
    pub fn new(replica_id: ReplicaId, replica_name: &str, supplier_url: &str) -> Self {
        ReplicaConfig {
            replica_id,
            replica_name: replica_name.to_string(),
            supplier_url: supplier_url.to_string(),
            max_clock_skew: default_max_clock_skew(),
            strict_compare: default_strict_compare(),
        }
    }

    pub fn from_toml_str(s: &str) -> crate::Result<Self> {
        let config: ReplicaConfig = toml::from_str(s).context("failed to parse replica config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read replica config {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("invalid replica config {}", path.display()))
    }

    pub fn validate(&self) -> crate::Result<()> {
        ensure!(
            self.replica_id >= 1 && self.replica_id < READ_ONLY_REPLICA_ID,
            "replica id {} is out of range 1..={}",
            self.replica_id,
            READ_ONLY_REPLICA_ID - 1
        );
        ensure!(!self.replica_name.trim().is_empty(), "replica name can't be empty");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use crate::config::ReplicaConfig;

    #[test]
    fn config_defaults() {
        let config = ReplicaConfig::from_toml_str("replica_id = 3\nreplica_name = \"dc=example\"\n").unwrap();
        assert_eq!(config, ReplicaConfig::new(3, "dc=example", ""));
        assert_eq!(config.max_clock_skew, 86_400);
        assert!(config.strict_compare);
    }

    #[test]
    fn config_full() {
        let config = ReplicaConfig::from_toml_str(
            r#"
            replica_id = 7
            replica_name = "dc=example"
            supplier_url = "ldap://a:389"
            max_clock_skew = 60
            strict_compare = false
            "#,
        )
        .unwrap();
        assert_eq!(config.replica_id, 7);
        assert_eq!(config.supplier_url, "ldap://a:389");
        assert_eq!(config.max_clock_skew, 60);
        assert!(!config.strict_compare);
    }

    #[test]
    fn config_rejects_invalid() {
        assert!(ReplicaConfig::from_toml_str("replica_id = 0\nreplica_name = \"x\"").is_err());
        assert!(ReplicaConfig::from_toml_str("replica_id = 65535\nreplica_name = \"x\"").is_err());
        assert!(ReplicaConfig::from_toml_str("replica_id = 1\nreplica_name = \" \"").is_err());
        assert!(ReplicaConfig::from_toml_str("replica_name = \"x\"").is_err());
    }

    #[test]
    fn config_load() {
        let path = std::env::temp_dir().join(format!("repl-core-config-{:016x}.toml", rand::random::<u64>()));
        std::fs::write(&path, "replica_id = 2\nreplica_name = \"r\"\n").unwrap();
        let config = ReplicaConfig::load(&path).unwrap();
        assert_eq!(config.replica_id, 2);
        let _ = std::fs::remove_file(&path);
        assert!(ReplicaConfig::load(&path).is_err());
    }
}
