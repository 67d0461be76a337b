//! Node configuration, loaded from a TOML file or built from CLI flags.

use crate::{
    error::{Error, Result},
    peer::RegistrySettings,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, path::Path, time::Duration};

pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 1_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_CONNECT_BACKOFF_MS: u64 = 800;
pub const DEFAULT_HEALTH_INTERVAL_MS: u64 = 3_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address we listen on. Also our identity and tie-breaker.
    pub listen_address: String,

    /// Every peer of the group. Our own address may appear and is skipped.
    pub peers: Vec<String>,

    /// Per-call timeout of outbound `Request`, `Reply` and `Ping`.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Pause between two dial attempts to the same peer.
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,

    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,
}

fn default_call_timeout_ms() -> u64 {
    DEFAULT_CALL_TIMEOUT_MS
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_connect_backoff_ms() -> u64 {
    DEFAULT_CONNECT_BACKOFF_MS
}

fn default_health_interval_ms() -> u64 {
    DEFAULT_HEALTH_INTERVAL_MS
}

impl NodeConfig {
    pub fn new(listen_address: impl Into<String>, peers: Vec<String>) -> Self {
        Self {
            listen_address: listen_address.into(),
            peers,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            connect_backoff_ms: DEFAULT_CONNECT_BACKOFF_MS,
            health_interval_ms: DEFAULT_HEALTH_INTERVAL_MS,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_address.trim().is_empty() {
            return Err(Error::Config("listen_address is empty".into()));
        }
        if self.peer_addresses().is_empty() {
            return Err(Error::Config("no peers besides ourselves".into()));
        }

        let durations = [
            ("call_timeout_ms", self.call_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("connect_backoff_ms", self.connect_backoff_ms),
            ("health_interval_ms", self.health_interval_ms),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, ms)| *ms == 0) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }
        Ok(())
    }

    /// Peers other than ourselves, trimmed, without blanks or duplicates, in
    /// the order first given.
    pub fn peer_addresses(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.peers
            .iter()
            .map(|peer| peer.trim().to_string())
            .filter(|peer| !peer.is_empty() && *peer != self.listen_address)
            .filter(|peer| seen.insert(peer.clone()))
            .collect()
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            connect_backoff: Duration::from_millis(self.connect_backoff_ms),
            probe_timeout: self.call_timeout(),
            health_interval: Duration::from_millis(self.health_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn toml_fills_in_defaults() {
        let config = NodeConfig::from_toml(
            r#"
listen_address = "127.0.0.1:5001"
peers = ["127.0.0.1:5001", "127.0.0.1:5002", " 127.0.0.1:5003 "]
call_timeout_ms = 250
"#,
        )
        .unwrap();

        assert_eq!(config.call_timeout(), Duration::from_millis(250));
        assert_eq!(config.connect_backoff_ms, DEFAULT_CONNECT_BACKOFF_MS);
        assert_eq!(
            config.peer_addresses(),
            vec!["127.0.0.1:5002".to_string(), "127.0.0.1:5003".to_string()]
        );
    }

    #[test]
    fn repeated_peers_are_listed_once() {
        let config = NodeConfig::new(
            "a:1",
            vec!["c:1".into(), "b:1".into(), " c:1".into(), "a:1".into(), "b:1".into()],
        );
        assert_eq!(
            config.peer_addresses(),
            vec!["c:1".to_string(), "b:1".to_string()]
        );
    }

    #[test]
    fn rejects_lonely_node_and_zero_durations() {
        let lonely = NodeConfig::new("a:1", vec!["a:1".into()]);
        assert!(matches!(lonely.validate(), Err(Error::Config(_))));

        let mut zero = NodeConfig::new("a:1", vec!["b:1".into()]);
        zero.health_interval_ms = 0;
        let err = zero.validate().unwrap_err().to_string();
        assert!(err.contains("health_interval_ms"));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "listen_address = \"x:1\"\npeers = [\"y:1\"]").unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config, NodeConfig::new("x:1", vec!["y:1".into()]));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        assert!(matches!(
            NodeConfig::from_file("/nonexistent/ra-mutex.toml"),
            Err(Error::Config(_))
        ));
    }
}
