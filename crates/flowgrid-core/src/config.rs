//! flowgrid.toml configuration parser.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{NodeIdentity, NodeType};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowgridConfig {
    pub node: NodeConfig,
    pub registry: RegistryConfig,
    pub heartbeat: HeartbeatConfig,
    pub membership: MembershipConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub node_type: NodeType,
    /// Worker groups a worker registers in. Ignored for masters.
    pub worker_groups: Vec<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5678,
            node_type: NodeType::Master,
            worker_groups: vec!["default".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Root path every registry key lives under.
    pub namespace: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            namespace: "/flowgrid".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    /// Consecutive failed writes before the node reports itself degraded.
    pub failure_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    pub worker_sync_interval_secs: u64,
    pub event_channel_capacity: usize,
    pub await_visible_attempts: u32,
    pub await_visible_interval_ms: u64,
    /// Age after which a worker record left over from an outage is removed
    /// by self-heal. Defaults to three heartbeat intervals when unset.
    pub stale_after_secs: Option<u64>,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            worker_sync_interval_secs: 10,
            event_channel_capacity: 1024,
            await_visible_attempts: 30,
            await_visible_interval_ms: 100,
            stale_after_secs: None,
        }
    }
}

impl FlowgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: FlowgridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.node.host.is_empty() {
            anyhow::bail!("node.host must not be empty");
        }
        if self.heartbeat.interval_secs == 0 {
            anyhow::bail!("heartbeat.interval_secs must be at least 1");
        }
        if self.membership.event_channel_capacity == 0 {
            anyhow::bail!("membership.event_channel_capacity must be at least 1");
        }
        if self.node.node_type == NodeType::Worker && self.node.worker_groups.is_empty() {
            anyhow::bail!("a worker needs at least one entry in node.worker_groups");
        }
        Ok(())
    }

    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity::new(self.node.host.clone(), self.node.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }

    pub fn worker_sync_interval(&self) -> Duration {
        Duration::from_secs(self.membership.worker_sync_interval_secs)
    }

    pub fn await_visible_interval(&self) -> Duration {
        Duration::from_millis(self.membership.await_visible_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        match self.membership.stale_after_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.heartbeat_interval() * 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config = FlowgridConfig::parse("").unwrap();
        assert_eq!(config.node.node_type, NodeType::Master);
        assert_eq!(config.registry.namespace, "/flowgrid");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_worker() {
        let toml_str = r#"
[node]
host = "10.0.0.7"
port = 1234
node_type = "worker"
worker_groups = ["etl", "default"]

[heartbeat]
interval_secs = 5
"#;
        let config = FlowgridConfig::parse(toml_str).unwrap();
        assert_eq!(config.identity().to_string(), "10.0.0.7:1234");
        assert_eq!(config.node.node_type, NodeType::Worker);
        assert_eq!(config.node.worker_groups, vec!["etl", "default"]);
        assert_eq!(config.heartbeat.failure_threshold, 3);
        assert_eq!(config.stale_after(), Duration::from_secs(15));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let err = FlowgridConfig::parse("[heartbeat]\ninterval_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("interval_secs"));
    }

    #[test]
    fn test_rejects_worker_without_groups() {
        let toml_str = "[node]\nnode_type = \"worker\"\nworker_groups = []\n";
        assert!(FlowgridConfig::parse(toml_str).is_err());
    }

    #[test]
    fn test_round_trip_toml() {
        let config = FlowgridConfig::default();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("[heartbeat]"));
        let back = FlowgridConfig::parse(&rendered).unwrap();
        assert_eq!(back.node.port, config.node.port);
    }
}
