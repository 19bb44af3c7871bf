//! Shared types used across Flowgrid crates.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced when parsing a `host:port` node address.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("missing ':' separator in node address {0:?}")]
    MissingPort(String),

    #[error("invalid port in node address {0:?}")]
    InvalidPort(String),

    #[error("empty host in node address {0:?}")]
    EmptyHost(String),
}

/// Network identity of a master or worker process.
///
/// Serialized as `"host:port"`. The ordering is the ring order used for slot
/// assignment: a byte-wise comparison of the `host:port` string, so `a:10`
/// sorts before `a:9`. Every node in the cluster must format addresses the
/// same way (no leading zeros, same hostname vs. IP choice) or slot
/// assignments disagree across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct NodeIdentity {
    host: String,
    port: u16,
}

impl NodeIdentity {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The `host:port` form used in registry paths and `host` columns.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Ord for NodeIdentity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address().cmp(&other.address())
    }
}

impl PartialOrd for NodeIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for NodeIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| IdentityError::MissingPort(s.to_string()))?;
        if host.is_empty() {
            return Err(IdentityError::EmptyHost(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| IdentityError::InvalidPort(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

impl From<NodeIdentity> for String {
    fn from(identity: NodeIdentity) -> Self {
        identity.address()
    }
}

impl TryFrom<String> for NodeIdentity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Kind of server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Master,
    Worker,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Master => "master",
            NodeType::Worker => "worker",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "master" => Ok(NodeType::Master),
            "worker" => Ok(NodeType::Worker),
            other => Err(format!("unknown node type: {other}")),
        }
    }
}

/// Load metrics sampled on each heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMetrics {
    /// One-minute load average.
    pub cpu_load: f64,
    /// Available physical memory in bytes.
    pub free_memory_bytes: u64,
}

/// Liveness record a node publishes under its registry path.
///
/// Owned by the publishing node; every other node treats it as read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub identity: NodeIdentity,
    pub node_type: NodeType,
    /// Unix timestamp (millis) when this process incarnation started.
    pub startup_at: u64,
    pub metrics: ResourceMetrics,
    /// Unix timestamp (millis) of the last successful heartbeat write.
    pub last_heartbeat_at: u64,
}

impl ServerRecord {
    pub fn new(identity: NodeIdentity, node_type: NodeType, startup_at: u64) -> Self {
        Self {
            identity,
            node_type,
            startup_at,
            metrics: ResourceMetrics::default(),
            last_heartbeat_at: startup_at,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Marker persisted when a failover pass declares a node dead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadServerRecord {
    pub identity: NodeIdentity,
    pub node_type: NodeType,
    /// Unix timestamp (millis) when the node was declared dead.
    pub recorded_at: u64,
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips_through_address() {
        let id: NodeIdentity = "10.0.0.1:5678".parse().unwrap();
        assert_eq!(id.host(), "10.0.0.1");
        assert_eq!(id.port(), 5678);
        assert_eq!(id.to_string(), "10.0.0.1:5678");
    }

    #[test]
    fn identity_rejects_malformed_addresses() {
        assert!(matches!(
            "no-port".parse::<NodeIdentity>(),
            Err(IdentityError::MissingPort(_))
        ));
        assert!(matches!(
            "host:http".parse::<NodeIdentity>(),
            Err(IdentityError::InvalidPort(_))
        ));
        assert!(matches!(
            ":80".parse::<NodeIdentity>(),
            Err(IdentityError::EmptyHost(_))
        ));
    }

    #[test]
    fn identity_orders_by_address_string() {
        let nine = NodeIdentity::new("a", 9);
        let ten = NodeIdentity::new("a", 10);
        // "a:10" < "a:9" byte-wise, regardless of the numeric ports.
        assert!(ten < nine);
    }

    #[test]
    fn identity_serializes_as_string() {
        let id = NodeIdentity::new("w1", 10);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"w1:10\"");
        let back: NodeIdentity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn server_record_json() {
        let mut record = ServerRecord::new(NodeIdentity::new("m1", 5678), NodeType::Master, 1000);
        record.metrics.cpu_load = 0.5;
        let raw = record.to_json().unwrap();
        assert!(raw.contains("\"m1:5678\""));
        assert!(raw.contains("\"master\""));
        assert_eq!(ServerRecord::from_json(&raw).unwrap(), record);
    }

    #[test]
    fn node_type_parses_case_insensitively() {
        assert_eq!("MASTER".parse::<NodeType>().unwrap(), NodeType::Master);
        assert_eq!("worker".parse::<NodeType>().unwrap(), NodeType::Worker);
        assert!("scheduler".parse::<NodeType>().is_err());
    }
}
