//! Registry key layout.
//!
//! ```text
//! {ns}/nodes/master/{host:port}                  ephemeral ServerRecord
//! {ns}/nodes/worker/{group}/{host:port}          ephemeral ServerRecord
//! {ns}/dead-servers/{master|worker}_{host:port}  persistent DeadServerRecord
//! {ns}/lock/failover/{master|worker}
//! {ns}/lock/startup/{master|worker}
//! ```

use flowgrid_core::{NodeIdentity, NodeType};

/// A node registration path resolved back into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePath {
    Master(NodeIdentity),
    Worker { group: String, identity: NodeIdentity },
}

impl NodePath {
    pub fn node_type(&self) -> NodeType {
        match self {
            NodePath::Master(_) => NodeType::Master,
            NodePath::Worker { .. } => NodeType::Worker,
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        match self {
            NodePath::Master(identity) => identity,
            NodePath::Worker { identity, .. } => identity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPaths {
    namespace: String,
}

impl RegistryPaths {
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace = namespace.into().trim_end_matches('/').to_string();
        Self { namespace }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn nodes_root(&self) -> String {
        format!("{}/nodes", self.namespace)
    }

    pub fn node_root(&self, node_type: NodeType) -> String {
        format!("{}/{}", self.nodes_root(), node_type)
    }

    pub fn master_root(&self) -> String {
        self.node_root(NodeType::Master)
    }

    pub fn worker_root(&self) -> String {
        self.node_root(NodeType::Worker)
    }

    pub fn master_path(&self, identity: &NodeIdentity) -> String {
        format!("{}/{}", self.master_root(), identity)
    }

    pub fn worker_group_root(&self, group: &str) -> String {
        format!("{}/{}", self.worker_root(), group)
    }

    pub fn worker_path(&self, group: &str, identity: &NodeIdentity) -> String {
        format!("{}/{}", self.worker_group_root(group), identity)
    }

    pub fn dead_servers_root(&self) -> String {
        format!("{}/dead-servers", self.namespace)
    }

    pub fn dead_server_path(&self, node_type: NodeType, identity: &NodeIdentity) -> String {
        format!("{}/{}_{}", self.dead_servers_root(), node_type, identity)
    }

    pub fn failover_lock(&self, node_type: NodeType) -> String {
        format!("{}/lock/failover/{}", self.namespace, node_type)
    }

    pub fn startup_lock(&self, node_type: NodeType) -> String {
        format!("{}/lock/startup/{}", self.namespace, node_type)
    }

    /// Resolve a node registration path. Returns `None` for anything that
    /// is not a master or worker leaf key under this namespace.
    pub fn parse_node_path(&self, path: &str) -> Option<NodePath> {
        let rest = path.strip_prefix(&self.nodes_root())?.strip_prefix('/')?;
        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            ["master", address] => address.parse().ok().map(NodePath::Master),
            ["worker", group, address] if !group.is_empty() => {
                let identity = address.parse().ok()?;
                Some(NodePath::Worker {
                    group: group.to_string(),
                    identity,
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_paths_under_namespace() {
        let paths = RegistryPaths::new("/flowgrid/");
        let id = NodeIdentity::new("10.0.0.1", 5678);

        assert_eq!(paths.master_path(&id), "/flowgrid/nodes/master/10.0.0.1:5678");
        assert_eq!(paths.worker_path("etl", &id), "/flowgrid/nodes/worker/etl/10.0.0.1:5678");
        assert_eq!(
            paths.dead_server_path(NodeType::Worker, &id),
            "/flowgrid/dead-servers/worker_10.0.0.1:5678"
        );
        assert_eq!(paths.failover_lock(NodeType::Master), "/flowgrid/lock/failover/master");
        assert_eq!(paths.startup_lock(NodeType::Worker), "/flowgrid/lock/startup/worker");
    }

    #[test]
    fn parses_node_paths() {
        let paths = RegistryPaths::new("/flowgrid");
        let id = NodeIdentity::new("w1", 10);

        assert_eq!(
            paths.parse_node_path("/flowgrid/nodes/master/w1:10"),
            Some(NodePath::Master(id.clone()))
        );
        assert_eq!(
            paths.parse_node_path("/flowgrid/nodes/worker/etl/w1:10"),
            Some(NodePath::Worker {
                group: "etl".to_string(),
                identity: id,
            })
        );
    }

    #[test]
    fn rejects_foreign_paths() {
        let paths = RegistryPaths::new("/flowgrid");

        assert_eq!(paths.parse_node_path("/flowgrid/nodes/master"), None);
        assert_eq!(paths.parse_node_path("/flowgrid/nodes/worker/etl"), None);
        assert_eq!(paths.parse_node_path("/flowgrid/nodes/master/no-port"), None);
        assert_eq!(paths.parse_node_path("/flowgrid/nodes/alerter/a:1"), None);
        assert_eq!(paths.parse_node_path("/other/nodes/master/a:1"), None);
        assert_eq!(paths.parse_node_path("/flowgrid/nodes/master/a:1/extra"), None);
    }
}
