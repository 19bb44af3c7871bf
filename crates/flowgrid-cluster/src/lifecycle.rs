//! Ordered startup sequence of a node.
//!
//! ```text
//! acquire startup lock
//!   → register (fatal on failure)
//!   → reconcile previous incarnation
//!   → await own registration visible
//!   → load membership, self-heal if lone master
//!   → subscribe to membership events (fatal on failure)
//! release startup lock (always)
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use flowgrid_core::{epoch_millis, NodeIdentity, NodeType, ServerRecord};
use flowgrid_registry::{with_lock, RegistryEvent, RegistryGateway, RegistryPaths};

use crate::error::ClusterResult;
use crate::failover::FailoverCoordinator;
use crate::membership::MembershipCache;
use crate::work::WorkStore;

/// Whether `me` is the only live master and must clean up after a full
/// cluster outage.
pub fn should_self_heal(masters: &BTreeSet<NodeIdentity>, me: &NodeIdentity) -> bool {
    masters.len() == 1 && masters.contains(me)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelfHealReport {
    /// Worker registrations whose heartbeat had gone stale.
    pub stale_entries_removed: usize,
    /// Hosts with in-flight work and no live registration.
    pub hosts_failed_over: usize,
}

pub struct RegistrationLifecycle {
    registry: Arc<dyn RegistryGateway>,
    store: Arc<dyn WorkStore>,
    membership: Arc<MembershipCache>,
    failover: Arc<FailoverCoordinator>,
    paths: RegistryPaths,
    record: ServerRecord,
    record_paths: Vec<String>,
    await_attempts: u32,
    await_interval: Duration,
    stale_after: Duration,
}

impl RegistrationLifecycle {
    pub fn new(
        registry: Arc<dyn RegistryGateway>,
        store: Arc<dyn WorkStore>,
        membership: Arc<MembershipCache>,
        failover: Arc<FailoverCoordinator>,
        paths: RegistryPaths,
        record: ServerRecord,
        record_paths: Vec<String>,
    ) -> Self {
        Self {
            registry,
            store,
            membership,
            failover,
            paths,
            record,
            record_paths,
            await_attempts: 30,
            await_interval: Duration::from_millis(100),
            stale_after: Duration::from_secs(30),
        }
    }

    pub fn with_await_visible(mut self, attempts: u32, interval: Duration) -> Self {
        self.await_attempts = attempts;
        self.await_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    fn me(&self) -> &NodeIdentity {
        &self.record.identity
    }

    /// Run the startup sequence under the startup lock for this node type.
    pub async fn run(&self, events: mpsc::Sender<RegistryEvent>) -> ClusterResult<()> {
        let lock = self.paths.startup_lock(self.record.node_type);
        debug!(node = %self.me(), %lock, "waiting for startup lock");
        with_lock(&self.registry, &lock, self.run_locked(events)).await?
    }

    async fn run_locked(&self, events: mpsc::Sender<RegistryEvent>) -> ClusterResult<()> {
        self.register().await?;
        self.reconcile().await;
        self.await_self_visible().await;

        match self.membership.load_all().await {
            Ok(()) => {
                let masters = self.membership.master_identities().await;
                if self.record.node_type == NodeType::Master && should_self_heal(&masters, self.me()) {
                    match self.self_heal().await {
                        Ok(report) => info!(
                            stale_entries_removed = report.stale_entries_removed,
                            hosts_failed_over = report.hosts_failed_over,
                            "self-heal finished"
                        ),
                        Err(e) => warn!(error = %e, "self-heal failed"),
                    }
                }
            }
            Err(e) => warn!(error = %e, "initial membership load failed, skipping self-heal"),
        }

        self.registry.subscribe(&self.paths.nodes_root(), events).await?;
        // Catch changes that landed between the initial load and the subscription.
        if let Err(e) = self.membership.refresh_masters().await {
            warn!(error = %e, "failed to refresh masters after subscribing");
        }

        info!(node = %self.me(), node_type = %self.record.node_type, "node registered");
        Ok(())
    }

    /// Publish this node's record under each registration path, replacing
    /// any entry a previous incarnation left behind.
    pub async fn register(&self) -> ClusterResult<()> {
        let value = self.record.to_json()?;
        for path in &self.record_paths {
            if self.registry.remove(path).await? {
                info!(%path, "removed registration left by a previous incarnation");
            }
            self.registry.persist_ephemeral(path, &value).await?;
            debug!(%path, "registered");
        }
        Ok(())
    }

    /// Clear this node's dead-server record and, for a master, fail over
    /// whatever a previous incarnation still owns.
    async fn reconcile(&self) {
        let node_type = self.record.node_type;
        let marker = self.paths.dead_server_path(node_type, self.me());
        match self.registry.remove(&marker).await {
            Ok(true) => info!(node = %self.me(), "cleared dead-server record of a previous incarnation"),
            Ok(false) => {}
            Err(e) => warn!(error = %e, "failed to clear dead-server record"),
        }

        if node_type != NodeType::Master {
            return;
        }
        match self.failover.failover(node_type, self.me()).await {
            Ok(report) if report.failed_over > 0 => {
                info!(failed_over = report.failed_over, "recovered work of a previous incarnation");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failover of previous incarnation failed"),
        }
    }

    async fn await_self_visible(&self) {
        let Some((parent, name)) = self.record_paths.first().and_then(|p| p.rsplit_once('/')) else {
            return;
        };
        for attempt in 1..=self.await_attempts {
            match self.registry.get_children(parent).await {
                Ok(children) if children.contains(name) => {
                    debug!(attempt, "own registration visible");
                    return;
                }
                Ok(_) => {}
                Err(e) => debug!(attempt, error = %e, "registration visibility check failed"),
            }
            tokio::time::sleep(self.await_interval).await;
        }
        warn!(attempts = self.await_attempts, "own registration not visible, continuing");
    }

    /// Clean up after a full cluster outage.
    ///
    /// Worker registrations whose heartbeat is older than `stale_after` are
    /// removed, then every host that still owns in-flight work but has no
    /// live registration is failed over.
    pub async fn self_heal(&self) -> ClusterResult<SelfHealReport> {
        warn!(node = %self.me(), "only live master, running self-heal");
        let mut report = SelfHealReport::default();
        let now = epoch_millis();
        let stale_ms = self.stale_after.as_millis() as u64;

        for group in self.registry.get_children(&self.paths.worker_root()).await? {
            let root = self.paths.worker_group_root(&group);
            for child in self.registry.get_children(&root).await? {
                let path = format!("{root}/{child}");
                let stale = match self.registry.get_value(&path).await? {
                    Some(raw) => match ServerRecord::from_json(&raw) {
                        Ok(record) => now.saturating_sub(record.last_heartbeat_at) > stale_ms,
                        Err(_) => true,
                    },
                    None => false,
                };
                if stale && self.registry.remove(&path).await? {
                    info!(%path, "removed stale worker registration");
                    report.stale_entries_removed += 1;
                }
            }
        }

        self.membership.load_all().await?;
        let masters = self.membership.master_identities().await;
        let workers: BTreeSet<NodeIdentity> = self
            .membership
            .worker_groups()
            .await
            .into_values()
            .flatten()
            .collect();

        for (node_type, live) in [(NodeType::Master, &masters), (NodeType::Worker, &workers)] {
            for host in self.store.in_flight_hosts(node_type)? {
                let identity = match host.parse::<NodeIdentity>() {
                    Ok(identity) => identity,
                    Err(e) => {
                        warn!(%host, error = %e, "in-flight work has malformed host");
                        continue;
                    }
                };
                if live.contains(&identity) {
                    continue;
                }
                match self.failover.failover(node_type, &identity).await {
                    Ok(_) => report.hosts_failed_over += 1,
                    Err(e) => warn!(%node_type, %host, error = %e, "self-heal failover failed"),
                }
            }
        }
        Ok(report)
    }
}
