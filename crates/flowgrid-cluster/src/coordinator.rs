//! Composition root for one node's cluster role.
//!
//! Owns the membership cache, the failover coordinator and the background
//! tasks, and exposes the small surface the rest of the process needs:
//! this node's slot, the live masters, worker group members, and a health
//! signal.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use flowgrid_core::{epoch_millis, FlowgridConfig, NodeIdentity, NodeType, ServerRecord};
use flowgrid_registry::{RegistryGateway, RegistryPaths};

use crate::error::{ClusterError, ClusterResult};
use crate::failover::FailoverCoordinator;
use crate::health::NodeHealth;
use crate::heartbeat::HeartbeatPublisher;
use crate::lifecycle::RegistrationLifecycle;
use crate::membership::MembershipCache;
use crate::metrics::{MetricsSampler, SystemSampler};
use crate::slot::SlotAssignment;
use crate::work::{JobKiller, NoopJobKiller, WorkStore};

pub struct ClusterCoordinator {
    config: FlowgridConfig,
    registry: Arc<dyn RegistryGateway>,
    store: Arc<dyn WorkStore>,
    paths: RegistryPaths,
    record: ServerRecord,
    record_paths: Vec<String>,
    membership: Arc<MembershipCache>,
    failover: Arc<FailoverCoordinator>,
    sampler: Arc<dyn MetricsSampler>,
    health: watch::Sender<NodeHealth>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ClusterCoordinator {
    pub fn new(
        config: FlowgridConfig,
        registry: Arc<dyn RegistryGateway>,
        store: Arc<dyn WorkStore>,
    ) -> Self {
        let me = config.identity();
        let paths = RegistryPaths::new(config.registry.namespace.clone());
        let node_type = config.node.node_type;
        let record_paths = match node_type {
            NodeType::Master => vec![paths.master_path(&me)],
            NodeType::Worker => config
                .node
                .worker_groups
                .iter()
                .map(|group| paths.worker_path(group, &me))
                .collect(),
        };
        let record = ServerRecord::new(me.clone(), node_type, epoch_millis());

        let membership = Arc::new(MembershipCache::new(
            registry.clone(),
            store.clone(),
            paths.clone(),
            me,
        ));
        let failover = Arc::new(FailoverCoordinator::new(
            registry.clone(),
            store.clone(),
            Arc::new(NoopJobKiller),
            paths.clone(),
        ));
        let (health, _) = watch::channel(NodeHealth::Healthy);
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            registry,
            store,
            paths,
            record,
            record_paths,
            membership,
            failover,
            sampler: Arc::new(SystemSampler::new()),
            health,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn with_job_killer(mut self, killer: Arc<dyn JobKiller>) -> Self {
        self.failover = Arc::new(FailoverCoordinator::new(
            self.registry.clone(),
            self.store.clone(),
            killer,
            self.paths.clone(),
        ));
        self
    }

    pub fn with_metrics_sampler(mut self, sampler: Arc<dyn MetricsSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.record.identity
    }

    pub fn node_type(&self) -> NodeType {
        self.record.node_type
    }

    pub fn membership(&self) -> &Arc<MembershipCache> {
        &self.membership
    }

    pub fn failover_coordinator(&self) -> &Arc<FailoverCoordinator> {
        &self.failover
    }

    /// Register this node and start the background tasks.
    ///
    /// Fails if the node cannot take the startup lock, register itself or
    /// subscribe to membership events. A node in that state must not keep
    /// running.
    pub async fn start(&self) -> ClusterResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ClusterError::AlreadyStarted);
        }

        let capacity = self.config.membership.event_channel_capacity;
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let mut handles = Vec::new();

        // Only masters take over work; workers just track membership.
        let failover_tx = match self.node_type() {
            NodeType::Master => {
                let (tx, rx) = mpsc::channel(capacity);
                let failover = self.failover.clone();
                let shutdown = self.shutdown.subscribe();
                handles.push(tokio::spawn(async move {
                    failover.run(rx, shutdown).await;
                }));
                Some(tx)
            }
            NodeType::Worker => None,
        };

        let membership = self.membership.clone();
        let shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            membership.run_event_loop(event_rx, failover_tx, shutdown).await;
        }));

        let lifecycle = RegistrationLifecycle::new(
            self.registry.clone(),
            self.store.clone(),
            self.membership.clone(),
            self.failover.clone(),
            self.paths.clone(),
            self.record.clone(),
            self.record_paths.clone(),
        )
        .with_await_visible(
            self.config.membership.await_visible_attempts,
            self.config.await_visible_interval(),
        )
        .with_stale_after(self.config.stale_after());

        if let Err(e) = lifecycle.run(event_tx).await {
            error!(node = %self.identity(), error = %e, "node registration failed");
            self.shutdown.send_replace(true);
            for handle in handles {
                handle.abort();
            }
            self.deregister().await;
            return Err(e);
        }

        let heartbeat = HeartbeatPublisher::new(
            self.registry.clone(),
            &self.paths,
            self.record.clone(),
            self.record_paths.clone(),
            self.health.clone(),
        )
        .with_sampler(self.sampler.clone())
        .with_interval(self.config.heartbeat_interval())
        .with_failure_threshold(self.config.heartbeat.failure_threshold);
        let shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            heartbeat.run(shutdown).await;
        }));

        let membership = self.membership.clone();
        let interval = self.config.worker_sync_interval();
        let shutdown = self.shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            membership.run_worker_sync(interval, shutdown).await;
        }));

        *self.tasks.lock().await = handles;

        let (slot, ring_size) = self.get_self_slot().await;
        info!(
            node = %self.identity(),
            node_type = %self.node_type(),
            ?slot,
            ring_size,
            "cluster coordinator started"
        );
        Ok(())
    }

    /// Stop background tasks and remove this node's registrations so peers
    /// see the departure immediately.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        let handles = std::mem::take(&mut *self.tasks.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "background task ended abnormally");
                }
            }
        }

        self.deregister().await;
        info!(node = %self.identity(), "cluster coordinator stopped");
    }

    async fn deregister(&self) {
        for path in &self.record_paths {
            if let Err(e) = self.registry.remove(path).await {
                warn!(%path, error = %e, "failed to remove registration");
            }
        }
    }

    /// `(slot, ring_size)`; the slot is `None` while this node is not in
    /// the master ring.
    pub async fn get_self_slot(&self) -> (Option<usize>, usize) {
        self.membership.self_slot().await
    }

    pub async fn slot_assignment(&self) -> SlotAssignment {
        self.membership.slot_assignment().await
    }

    pub async fn live_master_identities(&self) -> BTreeSet<NodeIdentity> {
        self.membership.master_identities().await
    }

    pub async fn worker_group_members(&self, group: &str) -> BTreeSet<NodeIdentity> {
        self.membership.worker_group_members(group).await
    }

    /// Heartbeat health. Turns `Fenced` once a peer has declared this node
    /// dead, after which the process should stop.
    pub fn health(&self) -> watch::Receiver<NodeHealth> {
        self.health.subscribe()
    }
}
