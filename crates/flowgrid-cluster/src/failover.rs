//! Failover coordinator — takes over the in-flight work of dead nodes.
//!
//! A pass runs under the registry-wide failover lock for the dead node's
//! type, so at most one process in the cluster fails over masters (or
//! workers) at a time. Passes keep no state of their own: every decision
//! is re-derived from the registry and the work store, and the conditional
//! updates in [`WorkStore`] make a repeated pass for the same node a no-op.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use flowgrid_core::{epoch_millis, DeadServerRecord, NodeIdentity, NodeType, ServerRecord};
use flowgrid_registry::{with_lock, RegistryGateway, RegistryPaths};

use crate::error::{ClusterError, ClusterResult};
use crate::work::{JobKiller, WorkStore};

/// A node that disappeared from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverRequest {
    pub node_type: NodeType,
    pub identity: NodeIdentity,
}

/// Outcome of one failover pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailoverReport {
    /// In-flight work items found on the dead host.
    pub examined: usize,
    pub failed_over: usize,
    /// Items left alone: already moved, or started by a newer incarnation.
    pub skipped: usize,
    pub errors: usize,
}

pub struct FailoverCoordinator {
    registry: Arc<dyn RegistryGateway>,
    store: Arc<dyn WorkStore>,
    killer: Arc<dyn JobKiller>,
    paths: RegistryPaths,
}

impl FailoverCoordinator {
    pub fn new(
        registry: Arc<dyn RegistryGateway>,
        store: Arc<dyn WorkStore>,
        killer: Arc<dyn JobKiller>,
        paths: RegistryPaths,
    ) -> Self {
        Self {
            registry,
            store,
            killer,
            paths,
        }
    }

    /// Run one failover pass for `dead` under the failover lock.
    pub async fn failover(&self, node_type: NodeType, dead: &NodeIdentity) -> ClusterResult<FailoverReport> {
        let lock = self.paths.failover_lock(node_type);
        debug!(%node_type, node = %dead, "waiting for failover lock");
        with_lock(&self.registry, &lock, self.failover_locked(node_type, dead)).await?
    }

    async fn failover_locked(&self, node_type: NodeType, dead: &NodeIdentity) -> ClusterResult<FailoverReport> {
        let started = std::time::Instant::now();
        let current = self.current_incarnation(node_type, dead).await?;

        match &current {
            Some(record) => {
                debug!(
                    %node_type,
                    node = %dead,
                    startup_at = record.startup_at,
                    "node is registered again, only work from earlier incarnations is failed over"
                );
            }
            None => self.record_dead(node_type, dead).await?,
        }

        let report = match node_type {
            NodeType::Master => self.failover_master(dead, current.as_ref())?,
            NodeType::Worker => self.failover_worker(dead, current.as_ref()).await?,
        };

        info!(
            %node_type,
            node = %dead,
            examined = report.examined,
            failed_over = report.failed_over,
            skipped = report.skipped,
            errors = report.errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "failover pass finished"
        );
        Ok(report)
    }

    /// The live registration of `identity`, if it has come back.
    async fn current_incarnation(
        &self,
        node_type: NodeType,
        identity: &NodeIdentity,
    ) -> ClusterResult<Option<ServerRecord>> {
        let candidates = match node_type {
            NodeType::Master => vec![self.paths.master_path(identity)],
            NodeType::Worker => self
                .registry
                .get_children(&self.paths.worker_root())
                .await?
                .into_iter()
                .map(|group| self.paths.worker_path(&group, identity))
                .collect(),
        };

        for path in candidates {
            if let Some(raw) = self.registry.get_value(&path).await? {
                let record = ServerRecord::from_json(&raw).map_err(|e| ClusterError::InvalidRecord {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn record_dead(&self, node_type: NodeType, identity: &NodeIdentity) -> ClusterResult<()> {
        let record = DeadServerRecord {
            identity: identity.clone(),
            node_type,
            recorded_at: epoch_millis(),
        };
        let path = self.paths.dead_server_path(node_type, identity);
        self.registry
            .persist(&path, &serde_json::to_string(&record)?)
            .await?;
        info!(%node_type, node = %identity, "node recorded as dead");
        Ok(())
    }

    fn failover_master(
        &self,
        dead: &NodeIdentity,
        current: Option<&ServerRecord>,
    ) -> ClusterResult<FailoverReport> {
        let mut report = FailoverReport::default();
        let workflows = self
            .store
            .query_in_flight_workflow_instances_by_host(&dead.address())?;

        for workflow in workflows {
            report.examined += 1;
            if let Some(record) = current {
                if workflow.last_started_at() > record.startup_at {
                    debug!(
                        workflow_instance_id = workflow.id,
                        "workflow started by the current incarnation, skipping"
                    );
                    report.skipped += 1;
                    continue;
                }
            }

            match self.store.clear_workflow_host_and_enqueue_command(&workflow) {
                Ok(true) => {
                    info!(workflow_instance_id = workflow.id, node = %dead, "workflow failed over");
                    report.failed_over += 1;
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(workflow_instance_id = workflow.id, error = %e, "workflow failover failed");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    async fn failover_worker(
        &self,
        dead: &NodeIdentity,
        current: Option<&ServerRecord>,
    ) -> ClusterResult<FailoverReport> {
        let mut report = FailoverReport::default();
        let tasks = self
            .store
            .query_in_flight_task_instances_by_host(&dead.address())?;

        for task in tasks {
            report.examined += 1;
            if let (Some(record), Some(started_at)) = (current, task.started_at) {
                if started_at > record.startup_at {
                    debug!(
                        task_instance_id = task.id,
                        "task started by the current incarnation, skipping"
                    );
                    report.skipped += 1;
                    continue;
                }
            }

            if !task.external_job_ids.is_empty() {
                if let Err(e) = self.killer.kill(&task).await {
                    warn!(task_instance_id = task.id, error = %e, "failed to kill external jobs");
                }
            }

            match self.store.mark_task_needs_fault_tolerance(&task) {
                Ok(true) => {
                    info!(task_instance_id = task.id, node = %dead, "task failed over");
                    report.failed_over += 1;
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(task_instance_id = task.id, error = %e, "task failover failed");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Serve failover requests one at a time until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<FailoverRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("failover worker started");
        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    if let Err(e) = self.failover(request.node_type, &request.identity).await {
                        warn!(
                            node_type = %request.node_type,
                            node = %request.identity,
                            error = %e,
                            "failover pass failed"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    info!("failover worker shutting down");
                    break;
                }
            }
        }
    }
}
