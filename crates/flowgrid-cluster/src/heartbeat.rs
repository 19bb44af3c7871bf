//! Keeps this node's registry record fresh.
//!
//! Each tick samples local load, rewrites the node's ephemeral
//! `ServerRecord` under every path it registered, and reports the outcome
//! to a [`HeartbeatTracker`]. Health changes are broadcast on a `watch`
//! channel for the surrounding process.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use flowgrid_core::{epoch_millis, ServerRecord};
use flowgrid_registry::{RegistryGateway, RegistryPaths};

use crate::health::{HeartbeatTracker, NodeHealth};
use crate::metrics::{MetricsSampler, SystemSampler};

pub struct HeartbeatPublisher {
    registry: Arc<dyn RegistryGateway>,
    sampler: Arc<dyn MetricsSampler>,
    record: ServerRecord,
    /// Registration paths rewritten on every tick.
    record_paths: Vec<String>,
    /// Presence of this key means a peer failed this node over.
    dead_marker: String,
    interval: Duration,
    tracker: HeartbeatTracker,
    health: watch::Sender<NodeHealth>,
}

impl HeartbeatPublisher {
    pub fn new(
        registry: Arc<dyn RegistryGateway>,
        paths: &RegistryPaths,
        record: ServerRecord,
        record_paths: Vec<String>,
        health: watch::Sender<NodeHealth>,
    ) -> Self {
        let dead_marker = paths.dead_server_path(record.node_type, &record.identity);
        Self {
            registry,
            sampler: Arc::new(SystemSampler::new()),
            record,
            record_paths,
            dead_marker,
            interval: Duration::from_secs(10),
            tracker: HeartbeatTracker::new(3),
            health,
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn MetricsSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.tracker = HeartbeatTracker::new(threshold);
        self
    }

    /// Perform one heartbeat and return the resulting health.
    pub async fn beat(&mut self) -> NodeHealth {
        let status = self.try_beat().await;
        self.health.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        status
    }

    async fn try_beat(&mut self) -> NodeHealth {
        match self.registry.exists(&self.dead_marker).await {
            Ok(true) => return self.tracker.fence(),
            Ok(false) => {}
            Err(e) => {
                warn!(node = %self.record.identity, error = %e, "heartbeat fencing check failed");
                return self.tracker.record_failure();
            }
        }

        self.record.metrics = self.sampler.sample();
        self.record.last_heartbeat_at = epoch_millis();
        let value = match self.record.to_json() {
            Ok(v) => v,
            Err(e) => {
                warn!(node = %self.record.identity, error = %e, "failed to encode heartbeat record");
                return self.tracker.record_failure();
            }
        };

        for path in &self.record_paths {
            if let Err(e) = self.registry.persist_ephemeral(path, &value).await {
                warn!(%path, error = %e, "heartbeat write failed");
                return self.tracker.record_failure();
            }
        }

        debug!(
            node = %self.record.identity,
            cpu_load = self.record.metrics.cpu_load,
            free_memory_bytes = self.record.metrics.free_memory_bytes,
            "heartbeat published"
        );
        self.tracker.record_success()
    }

    /// Run the heartbeat loop until shutdown or until the node is fenced.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(node = %self.record.identity, interval = ?self.interval, "heartbeat loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.beat().await == NodeHealth::Fenced {
                        warn!(node = %self.record.identity, "heartbeat loop stopped, node is fenced");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    info!(node = %self.record.identity, "heartbeat loop shutting down");
                    break;
                }
            }
        }
    }
}
