//! Membership cache — this process's view of who is alive.
//!
//! Three sections, each behind its own lock:
//!
//! - masters, together with the [`SlotAssignment`] derived from them
//! - worker groups: group name → live worker identities
//! - worker metadata: identity → last `ServerRecord` seen
//!
//! Registry events never patch the cache with deltas. A master event
//! re-reads the whole master set; a worker event re-reads the one affected
//! group. If a read fails, the previous snapshot stays in place.
//!
//! A section's write lock is taken before the registry read that replaces
//! it, so concurrent refreshes apply in the order they read.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use flowgrid_core::{NodeIdentity, NodeType, ServerRecord};
use flowgrid_registry::{EventKind, NodePath, RegistryEvent, RegistryGateway, RegistryPaths};

use crate::error::ClusterResult;
use crate::failover::FailoverRequest;
use crate::slot::SlotAssignment;
use crate::work::WorkStore;

#[derive(Debug, Default)]
struct MasterView {
    members: BTreeSet<NodeIdentity>,
    slot: SlotAssignment,
}

pub struct MembershipCache {
    registry: Arc<dyn RegistryGateway>,
    store: Arc<dyn WorkStore>,
    paths: RegistryPaths,
    me: NodeIdentity,
    masters: RwLock<MasterView>,
    worker_groups: RwLock<BTreeMap<String, BTreeSet<NodeIdentity>>>,
    worker_metadata: RwLock<HashMap<NodeIdentity, ServerRecord>>,
}

impl MembershipCache {
    pub fn new(
        registry: Arc<dyn RegistryGateway>,
        store: Arc<dyn WorkStore>,
        paths: RegistryPaths,
        me: NodeIdentity,
    ) -> Self {
        Self {
            registry,
            store,
            paths,
            me,
            masters: RwLock::new(MasterView::default()),
            worker_groups: RwLock::new(BTreeMap::new()),
            worker_metadata: RwLock::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.me
    }

    // ── Full reload ────────────────────────────────────────────────

    /// Rebuild every section directly from the registry.
    pub async fn load_all(&self) -> ClusterResult<()> {
        self.refresh_masters().await?;

        let mut groups_guard = self.worker_groups.write().await;
        let mut metadata_guard = self.worker_metadata.write().await;
        let live = self.read_live_workers().await?;
        let mut groups: BTreeMap<String, BTreeSet<NodeIdentity>> = BTreeMap::new();
        let mut metadata = HashMap::new();
        for (group, records) in live {
            let members = groups.entry(group).or_default();
            for record in records {
                members.insert(record.identity.clone());
                metadata.insert(record.identity.clone(), record);
            }
        }

        debug!(groups = groups.len(), "membership loaded");
        *groups_guard = groups;
        *metadata_guard = metadata;
        Ok(())
    }

    /// Re-read the master set and recompute this node's slot.
    pub async fn refresh_masters(&self) -> ClusterResult<()> {
        let mut view = self.masters.write().await;
        let members = self.read_identities(&self.paths.master_root()).await?;
        let slot = SlotAssignment::compute(&members, &self.me);

        if view.slot != slot {
            info!(
                slot = ?slot.slot(),
                ring_size = slot.ring_size(),
                "master slot recomputed"
            );
        }
        view.members = members;
        view.slot = slot;
        Ok(())
    }

    /// Re-read the members of one worker group.
    pub async fn refresh_worker_group(&self, group: &str) -> ClusterResult<()> {
        let mut groups = self.worker_groups.write().await;
        let members = self.read_identities(&self.paths.worker_group_root(group)).await?;

        if members.is_empty() {
            groups.remove(group);
        } else {
            groups.insert(group.to_string(), members);
        }
        Ok(())
    }

    /// Backstop reconciliation against missed watch events.
    ///
    /// Worker metadata is replaced with what the registry currently holds.
    /// Groups seen in the registry are kept as-is; a configured group keeps
    /// only those of its addresses that are currently alive.
    pub async fn sync_worker_metadata(&self) -> ClusterResult<()> {
        let mut groups_guard = self.worker_groups.write().await;
        let mut metadata_guard = self.worker_metadata.write().await;
        let live = self.read_live_workers().await?;
        let configured = self.store.list_configured_worker_groups()?;

        let mut metadata = HashMap::new();
        let mut groups: BTreeMap<String, BTreeSet<NodeIdentity>> = BTreeMap::new();
        for (group, records) in live {
            let members = groups.entry(group).or_default();
            for record in records {
                members.insert(record.identity.clone());
                metadata.insert(record.identity.clone(), record);
            }
        }

        for group in configured {
            let alive: BTreeSet<NodeIdentity> = group
                .addresses
                .iter()
                .filter_map(|address| match address.parse::<NodeIdentity>() {
                    Ok(identity) => Some(identity),
                    Err(e) => {
                        warn!(group = %group.name, %address, error = %e, "ignoring malformed worker address");
                        None
                    }
                })
                .filter(|identity| metadata.contains_key(identity))
                .collect();
            groups.insert(group.name, alive);
        }

        *groups_guard = groups;
        *metadata_guard = metadata;
        Ok(())
    }

    async fn read_identities(&self, root: &str) -> ClusterResult<BTreeSet<NodeIdentity>> {
        let children = self.registry.get_children(root).await?;
        Ok(children
            .into_iter()
            .filter_map(|child| match child.parse::<NodeIdentity>() {
                Ok(identity) => Some(identity),
                Err(e) => {
                    warn!(%root, %child, error = %e, "ignoring malformed registry entry");
                    None
                }
            })
            .collect())
    }

    /// Every registered worker record, grouped by worker group.
    async fn read_live_workers(&self) -> ClusterResult<BTreeMap<String, Vec<ServerRecord>>> {
        let mut live = BTreeMap::new();
        for group in self.registry.get_children(&self.paths.worker_root()).await? {
            let mut records = Vec::new();
            for identity in self.read_identities(&self.paths.worker_group_root(&group)).await? {
                let path = self.paths.worker_path(&group, &identity);
                if let Some(record) = self.read_record(&path).await? {
                    records.push(record);
                }
            }
            live.insert(group, records);
        }
        Ok(live)
    }

    async fn read_record(&self, path: &str) -> ClusterResult<Option<ServerRecord>> {
        let Some(raw) = self.registry.get_value(path).await? else {
            return Ok(None);
        };
        match ServerRecord::from_json(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!(%path, error = %e, "ignoring unreadable server record");
                Ok(None)
            }
        }
    }

    // ── Event handling ─────────────────────────────────────────────

    /// Apply one registry event. Returns the failover to run, if any.
    pub async fn apply_event(&self, event: &RegistryEvent) -> Option<FailoverRequest> {
        let Some(node) = self.paths.parse_node_path(&event.path) else {
            debug!(path = %event.path, "ignoring unresolvable registry event");
            return None;
        };
        match node {
            NodePath::Master(identity) => self.on_master_changed(event.kind, identity).await,
            NodePath::Worker { group, identity } => {
                self.on_worker_changed(event.kind, &group, identity).await
            }
        }
    }

    async fn on_master_changed(&self, kind: EventKind, identity: NodeIdentity) -> Option<FailoverRequest> {
        if kind == EventKind::Updated {
            return None;
        }
        info!(master = %identity, ?kind, "master membership changed");
        if let Err(e) = self.refresh_masters().await {
            warn!(error = %e, "failed to refresh masters, keeping previous snapshot");
        }
        self.failover_request(kind, NodeType::Master, identity)
    }

    async fn on_worker_changed(
        &self,
        kind: EventKind,
        group: &str,
        identity: NodeIdentity,
    ) -> Option<FailoverRequest> {
        match kind {
            EventKind::Updated => {
                let path = self.paths.worker_path(group, &identity);
                let mut metadata = self.worker_metadata.write().await;
                match self.read_record(&path).await {
                    Ok(Some(record)) => {
                        metadata.insert(identity, record);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(%path, error = %e, "failed to refresh worker metadata"),
                }
                None
            }
            EventKind::Added | EventKind::Removed => {
                info!(worker = %identity, %group, ?kind, "worker membership changed");
                if let Err(e) = self.refresh_worker_group(group).await {
                    warn!(%group, error = %e, "failed to refresh worker group, keeping previous snapshot");
                }
                if kind == EventKind::Removed {
                    self.worker_metadata.write().await.remove(&identity);
                }
                self.failover_request(kind, NodeType::Worker, identity)
            }
        }
    }

    fn failover_request(
        &self,
        kind: EventKind,
        node_type: NodeType,
        identity: NodeIdentity,
    ) -> Option<FailoverRequest> {
        if kind != EventKind::Removed {
            return None;
        }
        if identity == self.me {
            // Our own entry is removed when a previous incarnation is
            // reconciled at startup; that work is handled there.
            debug!(%node_type, "ignoring removal of own registration");
            return None;
        }
        Some(FailoverRequest { node_type, identity })
    }

    /// Consume registry events until shutdown. Removals are forwarded to
    /// `failover` when a sender is given.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<RegistryEvent>,
        failover: Option<mpsc::Sender<FailoverRequest>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(node = %self.me, "membership event loop started");
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let Some(request) = self.apply_event(&event).await else { continue };
                    let Some(failover) = &failover else { continue };
                    if failover.send(request).await.is_err() {
                        warn!("failover worker is gone, dropping request");
                    }
                }
                _ = shutdown.changed() => {
                    info!("membership event loop shutting down");
                    break;
                }
            }
        }
    }

    /// Periodically run [`Self::sync_worker_metadata`] until shutdown.
    pub async fn run_worker_sync(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_worker_metadata().await {
                        warn!(error = %e, "worker metadata sync failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("worker sync loop shutting down");
                    break;
                }
            }
        }
    }

    // ── Getters ────────────────────────────────────────────────────

    pub async fn master_identities(&self) -> BTreeSet<NodeIdentity> {
        self.masters.read().await.members.clone()
    }

    pub async fn slot_assignment(&self) -> SlotAssignment {
        self.masters.read().await.slot.clone()
    }

    /// `(slot, ring_size)` for this node.
    pub async fn self_slot(&self) -> (Option<usize>, usize) {
        let view = self.masters.read().await;
        (view.slot.slot(), view.slot.ring_size())
    }

    pub async fn worker_group_members(&self, group: &str) -> BTreeSet<NodeIdentity> {
        self.worker_groups
            .read()
            .await
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn worker_groups(&self) -> BTreeMap<String, BTreeSet<NodeIdentity>> {
        self.worker_groups.read().await.clone()
    }

    pub async fn worker_metadata(&self, identity: &NodeIdentity) -> Option<ServerRecord> {
        self.worker_metadata.read().await.get(identity).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use flowgrid_registry::{MemoryRegistry, MemorySession, RegistryResult};
    use flowgrid_state::{StateStore, WorkerGroup};
    use tokio::sync::Notify;

    use super::*;

    struct Fixture {
        registry: MemoryRegistry,
        store: StateStore,
        cache: MembershipCache,
    }

    fn fixture(me: &str) -> Fixture {
        let registry = MemoryRegistry::new();
        let store = StateStore::open_in_memory().unwrap();
        let cache = MembershipCache::new(
            Arc::new(registry.connect()),
            Arc::new(store.clone()),
            RegistryPaths::new("/flowgrid"),
            me.parse().unwrap(),
        );
        Fixture {
            registry,
            store,
            cache,
        }
    }

    fn id(s: &str) -> NodeIdentity {
        s.parse().unwrap()
    }

    async fn register(session: &MemorySession, path: &str, identity: &str, node_type: NodeType) {
        let record = ServerRecord::new(id(identity), node_type, 1000);
        session
            .persist_ephemeral(path, &record.to_json().unwrap())
            .await
            .unwrap();
    }

    fn removed(path: &str) -> RegistryEvent {
        RegistryEvent {
            path: path.to_string(),
            kind: EventKind::Removed,
        }
    }

    #[tokio::test]
    async fn load_all_reads_masters_and_workers() {
        let f = fixture("b:2");
        let s = f.registry.connect();
        for m in ["c:3", "a:1", "b:2"] {
            register(&s, &format!("/flowgrid/nodes/master/{m}"), m, NodeType::Master).await;
        }
        register(&s, "/flowgrid/nodes/worker/etl/w1:10", "w1:10", NodeType::Worker).await;

        f.cache.load_all().await.unwrap();

        assert_eq!(f.cache.self_slot().await, (Some(1), 3));
        assert_eq!(f.cache.master_identities().await.len(), 3);
        assert_eq!(
            f.cache.worker_group_members("etl").await,
            [id("w1:10")].into_iter().collect()
        );
        assert!(f.cache.worker_metadata(&id("w1:10")).await.is_some());
    }

    #[tokio::test]
    async fn master_removal_recomputes_slot_and_requests_failover() {
        let f = fixture("c:3");
        let s = f.registry.connect();
        for m in ["a:1", "b:2", "c:3"] {
            register(&s, &format!("/flowgrid/nodes/master/{m}"), m, NodeType::Master).await;
        }
        f.cache.load_all().await.unwrap();
        assert_eq!(f.cache.self_slot().await, (Some(2), 3));

        s.remove("/flowgrid/nodes/master/b:2").await.unwrap();
        let request = f.cache.apply_event(&removed("/flowgrid/nodes/master/b:2")).await;

        assert_eq!(
            request,
            Some(FailoverRequest {
                node_type: NodeType::Master,
                identity: id("b:2"),
            })
        );
        assert_eq!(f.cache.self_slot().await, (Some(1), 2));
    }

    #[tokio::test]
    async fn own_removal_does_not_request_failover() {
        let f = fixture("a:1");
        let request = f.cache.apply_event(&removed("/flowgrid/nodes/master/a:1")).await;
        assert_eq!(request, None);
        assert_eq!(f.cache.self_slot().await, (None, 0));
    }

    #[tokio::test]
    async fn worker_removal_leaves_master_slots_alone() {
        let f = fixture("a:1");
        let s = f.registry.connect();
        register(&s, "/flowgrid/nodes/master/a:1", "a:1", NodeType::Master).await;
        register(&s, "/flowgrid/nodes/master/b:2", "b:2", NodeType::Master).await;
        register(&s, "/flowgrid/nodes/worker/etl/w1:10", "w1:10", NodeType::Worker).await;
        f.cache.load_all().await.unwrap();
        let before = f.cache.slot_assignment().await;

        s.remove("/flowgrid/nodes/worker/etl/w1:10").await.unwrap();
        let request = f.cache.apply_event(&removed("/flowgrid/nodes/worker/etl/w1:10")).await;

        assert_eq!(request.map(|r| r.node_type), Some(NodeType::Worker));
        assert_eq!(f.cache.slot_assignment().await, before);
        assert!(f.cache.worker_group_members("etl").await.is_empty());
        assert!(f.cache.worker_metadata(&id("w1:10")).await.is_none());
    }

    #[tokio::test]
    async fn read_failure_keeps_previous_snapshot() {
        let f = fixture("a:1");
        let s = f.registry.connect();
        register(&s, "/flowgrid/nodes/master/a:1", "a:1", NodeType::Master).await;
        register(&s, "/flowgrid/nodes/master/b:2", "b:2", NodeType::Master).await;
        f.cache.load_all().await.unwrap();

        f.registry.set_available(false);
        let request = f.cache.apply_event(&removed("/flowgrid/nodes/master/b:2")).await;

        assert!(request.is_some());
        assert_eq!(f.cache.master_identities().await.len(), 2);
        assert_eq!(f.cache.self_slot().await, (Some(0), 2));
    }

    #[tokio::test]
    async fn unresolvable_event_is_dropped() {
        let f = fixture("a:1");
        assert_eq!(f.cache.apply_event(&removed("/flowgrid/nodes/alerter/x:1")).await, None);
        assert_eq!(f.cache.apply_event(&removed("/elsewhere")).await, None);
    }

    #[tokio::test]
    async fn worker_group_sync_keeps_only_live_configured_workers() {
        let f = fixture("a:1");
        let s = f.registry.connect();
        register(&s, "/flowgrid/nodes/worker/etl/w1:10", "w1:10", NodeType::Worker).await;
        f.store
            .put_worker_group(&WorkerGroup {
                name: "etl".to_string(),
                addresses: vec!["w1:10".to_string(), "w2:11".to_string()],
            })
            .unwrap();

        f.cache.sync_worker_metadata().await.unwrap();

        assert_eq!(
            f.cache.worker_group_members("etl").await,
            [id("w1:10")].into_iter().collect()
        );
    }

    #[tokio::test]
    async fn configured_group_without_live_workers_is_empty() {
        let f = fixture("a:1");
        let s = f.registry.connect();
        register(&s, "/flowgrid/nodes/worker/default/w3:12", "w3:12", NodeType::Worker).await;
        f.store
            .put_worker_group(&WorkerGroup {
                name: "gpu".to_string(),
                addresses: vec!["w9:99".to_string()],
            })
            .unwrap();

        f.cache.sync_worker_metadata().await.unwrap();

        let groups = f.cache.worker_groups().await;
        assert!(groups["gpu"].is_empty());
        assert_eq!(groups["default"].len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_update_refreshes_metadata() {
        let f = fixture("a:1");
        let s = f.registry.connect();
        register(&s, "/flowgrid/nodes/worker/etl/w1:10", "w1:10", NodeType::Worker).await;
        f.cache.load_all().await.unwrap();

        let mut record = ServerRecord::new(id("w1:10"), NodeType::Worker, 1000);
        record.last_heartbeat_at = 5000;
        s.persist_ephemeral("/flowgrid/nodes/worker/etl/w1:10", &record.to_json().unwrap())
            .await
            .unwrap();
        let request = f
            .cache
            .apply_event(&RegistryEvent {
                path: "/flowgrid/nodes/worker/etl/w1:10".to_string(),
                kind: EventKind::Updated,
            })
            .await;

        assert!(request.is_none());
        let cached = f.cache.worker_metadata(&id("w1:10")).await.unwrap();
        assert_eq!(cached.last_heartbeat_at, 5000);
    }

    /// Holds the first read of the master root until `release` is notified.
    struct GatedRegistry {
        inner: MemorySession,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl RegistryGateway for GatedRegistry {
        async fn persist_ephemeral(&self, path: &str, value: &str) -> RegistryResult<()> {
            self.inner.persist_ephemeral(path, value).await
        }

        async fn persist(&self, path: &str, value: &str) -> RegistryResult<()> {
            self.inner.persist(path, value).await
        }

        async fn remove(&self, path: &str) -> RegistryResult<bool> {
            self.inner.remove(path).await
        }

        async fn exists(&self, path: &str) -> RegistryResult<bool> {
            self.inner.exists(path).await
        }

        async fn get_children(&self, path: &str) -> RegistryResult<BTreeSet<String>> {
            let children = self.inner.get_children(path).await?;
            if path.ends_with("/nodes/master") && self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            Ok(children)
        }

        async fn get_value(&self, path: &str) -> RegistryResult<Option<String>> {
            self.inner.get_value(path).await
        }

        async fn acquire_lock(&self, path: &str) -> RegistryResult<()> {
            self.inner.acquire_lock(path).await
        }

        async fn release_lock(&self, path: &str) -> RegistryResult<()> {
            self.inner.release_lock(path).await
        }

        async fn subscribe(&self, prefix: &str, events: mpsc::Sender<RegistryEvent>) -> RegistryResult<()> {
            self.inner.subscribe(prefix, events).await
        }
    }

    #[tokio::test]
    async fn slow_master_refresh_cannot_resurrect_removed_master() {
        let registry = MemoryRegistry::new();
        let s = registry.connect();
        register(&s, "/flowgrid/nodes/master/a:1", "a:1", NodeType::Master).await;
        register(&s, "/flowgrid/nodes/master/b:2", "b:2", NodeType::Master).await;

        let gated = Arc::new(GatedRegistry {
            inner: registry.connect(),
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let cache = Arc::new(MembershipCache::new(
            gated.clone(),
            Arc::new(StateStore::open_in_memory().unwrap()),
            RegistryPaths::new("/flowgrid"),
            id("a:1"),
        ));

        // The first refresh reads {a:1, b:2} and stalls before applying it.
        let slow = tokio::spawn({
            let cache = cache.clone();
            async move { cache.refresh_masters().await.unwrap() }
        });
        gated.entered.notified().await;

        s.remove("/flowgrid/nodes/master/b:2").await.unwrap();
        let fast = tokio::spawn({
            let cache = cache.clone();
            async move { cache.refresh_masters().await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        gated.release.notify_one();
        slow.await.unwrap();
        fast.await.unwrap();

        assert_eq!(cache.master_identities().await, [id("a:1")].into_iter().collect());
        assert_eq!(cache.self_slot().await, (Some(0), 1));
    }

    #[tokio::test]
    async fn event_loop_forwards_removals() {
        let f = fixture("a:1");
        let cache = Arc::new(f.cache);
        let (event_tx, event_rx) = mpsc::channel(8);
        let (failover_tx, mut failover_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(cache.clone().run_event_loop(event_rx, Some(failover_tx), shutdown_rx));
        event_tx.send(removed("/flowgrid/nodes/master/b:2")).await.unwrap();

        let request = tokio::time::timeout(Duration::from_secs(1), failover_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.identity, id("b:2"));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
