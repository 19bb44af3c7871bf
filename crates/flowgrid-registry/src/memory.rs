//! In-process registry with session-scoped ephemeral keys.
//!
//! `MemoryRegistry` holds the shared key space. Each node connects with its
//! own `MemorySession`, which owns the ephemeral keys and locks it creates.
//! Closing a session behaves like a registry session expiring: its
//! ephemeral keys are deleted (subscribers see `Removed`) and its locks are
//! released.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info};

use crate::error::{RegistryError, RegistryResult};
use crate::gateway::{EventKind, RegistryEvent, RegistryGateway};

type SessionId = u64;

struct Entry {
    value: String,
    /// Owning session for ephemeral keys; `None` for persistent keys.
    owner: Option<SessionId>,
}

struct LockHolder {
    session: SessionId,
    depth: u32,
}

struct Subscriber {
    session: SessionId,
    prefix: String,
    sender: mpsc::Sender<RegistryEvent>,
}

#[derive(Default)]
struct RegistryState {
    entries: BTreeMap<String, Entry>,
    locks: HashMap<String, LockHolder>,
    subscribers: Vec<Subscriber>,
}

impl RegistryState {
    /// Senders interested in a change to `path`.
    fn route(&mut self, path: &str, kind: EventKind) -> Vec<(mpsc::Sender<RegistryEvent>, RegistryEvent)> {
        self.subscribers.retain(|s| !s.sender.is_closed());
        self.subscribers
            .iter()
            .filter(|s| covers(&s.prefix, path))
            .map(|s| {
                (
                    s.sender.clone(),
                    RegistryEvent {
                        path: path.to_string(),
                        kind,
                    },
                )
            })
            .collect()
    }
}

fn covers(prefix: &str, path: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

struct Shared {
    state: Mutex<RegistryState>,
    lock_released: Notify,
    available: AtomicBool,
    next_session: AtomicU64,
}

/// Shared in-memory key space. Cheap to clone.
#[derive(Clone)]
pub struct MemoryRegistry {
    shared: Arc<Shared>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(RegistryState::default()),
                lock_released: Notify::new(),
                available: AtomicBool::new(true),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new session against this registry.
    pub fn connect(&self) -> MemorySession {
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "registry session opened");
        MemorySession {
            id,
            shared: self.shared.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate a registry outage: while unavailable every call from every
    /// session fails with [`RegistryError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
        info!(available, "registry availability changed");
    }

    /// All keys currently stored, in path order.
    pub async fn keys(&self) -> Vec<String> {
        let state = self.shared.state.lock().await;
        state.entries.keys().cloned().collect()
    }
}

/// One node's connection to a [`MemoryRegistry`].
pub struct MemorySession {
    id: SessionId,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl MemorySession {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn check(&self) -> RegistryResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RegistryError::SessionClosed(self.id));
        }
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable);
        }
        Ok(())
    }

    async fn write(&self, path: &str, value: &str, owner: Option<SessionId>) -> RegistryResult<()> {
        self.check()?;
        let deliveries = {
            let mut state = self.shared.state.lock().await;
            let previous = state.entries.insert(
                path.to_string(),
                Entry {
                    value: value.to_string(),
                    owner,
                },
            );
            let kind = if previous.is_some() {
                EventKind::Updated
            } else {
                EventKind::Added
            };
            state.route(path, kind)
        };
        deliver(deliveries).await;
        Ok(())
    }

    /// End the session. Ephemeral keys it owns are removed, its locks are
    /// released and its subscriptions are dropped. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let deliveries = {
            let mut state = self.shared.state.lock().await;
            let owned: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.owner == Some(self.id))
                .map(|(path, _)| path.clone())
                .collect();
            for path in &owned {
                state.entries.remove(path);
            }
            state.locks.retain(|_, holder| holder.session != self.id);
            state.subscribers.retain(|s| s.session != self.id);

            let mut deliveries = Vec::new();
            for path in &owned {
                deliveries.extend(state.route(path, EventKind::Removed));
            }
            deliveries
        };
        self.shared.lock_released.notify_waiters();
        deliver(deliveries).await;
        debug!(session = self.id, "registry session closed");
    }
}

async fn deliver(deliveries: Vec<(mpsc::Sender<RegistryEvent>, RegistryEvent)>) {
    for (sender, event) in deliveries {
        // A dropped receiver just means the subscriber went away.
        let _ = sender.send(event).await;
    }
}

#[async_trait]
impl RegistryGateway for MemorySession {
    async fn persist_ephemeral(&self, path: &str, value: &str) -> RegistryResult<()> {
        self.write(path, value, Some(self.id)).await
    }

    async fn persist(&self, path: &str, value: &str) -> RegistryResult<()> {
        self.write(path, value, None).await
    }

    async fn remove(&self, path: &str) -> RegistryResult<bool> {
        self.check()?;
        let deliveries = {
            let mut state = self.shared.state.lock().await;
            if state.entries.remove(path).is_none() {
                return Ok(false);
            }
            state.route(path, EventKind::Removed)
        };
        deliver(deliveries).await;
        Ok(true)
    }

    async fn exists(&self, path: &str) -> RegistryResult<bool> {
        self.check()?;
        let state = self.shared.state.lock().await;
        Ok(state.entries.contains_key(path))
    }

    async fn get_children(&self, path: &str) -> RegistryResult<BTreeSet<String>> {
        self.check()?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let state = self.shared.state.lock().await;
        let children = state
            .entries
            .range(prefix.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&prefix))
            .filter_map(|key| key[prefix.len()..].split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        Ok(children)
    }

    async fn get_value(&self, path: &str) -> RegistryResult<Option<String>> {
        self.check()?;
        let state = self.shared.state.lock().await;
        Ok(state.entries.get(path).map(|e| e.value.clone()))
    }

    async fn acquire_lock(&self, path: &str) -> RegistryResult<()> {
        loop {
            self.check()?;
            // Register for wakeups before inspecting the holder so a release
            // between the check and the await is not missed.
            let released = self.shared.lock_released.notified();
            {
                let mut state = self.shared.state.lock().await;
                match state.locks.get_mut(path) {
                    None => {
                        state.locks.insert(
                            path.to_string(),
                            LockHolder {
                                session: self.id,
                                depth: 1,
                            },
                        );
                        debug!(session = self.id, lock = %path, "lock acquired");
                        return Ok(());
                    }
                    Some(holder) if holder.session == self.id => {
                        holder.depth += 1;
                        return Ok(());
                    }
                    Some(_) => {}
                }
            }
            released.await;
        }
    }

    async fn release_lock(&self, path: &str) -> RegistryResult<()> {
        self.check()?;
        {
            let mut state = self.shared.state.lock().await;
            let holder = match state.locks.get_mut(path) {
                Some(holder) if holder.session == self.id => holder,
                _ => return Err(RegistryError::LockNotHeld(path.to_string())),
            };
            holder.depth -= 1;
            if holder.depth > 0 {
                return Ok(());
            }
            state.locks.remove(path);
        }
        debug!(session = self.id, lock = %path, "lock released");
        self.shared.lock_released.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        prefix: &str,
        events: mpsc::Sender<RegistryEvent>,
    ) -> RegistryResult<()> {
        self.check()?;
        let mut state = self.shared.state.lock().await;
        state.subscribers.push(Subscriber {
            session: self.id,
            prefix: prefix.trim_end_matches('/').to_string(),
            sender: events,
        });
        Ok(())
    }
}
