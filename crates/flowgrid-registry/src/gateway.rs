//! The registry contract consumed by the cluster coordinator.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::RegistryResult;

/// Change observed on a watched key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Removed,
    /// The value of an existing key was rewritten (e.g. a heartbeat).
    Updated,
}

/// Notification delivered to a prefix subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEvent {
    /// Full path of the key that changed.
    pub path: String,
    pub kind: EventKind,
}

/// Operations a node performs against the coordination service.
///
/// One gateway corresponds to one registry session: ephemeral keys written
/// through it disappear when the session ends, and locks are held on
/// behalf of the session. Locks are reentrant within a session.
#[async_trait]
pub trait RegistryGateway: Send + Sync {
    /// Write a key that is removed automatically when this session ends.
    async fn persist_ephemeral(&self, path: &str, value: &str) -> RegistryResult<()>;

    /// Write a key that outlives this session.
    async fn persist(&self, path: &str, value: &str) -> RegistryResult<()>;

    /// Delete a key. Returns `true` if it existed.
    async fn remove(&self, path: &str) -> RegistryResult<bool>;

    async fn exists(&self, path: &str) -> RegistryResult<bool>;

    /// Names of the direct children of `path`.
    async fn get_children(&self, path: &str) -> RegistryResult<BTreeSet<String>>;

    async fn get_value(&self, path: &str) -> RegistryResult<Option<String>>;

    /// Block until the named lock is held by this session.
    async fn acquire_lock(&self, path: &str) -> RegistryResult<()>;

    async fn release_lock(&self, path: &str) -> RegistryResult<()>;

    /// Deliver every change under `prefix` to `events` until the receiver
    /// is dropped or the session ends.
    async fn subscribe(
        &self,
        prefix: &str,
        events: mpsc::Sender<RegistryEvent>,
    ) -> RegistryResult<()>;
}

/// Run `work` while holding the lock at `path`.
///
/// The lock is released once `work` completes, whatever it returned. If
/// `work` panics or the returned future is dropped before completion, the
/// release is spawned onto the current runtime instead. A failed release is
/// logged; the session's own teardown reclaims it.
pub async fn with_lock<G, F, T>(registry: &Arc<G>, path: &str, work: F) -> RegistryResult<T>
where
    G: RegistryGateway + ?Sized + 'static,
    F: Future<Output = T>,
{
    registry.acquire_lock(path).await?;
    let guard = LockGuard {
        registry: Some(registry.clone()),
        path: path.to_string(),
    };
    let output = work.await;
    guard.release().await;
    Ok(output)
}

/// Releases a held registry lock exactly once.
struct LockGuard<G: RegistryGateway + ?Sized + 'static> {
    registry: Option<Arc<G>>,
    path: String,
}

impl<G: RegistryGateway + ?Sized + 'static> LockGuard<G> {
    async fn release(mut self) {
        if let Some(registry) = self.registry.take() {
            release(registry, &self.path).await;
        }
    }
}

impl<G: RegistryGateway + ?Sized + 'static> Drop for LockGuard<G> {
    fn drop(&mut self) {
        let Some(registry) = self.registry.take() else {
            return;
        };
        let path = std::mem::take(&mut self.path);
        match Handle::try_current() {
            Ok(handle) => {
                warn!(lock = %path, "lock holder did not finish, releasing in background");
                handle.spawn(async move { release(registry, &path).await });
            }
            Err(_) => warn!(lock = %path, "no runtime to release registry lock"),
        }
    }
}

async fn release<G: RegistryGateway + ?Sized>(registry: Arc<G>, path: &str) {
    if let Err(e) = registry.release_lock(path).await {
        warn!(lock = %path, error = %e, "failed to release registry lock");
    }
}
