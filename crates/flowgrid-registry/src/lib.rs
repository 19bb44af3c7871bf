//! flowgrid-registry — the coordination service seen by Flowgrid nodes.
//!
//! Nodes never talk to each other directly. Liveness, failover mutual
//! exclusion and membership notifications all go through a linearizable
//! registry offering ephemeral keys, named locks and prefix watches. This
//! crate defines that contract ([`RegistryGateway`]), the key layout every
//! node agrees on ([`RegistryPaths`]), and an in-process implementation
//! ([`MemoryRegistry`]) used by the standalone daemon and by tests.
//!
//! # Architecture
//!
//! ```text
//! MemoryRegistry (shared state, one per cluster)
//!   ├── connect() → MemorySession   (one per node, implements RegistryGateway)
//!   │     ├── ephemeral keys owned by the session
//!   │     ├── reentrant locks held by the session
//!   │     └── subscriptions: prefix → mpsc::Sender<RegistryEvent>
//!   └── close(session) → removes its ephemeral keys, emits Removed
//! ```

pub mod error;
pub mod gateway;
pub mod memory;
pub mod paths;

pub use error::{RegistryError, RegistryResult};
pub use gateway::{with_lock, EventKind, RegistryEvent, RegistryGateway};
pub use memory::{MemoryRegistry, MemorySession};
pub use paths::{NodePath, RegistryPaths};
