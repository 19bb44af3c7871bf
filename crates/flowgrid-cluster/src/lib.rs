//! flowgrid-cluster — leaderless cluster coordination for Flowgrid.
//!
//! Every master computes its own shard from the live master set, detects
//! peers disappearing from the registry, and takes over their in-flight
//! work. No node is elected; agreement comes from every process applying
//! the same ordering to the same eventually-consistent membership.
//!
//! # Architecture
//!
//! ```text
//! ClusterCoordinator
//!   ├── RegistrationLifecycle   (startup lock → register → reconcile → self-heal → subscribe)
//!   ├── MembershipCache         (masters + SlotAssignment, worker groups, worker metadata)
//!   │     ├── event loop        (RegistryEvent mpsc → refresh → FailoverRequest mpsc)
//!   │     └── worker sync loop  (periodic backstop against missed events)
//!   ├── FailoverCoordinator     (failover lock per node type, exactly-once takeover)
//!   └── HeartbeatPublisher      (ServerRecord refresh, NodeHealth watch channel)
//! ```

pub mod coordinator;
pub mod error;
pub mod failover;
pub mod health;
pub mod heartbeat;
pub mod lifecycle;
pub mod membership;
pub mod metrics;
pub mod slot;
pub mod work;

pub use coordinator::ClusterCoordinator;
pub use error::{ClusterError, ClusterResult};
pub use failover::{FailoverCoordinator, FailoverReport, FailoverRequest};
pub use health::{HeartbeatTracker, NodeHealth};
pub use heartbeat::HeartbeatPublisher;
pub use lifecycle::{should_self_heal, RegistrationLifecycle, SelfHealReport};
pub use membership::MembershipCache;
pub use metrics::{FixedSampler, MetricsSampler, SystemSampler};
pub use slot::{compute_slot, SlotAssignment};
pub use work::{JobKiller, NoopJobKiller, WorkStore};
