//! flowgrid-state — embedded work store for Flowgrid.
//!
//! Backed by [redb](https://docs.rs/redb), persists the workflow instances,
//! task instances, commands and configured worker groups that the cluster
//! coordinator reads and rewrites during failover.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Instances and commands are keyed by their numeric id; worker groups by
//! name. Host lookups are full scans, which is acceptable because they only
//! run on failover and self-heal.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
