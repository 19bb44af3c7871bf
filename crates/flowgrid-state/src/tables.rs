//! redb table definitions for the Flowgrid work store.
//!
//! Values are JSON-serialized domain types.

use redb::TableDefinition;

/// Workflow instances keyed by instance id.
pub const WORKFLOW_INSTANCES: TableDefinition<u64, &[u8]> =
    TableDefinition::new("workflow_instances");

/// Task instances keyed by instance id.
pub const TASK_INSTANCES: TableDefinition<u64, &[u8]> = TableDefinition::new("task_instances");

/// Scheduler commands keyed by a monotonically increasing id.
pub const COMMANDS: TableDefinition<u64, &[u8]> = TableDefinition::new("commands");

/// Operator-configured worker groups keyed by group name.
pub const WORKER_GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("worker_groups");
