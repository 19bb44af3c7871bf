//! Domain types for the Flowgrid work store.
//!
//! These are the records a failover pass inspects and rewrites. Only the
//! `host` and `state` fields are touched by the cluster coordinator; the
//! rest of each record's lifecycle belongs to the scheduler.

use serde::{Deserialize, Serialize};

pub type WorkflowInstanceId = u64;
pub type TaskInstanceId = u64;
pub type CommandId = u64;

// ── Workflow instance ─────────────────────────────────────────────

/// A running (or finished) execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowInstance {
    pub id: WorkflowInstanceId,
    pub name: String,
    pub state: WorkflowState,
    /// `host:port` of the master driving this instance. `None` once the
    /// instance has been released for another master to pick up.
    pub host: Option<String>,
    /// Unix timestamp (millis) of the first start.
    pub started_at: u64,
    /// Unix timestamp (millis) of the latest restart, if any.
    pub restarted_at: Option<u64>,
}

impl WorkflowInstance {
    /// The time this instance was last (re)started by a master.
    pub fn last_started_at(&self) -> u64 {
        self.restarted_at.unwrap_or(self.started_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowState {
    SubmittedSuccess,
    RunningExecution,
    SerialWait,
    ReadyPause,
    Pause,
    ReadyStop,
    Stop,
    Failure,
    Success,
}

impl WorkflowState {
    /// Whether a master is still expected to be driving this instance.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            WorkflowState::SubmittedSuccess
                | WorkflowState::RunningExecution
                | WorkflowState::SerialWait
                | WorkflowState::ReadyPause
                | WorkflowState::ReadyStop
        )
    }
}

// ── Task instance ─────────────────────────────────────────────────

/// A single task execution dispatched to a worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInstance {
    pub id: TaskInstanceId,
    pub workflow_instance_id: WorkflowInstanceId,
    pub name: String,
    pub task_type: String,
    pub state: TaskState,
    /// `host:port` of the worker executing this task.
    pub host: Option<String>,
    /// Unix timestamp (millis) when the worker started the task.
    pub started_at: Option<u64>,
    pub ended_at: Option<u64>,
    /// Ids of jobs the task spawned on external systems (e.g. YARN
    /// applications) that must be killed before the task is retried.
    pub external_job_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    SubmittedSuccess,
    Dispatch,
    RunningExecution,
    DelayExecution,
    ReadyPause,
    Pause,
    ReadyStop,
    Stop,
    Kill,
    Failure,
    Success,
    NeedFaultTolerance,
}

impl TaskState {
    /// Whether a worker is still expected to be executing this task.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TaskState::SubmittedSuccess
                | TaskState::Dispatch
                | TaskState::RunningExecution
                | TaskState::DelayExecution
                | TaskState::ReadyPause
                | TaskState::ReadyStop
        )
    }
}

// ── Command ───────────────────────────────────────────────────────

/// Work item the scheduler's command loop consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Command {
    pub id: CommandId,
    pub command_type: CommandType,
    pub workflow_instance_id: WorkflowInstanceId,
    /// Unix timestamp (millis).
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Resume a workflow instance whose master died.
    RecoverToleranceFaultProcess,
}

// ── Worker group ──────────────────────────────────────────────────

/// Operator-configured worker group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerGroup {
    pub name: String,
    /// Worker addresses (`host:port`) that belong to this group.
    pub addresses: Vec<String>,
}
