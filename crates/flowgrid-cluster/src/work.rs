//! Collaborators the failover path reads and rewrites work through.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tracing::debug;

use flowgrid_core::NodeType;
use flowgrid_state::{StateStore, TaskInstance, WorkerGroup, WorkflowInstance};

use crate::error::ClusterResult;

/// Narrow view of work persistence used by membership and failover.
///
/// Only the `host` and `state` fields of instances are ever changed through
/// this interface.
pub trait WorkStore: Send + Sync {
    fn query_in_flight_task_instances_by_host(&self, host: &str) -> ClusterResult<Vec<TaskInstance>>;

    fn query_in_flight_workflow_instances_by_host(
        &self,
        host: &str,
    ) -> ClusterResult<Vec<WorkflowInstance>>;

    /// Returns `false` if the task was already moved out of flight.
    fn mark_task_needs_fault_tolerance(&self, task: &TaskInstance) -> ClusterResult<bool>;

    /// Returns `false` if the instance no longer belongs to `workflow.host`.
    fn clear_workflow_host_and_enqueue_command(
        &self,
        workflow: &WorkflowInstance,
    ) -> ClusterResult<bool>;

    fn list_configured_worker_groups(&self) -> ClusterResult<Vec<WorkerGroup>>;

    /// Hosts that still own in-flight work of the given node type.
    fn in_flight_hosts(&self, node_type: NodeType) -> ClusterResult<BTreeSet<String>>;
}

impl WorkStore for StateStore {
    fn query_in_flight_task_instances_by_host(&self, host: &str) -> ClusterResult<Vec<TaskInstance>> {
        Ok(self.in_flight_tasks_by_host(host)?)
    }

    fn query_in_flight_workflow_instances_by_host(
        &self,
        host: &str,
    ) -> ClusterResult<Vec<WorkflowInstance>> {
        Ok(self.in_flight_workflows_by_host(host)?)
    }

    fn mark_task_needs_fault_tolerance(&self, task: &TaskInstance) -> ClusterResult<bool> {
        Ok(StateStore::mark_task_needs_fault_tolerance(self, task.id)?)
    }

    fn clear_workflow_host_and_enqueue_command(
        &self,
        workflow: &WorkflowInstance,
    ) -> ClusterResult<bool> {
        Ok(StateStore::clear_workflow_host_and_enqueue_command(self, workflow)?.is_some())
    }

    fn list_configured_worker_groups(&self) -> ClusterResult<Vec<WorkerGroup>> {
        Ok(self.list_worker_groups()?)
    }

    fn in_flight_hosts(&self, node_type: NodeType) -> ClusterResult<BTreeSet<String>> {
        match node_type {
            NodeType::Master => Ok(self.in_flight_workflow_hosts()?),
            NodeType::Worker => Ok(self.in_flight_task_hosts()?),
        }
    }
}

/// Best-effort terminator for jobs a task launched on external systems.
#[async_trait]
pub trait JobKiller: Send + Sync {
    async fn kill(&self, task: &TaskInstance) -> anyhow::Result<()>;
}

/// Job killer for deployments without external job systems.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopJobKiller;

#[async_trait]
impl JobKiller for NoopJobKiller {
    async fn kill(&self, task: &TaskInstance) -> anyhow::Result<()> {
        debug!(task_instance_id = task.id, jobs = ?task.external_job_ids, "no job killer configured");
        Ok(())
    }
}
