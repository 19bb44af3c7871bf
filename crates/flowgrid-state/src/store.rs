//! StateStore — redb-backed work persistence for Flowgrid.
//!
//! Provides typed CRUD over workflow instances, task instances, commands
//! and worker groups, plus the conditional updates a failover pass relies
//! on. All values are JSON-serialized into redb's `&[u8]` value columns.
//! The store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type IdTable = TableDefinition<'static, u64, &'static [u8]>;

/// Thread-safe work store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(WORKFLOW_INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(TASK_INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(COMMANDS).map_err(map_err!(Table))?;
        txn.open_table(WORKER_GROUPS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Workflow instances ─────────────────────────────────────────

    /// Insert or update a workflow instance.
    pub fn put_workflow_instance(&self, instance: &WorkflowInstance) -> StateResult<()> {
        self.put_record(WORKFLOW_INSTANCES, instance.id, instance)?;
        debug!(id = instance.id, "workflow instance stored");
        Ok(())
    }

    pub fn get_workflow_instance(&self, id: WorkflowInstanceId) -> StateResult<Option<WorkflowInstance>> {
        self.get_record(WORKFLOW_INSTANCES, id)
    }

    pub fn list_workflow_instances(&self) -> StateResult<Vec<WorkflowInstance>> {
        self.scan_records(WORKFLOW_INSTANCES)
    }

    /// In-flight workflow instances still owned by `host`.
    pub fn in_flight_workflows_by_host(&self, host: &str) -> StateResult<Vec<WorkflowInstance>> {
        Ok(self
            .list_workflow_instances()?
            .into_iter()
            .filter(|w| w.state.is_in_flight() && w.host.as_deref() == Some(host))
            .collect())
    }

    /// Distinct hosts that still own at least one in-flight workflow instance.
    pub fn in_flight_workflow_hosts(&self) -> StateResult<BTreeSet<String>> {
        Ok(self
            .list_workflow_instances()?
            .into_iter()
            .filter(|w| w.state.is_in_flight())
            .filter_map(|w| w.host)
            .collect())
    }

    /// Release a workflow instance from its master and queue a recovery
    /// command, in one transaction.
    ///
    /// The update only applies if the stored record is still in flight and
    /// still owned by `instance.host`; otherwise another pass already moved
    /// it and `None` is returned.
    pub fn clear_workflow_host_and_enqueue_command(
        &self,
        instance: &WorkflowInstance,
    ) -> StateResult<Option<CommandId>> {
        let Some(expected_host) = instance.host.as_deref() else {
            return Ok(None);
        };

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let command_id;
        {
            let mut workflows = txn.open_table(WORKFLOW_INSTANCES).map_err(map_err!(Table))?;
            let current: Option<WorkflowInstance> =
                match workflows.get(instance.id).map_err(map_err!(Read))? {
                    Some(guard) => {
                        Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                    }
                    None => None,
                };

            let mut current = match current {
                Some(w) if w.state.is_in_flight() && w.host.as_deref() == Some(expected_host) => w,
                _ => return Ok(None),
            };
            current.host = None;
            let value = serde_json::to_vec(&current).map_err(map_err!(Serialize))?;
            workflows
                .insert(current.id, value.as_slice())
                .map_err(map_err!(Write))?;

            let mut commands = txn.open_table(COMMANDS).map_err(map_err!(Table))?;
            command_id = match commands.last().map_err(map_err!(Read))? {
                Some((key, _)) => key.value() + 1,
                None => 1,
            };
            let command = Command {
                id: command_id,
                command_type: CommandType::RecoverToleranceFaultProcess,
                workflow_instance_id: current.id,
                created_at: epoch_millis(),
            };
            let value = serde_json::to_vec(&command).map_err(map_err!(Serialize))?;
            commands
                .insert(command_id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(workflow_instance_id = instance.id, command_id, "workflow released for recovery");
        Ok(Some(command_id))
    }

    // ── Task instances ─────────────────────────────────────────────

    /// Insert or update a task instance.
    pub fn put_task_instance(&self, instance: &TaskInstance) -> StateResult<()> {
        self.put_record(TASK_INSTANCES, instance.id, instance)
    }

    pub fn get_task_instance(&self, id: TaskInstanceId) -> StateResult<Option<TaskInstance>> {
        self.get_record(TASK_INSTANCES, id)
    }

    pub fn list_task_instances(&self) -> StateResult<Vec<TaskInstance>> {
        self.scan_records(TASK_INSTANCES)
    }

    /// In-flight task instances executing on `host`.
    pub fn in_flight_tasks_by_host(&self, host: &str) -> StateResult<Vec<TaskInstance>> {
        Ok(self
            .list_task_instances()?
            .into_iter()
            .filter(|t| t.state.is_in_flight() && t.host.as_deref() == Some(host))
            .collect())
    }

    /// Distinct hosts with at least one in-flight task instance.
    pub fn in_flight_task_hosts(&self) -> StateResult<BTreeSet<String>> {
        Ok(self
            .list_task_instances()?
            .into_iter()
            .filter(|t| t.state.is_in_flight())
            .filter_map(|t| t.host)
            .collect())
    }

    /// Flag an in-flight task for fault-tolerant re-execution.
    ///
    /// Returns `false` if the task is gone or no longer in flight.
    pub fn mark_task_needs_fault_tolerance(&self, id: TaskInstanceId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut tasks = txn.open_table(TASK_INSTANCES).map_err(map_err!(Table))?;
            let current: Option<TaskInstance> = match tasks.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };

            let mut task = match current {
                Some(t) if t.state.is_in_flight() => t,
                _ => return Ok(false),
            };
            task.state = TaskState::NeedFaultTolerance;
            task.ended_at = Some(epoch_millis());
            let value = serde_json::to_vec(&task).map_err(map_err!(Serialize))?;
            tasks.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(task_instance_id = id, "task marked for fault tolerance");
        Ok(true)
    }

    // ── Commands ───────────────────────────────────────────────────

    pub fn list_commands(&self) -> StateResult<Vec<Command>> {
        self.scan_records(COMMANDS)
    }

    // ── Worker groups ──────────────────────────────────────────────

    /// Insert or update a worker group.
    pub fn put_worker_group(&self, group: &WorkerGroup) -> StateResult<()> {
        let value = serde_json::to_vec(group).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WORKER_GROUPS).map_err(map_err!(Table))?;
            table
                .insert(group.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(group = %group.name, "worker group stored");
        Ok(())
    }

    pub fn list_worker_groups(&self) -> StateResult<Vec<WorkerGroup>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKER_GROUPS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let group: WorkerGroup =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(group);
        }
        Ok(results)
    }

    /// Delete a worker group by name. Returns true if it existed.
    pub fn delete_worker_group(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(WORKER_GROUPS).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn put_record<T: Serialize>(&self, def: IdTable, id: u64, record: &T) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table.insert(id, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_record<T: DeserializeOwned>(&self, def: IdTable, id: u64) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn scan_records<T: DeserializeOwned>(&self, def: IdTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_workflow(id: u64, host: Option<&str>, state: WorkflowState) -> WorkflowInstance {
        WorkflowInstance {
            id,
            name: format!("wf-{id}"),
            state,
            host: host.map(str::to_string),
            started_at: 1000,
            restarted_at: None,
        }
    }

    fn test_task(id: u64, host: Option<&str>, state: TaskState) -> TaskInstance {
        TaskInstance {
            id,
            workflow_instance_id: 1,
            name: format!("task-{id}"),
            task_type: "SHELL".to_string(),
            state,
            host: host.map(str::to_string),
            started_at: Some(1000),
            ended_at: None,
            external_job_ids: Vec::new(),
        }
    }

    // ── Workflow instances ─────────────────────────────────────────

    #[test]
    fn workflow_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let wf = test_workflow(7, Some("m1:5678"), WorkflowState::RunningExecution);

        store.put_workflow_instance(&wf).unwrap();
        assert_eq!(store.get_workflow_instance(7).unwrap(), Some(wf));
        assert!(store.get_workflow_instance(8).unwrap().is_none());
    }

    #[test]
    fn in_flight_workflows_filter_by_host_and_state() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_workflow_instance(&test_workflow(1, Some("m1:5678"), WorkflowState::RunningExecution))
            .unwrap();
        store
            .put_workflow_instance(&test_workflow(2, Some("m1:5678"), WorkflowState::Success))
            .unwrap();
        store
            .put_workflow_instance(&test_workflow(3, Some("m2:5678"), WorkflowState::ReadyStop))
            .unwrap();
        store
            .put_workflow_instance(&test_workflow(4, None, WorkflowState::RunningExecution))
            .unwrap();

        let owned = store.in_flight_workflows_by_host("m1:5678").unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id, 1);

        let hosts = store.in_flight_workflow_hosts().unwrap();
        assert_eq!(hosts.into_iter().collect::<Vec<_>>(), vec!["m1:5678", "m2:5678"]);
    }

    #[test]
    fn clear_host_enqueues_one_command() {
        let store = StateStore::open_in_memory().unwrap();
        let wf = test_workflow(1, Some("m1:5678"), WorkflowState::RunningExecution);
        store.put_workflow_instance(&wf).unwrap();

        let first = store.clear_workflow_host_and_enqueue_command(&wf).unwrap();
        assert_eq!(first, Some(1));
        assert_eq!(store.get_workflow_instance(1).unwrap().unwrap().host, None);

        // Replaying with the stale reference must not queue a second command.
        let second = store.clear_workflow_host_and_enqueue_command(&wf).unwrap();
        assert_eq!(second, None);

        let commands = store.list_commands().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].workflow_instance_id, 1);
        assert_eq!(commands[0].command_type, CommandType::RecoverToleranceFaultProcess);
    }

    #[test]
    fn clear_host_skips_instance_moved_to_other_master() {
        let store = StateStore::open_in_memory().unwrap();
        let stale = test_workflow(1, Some("m1:5678"), WorkflowState::RunningExecution);
        let moved = test_workflow(1, Some("m2:5678"), WorkflowState::RunningExecution);
        store.put_workflow_instance(&moved).unwrap();

        assert_eq!(store.clear_workflow_host_and_enqueue_command(&stale).unwrap(), None);
        assert_eq!(
            store.get_workflow_instance(1).unwrap().unwrap().host.as_deref(),
            Some("m2:5678")
        );
        assert!(store.list_commands().unwrap().is_empty());
    }

    #[test]
    fn command_ids_increase() {
        let store = StateStore::open_in_memory().unwrap();
        for id in 1..=3 {
            let wf = test_workflow(id, Some("m1:5678"), WorkflowState::RunningExecution);
            store.put_workflow_instance(&wf).unwrap();
            assert_eq!(store.clear_workflow_host_and_enqueue_command(&wf).unwrap(), Some(id));
        }
    }

    // ── Task instances ─────────────────────────────────────────────

    #[test]
    fn mark_task_needs_fault_tolerance_once() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_task_instance(&test_task(10, Some("w1:10"), TaskState::RunningExecution))
            .unwrap();

        assert!(store.mark_task_needs_fault_tolerance(10).unwrap());
        let task = store.get_task_instance(10).unwrap().unwrap();
        assert_eq!(task.state, TaskState::NeedFaultTolerance);
        assert!(task.ended_at.is_some());

        assert!(!store.mark_task_needs_fault_tolerance(10).unwrap());
        assert!(!store.mark_task_needs_fault_tolerance(99).unwrap());
    }

    #[test]
    fn in_flight_tasks_filter_by_host_and_state() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_task_instance(&test_task(1, Some("w1:10"), TaskState::Dispatch))
            .unwrap();
        store
            .put_task_instance(&test_task(2, Some("w1:10"), TaskState::Success))
            .unwrap();
        store
            .put_task_instance(&test_task(3, Some("w2:11"), TaskState::RunningExecution))
            .unwrap();

        let on_w1 = store.in_flight_tasks_by_host("w1:10").unwrap();
        assert_eq!(on_w1.len(), 1);
        assert_eq!(on_w1[0].id, 1);
        assert_eq!(store.in_flight_task_hosts().unwrap().len(), 2);
    }

    // ── Worker groups ──────────────────────────────────────────────

    #[test]
    fn worker_group_crud() {
        let store = StateStore::open_in_memory().unwrap();
        let group = WorkerGroup {
            name: "etl".to_string(),
            addresses: vec!["w1:10".to_string(), "w2:11".to_string()],
        };

        store.put_worker_group(&group).unwrap();
        assert_eq!(store.list_worker_groups().unwrap(), vec![group]);

        assert!(store.delete_worker_group("etl").unwrap());
        assert!(!store.delete_worker_group("etl").unwrap());
        assert!(store.list_worker_groups().unwrap().is_empty());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .put_workflow_instance(&test_workflow(1, Some("m1:5678"), WorkflowState::RunningExecution))
                .unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let wf = store.get_workflow_instance(1).unwrap();
        assert!(wf.is_some());
        assert_eq!(wf.unwrap().name, "wf-1");
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_workflow_instances().unwrap().is_empty());
        assert!(store.list_task_instances().unwrap().is_empty());
        assert!(store.list_commands().unwrap().is_empty());
        assert!(store.in_flight_workflow_hosts().unwrap().is_empty());
        assert!(store.in_flight_tasks_by_host("any:1").unwrap().is_empty());
    }
}
