//! Task manager: the active/inactive partition
//!
//! An identifier is either active (a `Task` lives in the registry, a worker
//! may be driving it) or inactive (only the durable record exists). The
//! manager owns the boundary: activation reconstitutes a task from its
//! stored record, deactivation drops the in-memory task after its final
//! status is flushed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{ManagerConfig, TaskOptions};
use crate::engine::DownloadEngine;
use crate::error::{Result, TaskError};
use crate::ident::TaskId;
use crate::state::{TaskInfo, TaskState, TaskStatus};
use crate::store::TaskStore;
use crate::task::Task;

/// Active tasks, kept as two lockstep views: the id set answers membership
/// without touching the map, and both are mutated only together.
#[derive(Default)]
struct Registry {
    tasks: HashMap<TaskId, Arc<Task>>,
    ids: HashSet<TaskId>,
}

impl Registry {
    fn insert(&mut self, task: Arc<Task>) {
        self.ids.insert(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
        debug_assert_eq!(self.tasks.len(), self.ids.len());
    }

    fn remove(&mut self, id: &TaskId) -> Option<Arc<Task>> {
        self.ids.remove(id);
        let task = self.tasks.remove(id);
        debug_assert_eq!(self.tasks.len(), self.ids.len());
        task
    }

    fn get(&self, id: &TaskId) -> Option<Arc<Task>> {
        self.tasks.get(id).cloned()
    }
}

type ActivationGate = Arc<tokio::sync::Mutex<()>>;

pub struct TaskManager {
    store: Arc<dyn TaskStore>,
    engine: Arc<dyn DownloadEngine>,
    config: ManagerConfig,
    registry: RwLock<Registry>,
    /// Per-identifier gates serializing activation, so concurrent starts of
    /// the same identifier construct exactly one task
    activations: tokio::sync::Mutex<HashMap<TaskId, ActivationGate>>,
}

impl TaskManager {
    pub fn new(
        store: Arc<dyn TaskStore>,
        engine: Arc<dyn DownloadEngine>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            store,
            engine,
            config,
            registry: RwLock::new(Registry::default()),
            activations: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Register a URL and return its identifier.
    ///
    /// Idempotent: re-submitting a known URL returns the same identifier and
    /// leaves the existing record untouched.
    pub async fn new_task(&self, url: &str, options: &TaskOptions) -> Result<TaskId> {
        if url.trim().is_empty() {
            return Err(TaskError::invalid_input("empty URL"));
        }
        let id = self.store.create_task(url, options).await?;
        tracing::info!(task = %id.short(), url, "task registered");
        Ok(id)
    }

    /// Activate and start the task for `id`.
    ///
    /// `ignore_state` starts the task even when its stored status is
    /// terminal, resuming from the preserved offset. `first_run` goes
    /// further and resets the stored status to a fresh Created before
    /// starting. Returns the active task handle; concurrent calls for the
    /// same identifier all receive the same handle.
    pub async fn start_task(
        &self,
        id: &TaskId,
        ignore_state: bool,
        first_run: bool,
    ) -> Result<Arc<Task>> {
        // fast path: already active
        let existing = self.registry.read().get(id);
        if let Some(task) = existing {
            return self.start_active(task, first_run).await;
        }

        let gate = self.activation_gate(id).await;
        let _guard = gate.lock().await;

        // re-check under the gate; another caller may have activated it
        let existing = self.registry.read().get(id);
        if let Some(task) = existing {
            return self.start_active(task, first_run).await;
        }

        let result = self.activate(id, ignore_state, first_run).await;
        if result.is_err() {
            // no task was registered, so nothing will deactivate this gate
            self.activations.lock().await.remove(id);
        }
        result
    }

    /// Reconstitute and start a task from its stored record. Caller must
    /// hold the identifier's activation gate.
    async fn activate(
        &self,
        id: &TaskId,
        ignore_state: bool,
        first_run: bool,
    ) -> Result<Arc<Task>> {
        let url = self.store.get_url(id).await?;
        let options = self.store.get_options(id).await?;
        let info = self.store.get_info(id).await?;
        let mut status = self.store.get_status(id).await?;

        if first_run {
            status = TaskStatus::new();
            self.store.put_status(id, &status).await?;
        } else if status.state == TaskState::Running {
            // stale Running from an unclean shutdown; no worker exists
            status.mark_paused();
        } else if status.state.is_terminal() && !status.state.can_start() {
            // Finished and Halted records stay at rest unless the caller
            // explicitly bypasses them
            if !ignore_state {
                return Err(TaskError::invalid_state(format!(
                    "task {} already ended in state {:?}",
                    id, status.state
                )));
            }
            status.revive();
        }

        let resolved = self.config.defaults.merged(&options);
        let task = Task::new(
            id.clone(),
            url,
            resolved,
            info,
            status,
            Arc::clone(&self.store),
            Arc::clone(&self.engine),
            self.config.flush_interval(),
        );

        self.registry.write().insert(Arc::clone(&task));
        if let Err(e) = task.start().await {
            self.registry.write().remove(id);
            return Err(e);
        }
        Ok(task)
    }

    async fn start_active(&self, task: Arc<Task>, first_run: bool) -> Result<Arc<Task>> {
        if first_run {
            return Err(TaskError::task_running(&task.id));
        }
        task.start().await?;
        Ok(task)
    }

    /// Suspend a running task, preserving its offset for resume.
    pub async fn pause_task(&self, id: &TaskId) -> Result<()> {
        let Some(task) = self.registry.read().get(id) else {
            return Err(TaskError::task_existence(id));
        };
        task.pause().await
    }

    /// Stop a task for good and deactivate it.
    ///
    /// Halting an identifier that is not active is not an error; the stored
    /// record is already at rest.
    pub async fn halt_task(&self, id: &TaskId) -> Result<()> {
        let Some(task) = self.registry.read().get(id) else {
            tracing::debug!(task = %id.short(), "halt on inactive task, ignoring");
            return Ok(());
        };
        task.halt().await?;
        self.deactivate(id).await;
        Ok(())
    }

    /// Mark a task finished and deactivate it.
    pub async fn finish_task(&self, id: &TaskId) -> Result<()> {
        let Some(task) = self.registry.read().get(id) else {
            return Err(TaskError::task_existence(id));
        };
        task.finish().await?;
        self.deactivate(id).await;
        Ok(())
    }

    /// Status for any known identifier: live in-memory status for active
    /// tasks, the stored snapshot otherwise.
    pub async fn task_status(&self, id: &TaskId) -> Result<TaskStatus> {
        if let Some(task) = self.registry.read().get(id) {
            return Ok(task.status());
        }
        self.store.get_status(id).await
    }

    /// Resource metadata for any known identifier.
    pub async fn task_info(&self, id: &TaskId) -> Result<TaskInfo> {
        if let Some(task) = self.registry.read().get(id) {
            return Ok(task.info());
        }
        self.store.get_info(id).await
    }

    /// All known tasks with their current status.
    pub async fn list_tasks(&self) -> Result<Vec<(TaskId, TaskStatus)>> {
        let mut out = Vec::new();
        for id in self.store.list_ids().await? {
            let status = self.task_status(&id).await?;
            out.push((id, status));
        }
        Ok(out)
    }

    /// Identifiers currently in the active registry.
    pub fn active_ids(&self) -> Vec<TaskId> {
        self.registry.read().ids.iter().cloned().collect()
    }

    async fn activation_gate(&self, id: &TaskId) -> ActivationGate {
        let mut gates = self.activations.lock().await;
        Arc::clone(gates.entry(id.clone()).or_default())
    }

    /// Remove the in-memory task and its activation gate. Called only after
    /// the task's final status has been flushed.
    async fn deactivate(&self, id: &TaskId) {
        self.registry.write().remove(id);
        self.activations.lock().await.remove(id);
    }
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("engine", &self.engine.name())
            .field("active", &self.registry.read().ids.len())
            .finish()
    }
}
