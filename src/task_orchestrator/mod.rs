//! TaskOrchestrator - Analysis Task Lifecycle
//!
//! ## Responsibilities
//!
//! - Explicit task state machine: created/running/stopped/completed/error
//! - Idempotent start/stop (double-clicks must not spawn duplicate execution)
//! - Per-id mutation serialization
//! - Merge of asynchronous status updates into the local cache
//!
//! The pipeline service is authoritative; this module keeps a read-mostly
//! cache current via channel updates and periodic snapshots. Merges are
//! idempotent under duplicate delivery, and a stale `running` update never
//! overwrites a locally-issued stop that the server has not confirmed yet.

mod types;

pub use types::*;

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Storage/compute collaborator executing tasks on behalf of the console
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Create a task record; returns the server-assigned id
    async fn create_task(&self, request: &CreateTaskRequest) -> Result<String>;
    async fn start_task(&self, id: &str) -> Result<()>;
    async fn stop_task(&self, id: &str) -> Result<()>;
    async fn delete_task(&self, id: &str) -> Result<()>;
    async fn list_tasks(&self) -> Result<Vec<Task>>;
}

/// TaskOrchestrator instance
pub struct TaskOrchestrator {
    executor: Arc<dyn TaskExecutor>,
    tasks: RwLock<HashMap<String, Task>>,
    /// Per-id lock so no two start/stop calls on the same id race
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    /// Locally-issued stops awaiting server confirmation (id -> stop time)
    pending_stops: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl TaskOrchestrator {
    /// Create new TaskOrchestrator
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            executor,
            tasks: RwLock::new(HashMap::new()),
            locks: RwLock::new(HashMap::new()),
            pending_stops: RwLock::new(HashMap::new()),
        }
    }

    /// Create a task; does not start execution
    pub async fn create_task(&self, request: CreateTaskRequest) -> Result<Task> {
        if request.name.trim().is_empty() {
            return Err(Error::Validation("task name must not be empty".to_string()));
        }

        let id = self.executor.create_task(&request).await?;
        let now = Utc::now();
        let task = Task {
            id: id.clone(),
            name: request.name,
            task_type: request.task_type,
            status: TaskStatus::Created,
            progress: 0,
            config: request.config,
            created_at: now,
            updated_at: now,
        };

        {
            let mut tasks = self.tasks.write().await;
            tasks.insert(id.clone(), task.clone());
        }

        tracing::info!(task_id = %id, name = %task.name, "Task created");

        Ok(task)
    }

    /// Start a task
    ///
    /// Valid from `created` or `stopped`. Starting an already-running task is
    /// a no-op success; starting a terminal task is an invalid transition.
    pub async fn start_task(&self, id: &str) -> Result<Task> {
        let _guard = self.lock_for(id).await.lock_owned().await;

        let current = self.get_task(id).await.ok_or_else(|| task_not_found(id))?;

        match current.status {
            TaskStatus::Running => {
                tracing::debug!(task_id = %id, "Task already running - start is a no-op");
                Ok(current)
            }
            TaskStatus::Created | TaskStatus::Stopped => {
                self.executor.start_task(id).await?;

                self.pending_stops.write().await.remove(id);
                let task = self
                    .set_status(id, TaskStatus::Running)
                    .await
                    .ok_or_else(|| task_not_found(id))?;

                tracing::info!(task_id = %id, from = current.status.as_str(), "Task started");
                Ok(task)
            }
            TaskStatus::Completed | TaskStatus::Error => Err(Error::InvalidTransition {
                from: current.status.as_str().to_string(),
                requested: TaskStatus::Running.as_str().to_string(),
            }),
        }
    }

    /// Stop a task
    ///
    /// Valid from `running`; stopping a non-running task is a no-op.
    pub async fn stop_task(&self, id: &str) -> Result<Task> {
        let _guard = self.lock_for(id).await.lock_owned().await;

        let current = self.get_task(id).await.ok_or_else(|| task_not_found(id))?;

        if current.status != TaskStatus::Running {
            tracing::debug!(
                task_id = %id,
                status = current.status.as_str(),
                "Task not running - stop is a no-op"
            );
            return Ok(current);
        }

        self.executor.stop_task(id).await?;

        // Guard against stale running updates until the server confirms
        self.pending_stops
            .write()
            .await
            .insert(id.to_string(), Utc::now());

        let task = self
            .set_status(id, TaskStatus::Stopped)
            .await
            .ok_or_else(|| task_not_found(id))?;

        tracing::info!(task_id = %id, "Task stopped");
        Ok(task)
    }

    /// Delete a task from any state; running tasks get an implicit stop
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let _guard = self.lock_for(id).await.lock_owned().await;

        let current = self.get_task(id).await.ok_or_else(|| task_not_found(id))?;

        if current.status == TaskStatus::Running {
            if let Err(e) = self.executor.stop_task(id).await {
                tracing::warn!(task_id = %id, error = %e, "Implicit stop before delete failed");
            }
        }

        self.executor.delete_task(id).await?;

        self.tasks.write().await.remove(id);
        self.pending_stops.write().await.remove(id);
        self.locks.write().await.remove(id);

        tracing::info!(task_id = %id, "Task deleted");
        Ok(())
    }

    /// Get one cached task
    pub async fn get_task(&self, id: &str) -> Option<Task> {
        self.tasks.read().await.get(id).cloned()
    }

    /// List cached tasks, oldest first
    pub async fn list_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    /// Merge one asynchronous update; returns the task when anything changed
    pub async fn apply_update(&self, update: TaskUpdate) -> Option<Task> {
        let pending_stop = self.pending_stops.read().await.get(&update.id).copied();

        let mut tasks = self.tasks.write().await;
        let task = match tasks.get_mut(&update.id) {
            Some(task) => task,
            None => {
                tracing::debug!(task_id = %update.id, "Update for unknown task ignored");
                return None;
            }
        };

        // A running update that predates a locally-issued stop must not
        // regress the task; the server has not seen the stop yet.
        if update.status == TaskStatus::Running {
            if let Some(stopped_at) = pending_stop {
                let effective = update.updated_at.unwrap_or_else(Utc::now);
                if effective <= stopped_at {
                    tracing::debug!(
                        task_id = %update.id,
                        "Stale running update ignored (stop pending confirmation)"
                    );
                    return None;
                }
            }
        }

        let mut changed = false;

        if task.status != update.status {
            tracing::info!(
                task_id = %update.id,
                from = task.status.as_str(),
                to = update.status.as_str(),
                "Task status changed"
            );
            task.status = update.status;
            changed = true;
        }

        let new_progress = match update.status {
            TaskStatus::Completed => Some(100),
            // Progress is monotonically non-decreasing within a run, so an
            // out-of-order update never moves it backwards
            TaskStatus::Running => update.progress.map(|p| p.max(task.progress)),
            _ => update.progress,
        };
        if let Some(progress) = new_progress {
            if task.progress != progress {
                task.progress = progress;
                changed = true;
            }
        }

        if changed {
            task.updated_at = update.updated_at.unwrap_or_else(Utc::now);
        }

        // Server state received; the pending stop is resolved either way
        if changed || update.status != TaskStatus::Running {
            drop(tasks);
            self.pending_stops.write().await.remove(&update.id);
            if changed {
                return self.get_task(&update.id).await;
            }
            return None;
        }

        None
    }

    /// Replace the cache from an authoritative snapshot; returns changed tasks
    pub async fn apply_snapshot(&self, snapshot: Vec<Task>) -> Vec<Task> {
        let pending = self.pending_stops.read().await.clone();
        let mut tasks = self.tasks.write().await;
        let mut changed = Vec::new();

        let snapshot_ids: std::collections::HashSet<String> =
            snapshot.iter().map(|t| t.id.clone()).collect();

        for incoming in snapshot {
            if incoming.status == TaskStatus::Running {
                if let Some(stopped_at) = pending.get(&incoming.id) {
                    if incoming.updated_at <= *stopped_at {
                        continue;
                    }
                }
            }

            match tasks.get(&incoming.id) {
                Some(existing)
                    if existing.status == incoming.status
                        && existing.progress == incoming.progress => {}
                _ => {
                    changed.push(incoming.clone());
                    tasks.insert(incoming.id.clone(), incoming);
                }
            }
        }

        // The snapshot is authoritative; drop records the server no longer has
        let removed: Vec<String> = tasks
            .keys()
            .filter(|id| !snapshot_ids.contains(*id))
            .cloned()
            .collect();
        for id in removed {
            tracing::debug!(task_id = %id, "Task absent from snapshot - removed");
            tasks.remove(&id);
        }

        changed
    }

    /// Refetch the authoritative task list
    pub async fn refresh(&self) -> Result<Vec<Task>> {
        let snapshot = self.executor.list_tasks().await?;
        Ok(self.apply_snapshot(snapshot).await)
    }

    /// Get or create the per-id lock
    async fn lock_for(&self, id: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(id) {
                return lock.clone();
            }
        }

        let mut locks = self.locks.write().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Update a cached task's status, returning the new value
    async fn set_status(&self, id: &str, status: TaskStatus) -> Option<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(id)?;
        task.status = status;
        task.updated_at = Utc::now();
        Some(task.clone())
    }
}

fn task_not_found(id: &str) -> Error {
    Error::NotFound(format!("task {} not found", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeExecutor {
        calls: Mutex<Vec<String>>,
        next_id: AtomicU32,
    }

    impl FakeExecutor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                next_id: AtomicU32::new(1),
            })
        }

        async fn calls(&self) -> Vec<String> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl TaskExecutor for FakeExecutor {
        async fn create_task(&self, _request: &CreateTaskRequest) -> Result<String> {
            let id = format!("task-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.calls.lock().await.push(format!("create:{}", id));
            Ok(id)
        }

        async fn start_task(&self, id: &str) -> Result<()> {
            self.calls.lock().await.push(format!("start:{}", id));
            Ok(())
        }

        async fn stop_task(&self, id: &str) -> Result<()> {
            self.calls.lock().await.push(format!("stop:{}", id));
            Ok(())
        }

        async fn delete_task(&self, id: &str) -> Result<()> {
            self.calls.lock().await.push(format!("delete:{}", id));
            Ok(())
        }

        async fn list_tasks(&self) -> Result<Vec<Task>> {
            Ok(Vec::new())
        }
    }

    fn request(name: &str) -> CreateTaskRequest {
        CreateTaskRequest {
            name: name.to_string(),
            task_type: TaskType::Realtime,
            config: serde_json::json!({}),
        }
    }

    fn snapshot_task(id: &str, status: TaskStatus, progress: u8) -> Task {
        let now = Utc::now();
        Task {
            id: id.to_string(),
            name: "snapshot".to_string(),
            task_type: TaskType::Batch,
            status,
            progress,
            config: serde_json::json!({}),
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_create_start_stop_start() {
        let orchestrator = TaskOrchestrator::new(FakeExecutor::new());

        let task = orchestrator.create_task(request("night watch")).await.unwrap();
        assert_eq!(task.status, TaskStatus::Created);
        assert_eq!(task.progress, 0);

        let task = orchestrator.start_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);

        let task = orchestrator.stop_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Stopped);

        // Restart from stopped, no intermediate error state
        let task = orchestrator.start_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_start_running_task_is_noop() {
        let executor = FakeExecutor::new();
        let orchestrator = TaskOrchestrator::new(executor.clone());

        let task = orchestrator.create_task(request("watch")).await.unwrap();
        orchestrator.start_task(&task.id).await.unwrap();

        let again = orchestrator.start_task(&task.id).await.unwrap();
        assert_eq!(again.status, TaskStatus::Running);
        assert_eq!(again.progress, 0);

        // Exactly one start reached the executor
        let starts = executor
            .calls()
            .await
            .iter()
            .filter(|c| c.starts_with("start:"))
            .count();
        assert_eq!(starts, 1);
    }

    #[tokio::test]
    async fn test_stop_non_running_is_noop() {
        let executor = FakeExecutor::new();
        let orchestrator = TaskOrchestrator::new(executor.clone());

        let task = orchestrator.create_task(request("idle")).await.unwrap();
        let stopped = orchestrator.stop_task(&task.id).await.unwrap();
        assert_eq!(stopped.status, TaskStatus::Created);
        assert!(!executor.calls().await.iter().any(|c| c.starts_with("stop:")));
    }

    #[tokio::test]
    async fn test_start_terminal_task_fails() {
        let orchestrator = TaskOrchestrator::new(FakeExecutor::new());
        orchestrator
            .apply_snapshot(vec![snapshot_task("task-done", TaskStatus::Completed, 100)])
            .await;

        let result = orchestrator.start_task("task-done").await;
        match result {
            Err(Error::InvalidTransition { from, requested }) => {
                assert_eq!(from, "completed");
                assert_eq!(requested, "running");
            }
            other => panic!("expected InvalidTransition, got {:?}", other.map(|t| t.status)),
        }
    }

    #[tokio::test]
    async fn test_unknown_id_is_not_found() {
        let orchestrator = TaskOrchestrator::new(FakeExecutor::new());
        assert!(matches!(
            orchestrator.start_task("missing").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            orchestrator.delete_task("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_running_task_stops_first() {
        let executor = FakeExecutor::new();
        let orchestrator = TaskOrchestrator::new(executor.clone());

        let task = orchestrator.create_task(request("doomed")).await.unwrap();
        orchestrator.start_task(&task.id).await.unwrap();
        orchestrator.delete_task(&task.id).await.unwrap();

        let calls = executor.calls().await;
        let stop_pos = calls.iter().position(|c| c.starts_with("stop:")).unwrap();
        let delete_pos = calls.iter().position(|c| c.starts_with("delete:")).unwrap();
        assert!(stop_pos < delete_pos);
        assert!(orchestrator.get_task(&task.id).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_running_update_does_not_regress_stop() {
        let orchestrator = TaskOrchestrator::new(FakeExecutor::new());

        let task = orchestrator.create_task(request("merge")).await.unwrap();
        orchestrator.start_task(&task.id).await.unwrap();
        orchestrator.stop_task(&task.id).await.unwrap();

        // Update that predates the stop request
        let stale = TaskUpdate {
            id: task.id.clone(),
            status: TaskStatus::Running,
            progress: Some(40),
            updated_at: Some(Utc::now() - chrono::Duration::seconds(30)),
            error: None,
        };
        assert!(orchestrator.apply_update(stale).await.is_none());
        assert_eq!(
            orchestrator.get_task(&task.id).await.unwrap().status,
            TaskStatus::Stopped
        );

        // Server state after the stop wins
        let fresh = TaskUpdate {
            id: task.id.clone(),
            status: TaskStatus::Running,
            progress: Some(41),
            updated_at: Some(Utc::now() + chrono::Duration::seconds(5)),
            error: None,
        };
        assert!(orchestrator.apply_update(fresh).await.is_some());
        assert_eq!(
            orchestrator.get_task(&task.id).await.unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn test_duplicate_update_is_idempotent() {
        let orchestrator = TaskOrchestrator::new(FakeExecutor::new());
        let task = orchestrator.create_task(request("dup")).await.unwrap();
        orchestrator.start_task(&task.id).await.unwrap();

        let update = TaskUpdate {
            id: task.id.clone(),
            status: TaskStatus::Running,
            progress: Some(55),
            updated_at: Some(Utc::now()),
            error: None,
        };

        assert!(orchestrator.apply_update(update.clone()).await.is_some());
        assert!(orchestrator.apply_update(update).await.is_none());
        assert_eq!(orchestrator.get_task(&task.id).await.unwrap().progress, 55);
    }

    #[tokio::test]
    async fn test_progress_never_regresses_while_running() {
        let orchestrator = TaskOrchestrator::new(FakeExecutor::new());
        let task = orchestrator.create_task(request("mono")).await.unwrap();
        orchestrator.start_task(&task.id).await.unwrap();

        for (progress, expected) in [(50, 50), (30, 50), (80, 80)] {
            orchestrator
                .apply_update(TaskUpdate {
                    id: task.id.clone(),
                    status: TaskStatus::Running,
                    progress: Some(progress),
                    updated_at: Some(Utc::now()),
                    error: None,
                })
                .await;
            assert_eq!(
                orchestrator.get_task(&task.id).await.unwrap().progress,
                expected
            );
        }
    }

    #[tokio::test]
    async fn test_completed_update_sets_full_progress() {
        let orchestrator = TaskOrchestrator::new(FakeExecutor::new());
        let task = orchestrator.create_task(request("finish")).await.unwrap();
        orchestrator.start_task(&task.id).await.unwrap();

        orchestrator
            .apply_update(TaskUpdate {
                id: task.id.clone(),
                status: TaskStatus::Completed,
                progress: None,
                updated_at: Some(Utc::now()),
                error: None,
            })
            .await;

        let task = orchestrator.get_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert!(task.status.is_terminal());
    }

    #[tokio::test]
    async fn test_snapshot_removes_absent_tasks() {
        let orchestrator = TaskOrchestrator::new(FakeExecutor::new());
        orchestrator
            .apply_snapshot(vec![
                snapshot_task("a", TaskStatus::Running, 10),
                snapshot_task("b", TaskStatus::Created, 0),
            ])
            .await;

        let changed = orchestrator
            .apply_snapshot(vec![snapshot_task("a", TaskStatus::Running, 20)])
            .await;

        assert_eq!(changed.len(), 1);
        assert!(orchestrator.get_task("b").await.is_none());
        assert_eq!(orchestrator.get_task("a").await.unwrap().progress, 20);
    }
}
