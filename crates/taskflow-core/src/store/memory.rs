//! In-memory implementation of TaskStore
//!
//! Primarily for tests and single-process deployments. Provides the same
//! conditional-transition semantics as the PostgreSQL implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::breaker::CircuitState;
use crate::task::{
    is_valid_transition, DlqEntry, ExecutionRecord, Task, TaskStatus, WorkerRecord, WorkerState,
};

/// In-memory implementation of TaskStore
///
/// # Example
///
/// ```
/// use taskflow_core::store::MemoryStore;
///
/// let store = MemoryStore::new();
/// ```
pub struct MemoryStore {
    tasks: RwLock<HashMap<Uuid, Task>>,
    executions: RwLock<Vec<ExecutionRecord>>,
    workers: RwLock<HashMap<Uuid, WorkerRecord>>,
    dlq: RwLock<Vec<DlqEntry>>,
    breakers: RwLock<HashMap<String, BreakerRow>>,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            executions: RwLock::new(Vec::new()),
            workers: RwLock::new(HashMap::new()),
            dlq: RwLock::new(Vec::new()),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Number of tasks in any status
    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// Number of DLQ entries
    pub fn dlq_count(&self) -> usize {
        self.dlq.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.tasks.write().clear();
        self.executions.write().clear();
        self.workers.write().clear();
        self.dlq.write().clear();
        self.breakers.write().clear();
    }

    fn apply_change(task: &mut Task, change: &StatusChange, now: DateTime<Utc>) {
        task.status = change.target();
        task.updated_at = now;

        match change {
            StatusChange::Queued => {
                task.queued_at = Some(now);
                task.worker_id = None;
                task.next_retry_at = None;
            }
            StatusChange::Running { worker_id } => {
                task.started_at = Some(now);
                task.worker_id = Some(*worker_id);
            }
            StatusChange::Completed { result } => {
                task.completed_at = Some(now);
                task.result = result.clone();
            }
            StatusChange::Failed { error } | StatusChange::TimedOut { error } => {
                task.failed_at = Some(now);
                task.error_message = Some(error.clone());
            }
            StatusChange::Retrying { next_retry_at } => {
                task.retry_count += 1;
                task.next_retry_at = Some(*next_retry_at);
            }
            StatusChange::Cancelled => {
                task.completed_at = Some(now);
            }
        }
    }

    /// Whether the change ends an in-flight attempt and must be recorded
    fn ends_attempt(prior: TaskStatus, change: &StatusChange) -> bool {
        match change {
            StatusChange::Completed { .. }
            | StatusChange::Failed { .. }
            | StatusChange::TimedOut { .. } => true,
            StatusChange::Cancelled => prior == TaskStatus::Running,
            _ => false,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        self.tasks.write().insert(task.id, task.clone());
        Ok(())
    }

    async fn insert_workflow(&self, tasks: &[Task]) -> Result<(), StoreError> {
        let mut map = self.tasks.write();
        for task in tasks {
            map.insert(task.id, task.clone());
        }
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        self.tasks
            .read()
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    async fn transition(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        change: StatusChange,
    ) -> Result<Task, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        let target = change.target();
        if task.status != expected || !is_valid_transition(expected, target) {
            return Err(StoreError::InvalidTransition {
                task_id,
                from: task.status,
                to: target,
            });
        }

        let prior = task.status;
        Self::apply_change(task, &change, now);

        if Self::ends_attempt(prior, &change) {
            self.executions.write().push(ExecutionRecord {
                id: Uuid::now_v7(),
                task_id,
                worker_id: task.worker_id,
                attempt_number: task.attempt_number(),
                started_at: task.started_at,
                completed_at: now,
                status: task.status,
                error_message: task.error_message.clone(),
            });
        }

        Ok(task.clone())
    }

    async fn propagate_failure(&self, task_id: Uuid, error: String) -> Result<Task, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Pending {
            return Err(StoreError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Failed,
            });
        }

        task.status = TaskStatus::Failed;
        task.error_message = Some(error);
        task.failed_at = Some(now);
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn skip(&self, task_id: Uuid) -> Result<Task, StoreError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status != TaskStatus::Pending {
            return Err(StoreError::InvalidTransition {
                task_id,
                from: task.status,
                to: TaskStatus::Completed,
            });
        }

        task.status = TaskStatus::Completed;
        task.skipped = true;
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(task.clone())
    }

    async fn request_cancel(&self, task_id: Uuid) -> Result<Task, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        task.cancel_requested = true;
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn list_tasks(
        &self,
        filter: TaskFilter,
        pagination: Pagination,
    ) -> Result<Vec<Task>, StoreError> {
        let tasks = self.tasks.read();
        let mut matched: Vec<Task> = tasks
            .values()
            .filter(|t| {
                filter.status.is_none_or(|s| t.status == s)
                    && filter.priority.is_none_or(|p| t.descriptor.priority == p)
                    && filter.worker_id.is_none_or(|w| t.worker_id == Some(w))
                    && filter
                        .workflow_id
                        .is_none_or(|w| t.descriptor.workflow_id == Some(w))
                    && filter
                        .name
                        .as_deref()
                        .is_none_or(|n| t.descriptor.name == n)
            })
            .cloned()
            .collect();

        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(matched
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending
                    && t.descriptor.scheduled_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect())
    }

    async fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| {
                t.status == TaskStatus::Retrying && t.next_retry_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect())
    }

    async fn running_tasks_for_worker(&self, worker_id: Uuid) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Running && t.worker_id == Some(worker_id))
            .cloned()
            .collect())
    }

    async fn stale_running(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<Task>, StoreError> {
        let grace = chrono::Duration::from_std(grace).unwrap_or_default();
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| {
                t.status == TaskStatus::Running
                    && t.started_at.is_some_and(|started| {
                        started
                            + chrono::Duration::seconds(t.descriptor.timeout_seconds as i64)
                            + grace
                            < now
                    })
            })
            .cloned()
            .collect())
    }

    async fn pending_children_of(&self, parent_id: Uuid) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| {
                t.status == TaskStatus::Pending && t.descriptor.depends_on.contains(&parent_id)
            })
            .cloned()
            .collect())
    }

    async fn list_executions(&self, task_id: Uuid) -> Result<Vec<ExecutionRecord>, StoreError> {
        Ok(self
            .executions
            .read()
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect())
    }

    async fn insert_worker(&self, worker: &WorkerRecord) -> Result<(), StoreError> {
        self.workers.write().insert(worker.id, worker.clone());
        Ok(())
    }

    async fn get_worker(&self, worker_id: Uuid) -> Result<WorkerRecord, StoreError> {
        self.workers
            .read()
            .get(&worker_id)
            .cloned()
            .ok_or(StoreError::WorkerNotFound(worker_id))
    }

    async fn worker_heartbeat(
        &self,
        worker_id: Uuid,
        current_load: u32,
    ) -> Result<WorkerRecord, StoreError> {
        let now = Utc::now();
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(&worker_id)
            .ok_or(StoreError::WorkerNotFound(worker_id))?;

        worker.last_heartbeat = Some(now);
        worker.current_load = current_load.min(worker.capacity);
        worker.updated_at = now;
        Ok(worker.clone())
    }

    async fn set_worker_status(
        &self,
        worker_id: Uuid,
        status: WorkerState,
    ) -> Result<WorkerRecord, StoreError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(&worker_id)
            .ok_or(StoreError::WorkerNotFound(worker_id))?;

        worker.status = status;
        worker.updated_at = Utc::now();
        Ok(worker.clone())
    }

    async fn set_worker_capacity(
        &self,
        worker_id: Uuid,
        capacity: u32,
    ) -> Result<WorkerRecord, StoreError> {
        let mut workers = self.workers.write();
        let worker = workers
            .get_mut(&worker_id)
            .ok_or(StoreError::WorkerNotFound(worker_id))?;

        worker.capacity = capacity.max(1);
        worker.updated_at = Utc::now();
        Ok(worker.clone())
    }

    async fn list_workers(&self, filter: WorkerFilter) -> Result<Vec<WorkerRecord>, StoreError> {
        Ok(self
            .workers
            .read()
            .values()
            .filter(|w| filter.status.is_none_or(|s| w.status == s))
            .cloned()
            .collect())
    }

    async fn expired_workers(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkerRecord>, StoreError> {
        Ok(self
            .workers
            .read()
            .values()
            .filter(|w| {
                matches!(
                    w.status,
                    WorkerState::Active | WorkerState::Idle | WorkerState::Draining
                ) && match w.last_heartbeat {
                    Some(hb) => hb < cutoff,
                    None => w.created_at < cutoff,
                }
            })
            .cloned()
            .collect())
    }

    async fn insert_dlq(&self, entry: &DlqEntry) -> Result<(), StoreError> {
        self.dlq.write().push(entry.clone());
        Ok(())
    }

    async fn list_dlq(&self, pagination: Pagination) -> Result<Vec<DlqEntry>, StoreError> {
        Ok(self
            .dlq
            .read()
            .iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .cloned()
            .collect())
    }

    async fn get_dlq(&self, task_id: Uuid) -> Result<DlqEntry, StoreError> {
        self.dlq
            .read()
            .iter()
            .find(|e| e.task_id == task_id)
            .cloned()
            .ok_or(StoreError::DlqEntryNotFound(task_id))
    }

    async fn remove_dlq(&self, task_id: Uuid) -> Result<DlqEntry, StoreError> {
        let mut dlq = self.dlq.write();
        let pos = dlq
            .iter()
            .position(|e| e.task_id == task_id)
            .ok_or(StoreError::DlqEntryNotFound(task_id))?;
        Ok(dlq.remove(pos))
    }

    async fn get_breaker(&self, name: &str) -> Result<Option<BreakerRow>, StoreError> {
        Ok(self.breakers.read().get(name).cloned())
    }

    async fn put_breaker(&self, row: &BreakerRow) -> Result<(), StoreError> {
        self.breakers.write().insert(row.name.clone(), row.clone());
        Ok(())
    }

    async fn claim_probe(&self, name: &str, recovery: Duration) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut breakers = self.breakers.write();
        let Some(row) = breakers.get_mut(name) else {
            return Ok(false);
        };

        if row.state != CircuitState::Open {
            return Ok(false);
        }
        let elapsed = row
            .opened_at
            .map(|at| now.signed_duration_since(at).to_std().unwrap_or_default())
            .unwrap_or_default();
        if elapsed < recovery {
            return Ok(false);
        }

        row.state = CircuitState::HalfOpen;
        row.probe_in_flight = true;
        row.updated_at = now;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskDescriptor;

    fn pending_task() -> Task {
        Task::from_descriptor(TaskDescriptor::new("test_task"))
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryStore::new();
        let task = pending_task();

        store.insert_task(&task).await.unwrap();
        let fetched = store.get_task(task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_legal_transition_chain() {
        let store = MemoryStore::new();
        let task = pending_task();
        store.insert_task(&task).await.unwrap();

        let worker_id = Uuid::now_v7();
        store
            .transition(task.id, TaskStatus::Pending, StatusChange::Queued)
            .await
            .unwrap();
        let running = store
            .transition(task.id, TaskStatus::Queued, StatusChange::Running { worker_id })
            .await
            .unwrap();
        assert!(running.started_at.is_some());
        assert_eq!(running.worker_id, Some(worker_id));

        let done = store
            .transition(
                task.id,
                TaskStatus::Running,
                StatusChange::Completed {
                    result: Some(serde_json::json!({"ok": true})),
                },
            )
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(done.completed_at.unwrap() >= done.started_at.unwrap());
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let store = MemoryStore::new();
        let task = pending_task();
        store.insert_task(&task).await.unwrap();

        let err = store
            .transition(
                task.id,
                TaskStatus::Pending,
                StatusChange::Running {
                    worker_id: Uuid::now_v7(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        // State unchanged
        let fetched = store.get_task(task.id).await.unwrap();
        assert_eq!(fetched.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_stale_expectation_rejected() {
        let store = MemoryStore::new();
        let task = pending_task();
        store.insert_task(&task).await.unwrap();

        store
            .transition(task.id, TaskStatus::Pending, StatusChange::Queued)
            .await
            .unwrap();

        // A second writer still believing the task is pending loses
        let err = store
            .transition(task.id, TaskStatus::Pending, StatusChange::Queued)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_execution_record_appended_per_attempt() {
        let store = MemoryStore::new();
        let task = pending_task();
        store.insert_task(&task).await.unwrap();
        let worker_id = Uuid::now_v7();

        store
            .transition(task.id, TaskStatus::Pending, StatusChange::Queued)
            .await
            .unwrap();
        store
            .transition(task.id, TaskStatus::Queued, StatusChange::Running { worker_id })
            .await
            .unwrap();
        store
            .transition(
                task.id,
                TaskStatus::Running,
                StatusChange::Failed {
                    error: "boom".into(),
                },
            )
            .await
            .unwrap();

        let records = store.list_executions(task.id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].attempt_number, 1);
        assert_eq!(records[0].status, TaskStatus::Failed);
        assert_eq!(records[0].error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_retry_increments_count_once() {
        let store = MemoryStore::new();
        let task = pending_task();
        store.insert_task(&task).await.unwrap();

        store
            .transition(task.id, TaskStatus::Pending, StatusChange::Queued)
            .await
            .unwrap();
        store
            .transition(
                task.id,
                TaskStatus::Queued,
                StatusChange::Running {
                    worker_id: Uuid::now_v7(),
                },
            )
            .await
            .unwrap();
        store
            .transition(
                task.id,
                TaskStatus::Running,
                StatusChange::Failed {
                    error: "transient".into(),
                },
            )
            .await
            .unwrap();

        let retried = store
            .transition(
                task.id,
                TaskStatus::Failed,
                StatusChange::Retrying {
                    next_retry_at: Utc::now(),
                },
            )
            .await
            .unwrap();
        assert_eq!(retried.retry_count, 1);

        // Requeue clears the worker and the retry timestamp
        let requeued = store
            .transition(task.id, TaskStatus::Retrying, StatusChange::Queued)
            .await
            .unwrap();
        assert_eq!(requeued.retry_count, 1);
        assert!(requeued.worker_id.is_none());
        assert!(requeued.next_retry_at.is_none());
    }

    #[tokio::test]
    async fn test_propagate_failure_only_from_pending() {
        let store = MemoryStore::new();
        let task = pending_task();
        store.insert_task(&task).await.unwrap();

        let failed = store
            .propagate_failure(task.id, "Parent task x failed".into())
            .await
            .unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert!(failed.failed_at.is_some());

        // Second propagation loses
        assert!(store
            .propagate_failure(task.id, "again".into())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_skip_marks_completed_with_flag() {
        let store = MemoryStore::new();
        let task = pending_task();
        store.insert_task(&task).await.unwrap();

        let skipped = store.skip(task.id).await.unwrap();
        assert_eq!(skipped.status, TaskStatus::Completed);
        assert!(skipped.skipped);
        assert!(skipped.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_due_queries() {
        let store = MemoryStore::new();

        let due = Task::from_descriptor(
            TaskDescriptor::new("due").with_scheduled_at(Utc::now() - chrono::Duration::seconds(5)),
        );
        let later = Task::from_descriptor(
            TaskDescriptor::new("later")
                .with_scheduled_at(Utc::now() + chrono::Duration::seconds(3600)),
        );

        store.insert_task(&due).await.unwrap();
        store.insert_task(&later).await.unwrap();

        let found = store.due_scheduled(Utc::now()).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    #[tokio::test]
    async fn test_worker_registry() {
        let store = MemoryStore::new();
        let worker = WorkerRecord::new("host-1", 4);
        store.insert_worker(&worker).await.unwrap();

        let beat = store.worker_heartbeat(worker.id, 2).await.unwrap();
        assert_eq!(beat.current_load, 2);

        let paused = store
            .set_worker_status(worker.id, WorkerState::Paused)
            .await
            .unwrap();
        assert_eq!(paused.status, WorkerState::Paused);

        // Load is clamped to capacity
        let beat = store.worker_heartbeat(worker.id, 99).await.unwrap();
        assert_eq!(beat.current_load, 4);
    }

    #[tokio::test]
    async fn test_expired_workers() {
        let store = MemoryStore::new();
        let mut stale = WorkerRecord::new("stale", 1);
        stale.status = WorkerState::Active;
        stale.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(120));
        let fresh = WorkerRecord::new("fresh", 1);

        store.insert_worker(&stale).await.unwrap();
        store.insert_worker(&fresh).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::seconds(30);
        let expired = store.expired_workers(cutoff).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, stale.id);
    }

    #[tokio::test]
    async fn test_dlq_ordering_and_removal() {
        let store = MemoryStore::new();
        let first = pending_task();
        let second = pending_task();

        for task in [&first, &second] {
            store
                .insert_dlq(&DlqEntry {
                    task_id: task.id,
                    reason: "failed".into(),
                    attempts: 1,
                    descriptor: task.descriptor.clone(),
                    dead_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let entries = store.list_dlq(Pagination::default()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].task_id, first.id);

        let removed = store.remove_dlq(first.id).await.unwrap();
        assert_eq!(removed.task_id, first.id);
        assert_eq!(store.dlq_count(), 1);
    }

    #[tokio::test]
    async fn test_claim_probe_single_winner() {
        let store = MemoryStore::new();
        let mut row = BreakerRow::closed("external-api");
        row.state = CircuitState::Open;
        row.opened_at = Some(Utc::now() - chrono::Duration::seconds(120));
        store.put_breaker(&row).await.unwrap();

        let recovery = Duration::from_secs(60);
        assert!(store.claim_probe("external-api", recovery).await.unwrap());
        // Second claim sees HALF_OPEN with the probe already in flight
        assert!(!store.claim_probe("external-api", recovery).await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_probe_respects_recovery_timeout() {
        let store = MemoryStore::new();
        let mut row = BreakerRow::closed("db");
        row.state = CircuitState::Open;
        row.opened_at = Some(Utc::now());
        store.put_breaker(&row).await.unwrap();

        assert!(!store
            .claim_probe("db", Duration::from_secs(60))
            .await
            .unwrap());
    }
}
