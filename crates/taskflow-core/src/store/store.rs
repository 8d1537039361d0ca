//! TaskStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::breaker::CircuitState;
use crate::task::{DlqEntry, ExecutionRecord, Task, TaskStatus, WorkerRecord, WorkerState};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Worker not found
    #[error("worker not found: {0}")]
    WorkerNotFound(Uuid),

    /// DLQ entry not found
    #[error("dlq entry not found: {0}")]
    DlqEntryNotFound(Uuid),

    /// Transition rejected: either outside the legal table or the row's
    /// current status no longer matches what the caller observed
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Database error; retryable from the caller's view
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A lifecycle change applied under a conditional update
///
/// The store writes the timestamps implied by the change and appends an
/// execution record when an attempt ended, all in one transaction.
#[derive(Debug, Clone)]
pub enum StatusChange {
    /// Released into a priority queue
    Queued,

    /// Claimed by a worker; starts the attempt clock
    Running { worker_id: Uuid },

    /// Attempt finished successfully
    Completed { result: Option<Value> },

    /// Attempt raised an error
    Failed { error: String },

    /// Attempt exceeded its deadline
    TimedOut { error: String },

    /// Failure routed to a later retry
    Retrying { next_retry_at: DateTime<Utc> },

    /// Cancelled by an authorized caller
    Cancelled,
}

impl StatusChange {
    /// The status this change transitions into
    pub fn target(&self) -> TaskStatus {
        match self {
            StatusChange::Queued => TaskStatus::Queued,
            StatusChange::Running { .. } => TaskStatus::Running,
            StatusChange::Completed { .. } => TaskStatus::Completed,
            StatusChange::Failed { .. } => TaskStatus::Failed,
            StatusChange::TimedOut { .. } => TaskStatus::Timeout,
            StatusChange::Retrying { .. } => TaskStatus::Retrying,
            StatusChange::Cancelled => TaskStatus::Cancelled,
        }
    }
}

/// Filter for listing tasks
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub priority: Option<i32>,
    pub worker_id: Option<Uuid>,
    pub workflow_id: Option<Uuid>,
    pub name: Option<String>,
}

impl TaskFilter {
    pub fn by_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn by_workflow(workflow_id: Uuid) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            ..Default::default()
        }
    }
}

/// Filter for listing workers
#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub status: Option<WorkerState>,
}

impl WorkerFilter {
    pub fn by_status(status: WorkerState) -> Self {
        Self {
            status: Some(status),
        }
    }
}

/// Pagination parameters
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Shared circuit breaker state row
#[derive(Debug, Clone)]
pub struct BreakerRow {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,

    /// A half-open probe has been claimed and is in flight
    pub probe_in_flight: bool,

    pub updated_at: DateTime<Utc>,
}

impl BreakerRow {
    pub fn closed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            probe_in_flight: false,
            updated_at: Utc::now(),
        }
    }
}

/// Authoritative store of long-lived state
///
/// Implementations must be thread-safe and support concurrent access. All
/// lifecycle changes go through [`TaskStore::transition`], which enforces the
/// legal transition table under a conditional update: concurrent writers lose
/// predictably and must re-read.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Persist a new pending task
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Persist a workflow's tasks atomically: all rows or none
    async fn insert_workflow(&self, tasks: &[Task]) -> Result<(), StoreError>;

    /// Read a task
    async fn get_task(&self, task_id: Uuid) -> Result<Task, StoreError>;

    /// Apply a lifecycle change, conditional on the observed prior status
    ///
    /// In one transaction: updates the row, writes the timestamps implied by
    /// the change, and appends an execution record if an attempt ended.
    async fn transition(
        &self,
        task_id: Uuid,
        expected: TaskStatus,
        change: StatusChange,
    ) -> Result<Task, StoreError>;

    /// Workflow edge: fail a pending child whose required parents failed
    ///
    /// Conditional on the task still being PENDING. No execution record is
    /// appended; the task never ran.
    async fn propagate_failure(&self, task_id: Uuid, error: String) -> Result<Task, StoreError>;

    /// Workflow edge: skip a pending child whose gating condition is false
    ///
    /// The task becomes COMPLETED with the skipped flag; dependents observe it
    /// as satisfied. Conditional on the task still being PENDING.
    async fn skip(&self, task_id: Uuid) -> Result<Task, StoreError>;

    /// Set the cooperative cancellation flag on a running task
    async fn request_cancel(&self, task_id: Uuid) -> Result<Task, StoreError>;

    /// List tasks matching a filter, newest first
    async fn list_tasks(
        &self,
        filter: TaskFilter,
        pagination: Pagination,
    ) -> Result<Vec<Task>, StoreError>;

    /// Pending tasks whose scheduled time has arrived
    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError>;

    /// Retrying tasks whose next-retry time has arrived
    async fn due_retries(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError>;

    /// Running tasks assigned to the given worker
    async fn running_tasks_for_worker(&self, worker_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Running tasks whose attempt deadline (started-at + timeout + grace)
    /// has passed without an ack
    async fn stale_running(
        &self,
        now: DateTime<Utc>,
        grace: Duration,
    ) -> Result<Vec<Task>, StoreError>;

    /// Pending tasks that list the given task among their parents
    async fn pending_children_of(&self, parent_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Append-only attempt history for a task, oldest first
    async fn list_executions(&self, task_id: Uuid) -> Result<Vec<ExecutionRecord>, StoreError>;

    // =========================================================================
    // Worker Registry Operations
    // =========================================================================

    /// Register a worker
    async fn insert_worker(&self, worker: &WorkerRecord) -> Result<(), StoreError>;

    /// Read a worker
    async fn get_worker(&self, worker_id: Uuid) -> Result<WorkerRecord, StoreError>;

    /// Record a heartbeat and the reported load
    async fn worker_heartbeat(
        &self,
        worker_id: Uuid,
        current_load: u32,
    ) -> Result<WorkerRecord, StoreError>;

    /// Set a worker's operational state
    async fn set_worker_status(
        &self,
        worker_id: Uuid,
        status: WorkerState,
    ) -> Result<WorkerRecord, StoreError>;

    /// Update a worker's capacity (at least 1)
    async fn set_worker_capacity(
        &self,
        worker_id: Uuid,
        capacity: u32,
    ) -> Result<WorkerRecord, StoreError>;

    /// List workers matching a filter
    async fn list_workers(&self, filter: WorkerFilter) -> Result<Vec<WorkerRecord>, StoreError>;

    /// Live workers whose last heartbeat is older than the cutoff
    async fn expired_workers(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkerRecord>, StoreError>;

    // =========================================================================
    // Dead Letter Queue Operations
    // =========================================================================

    /// Record a terminal failure; entries only accumulate
    async fn insert_dlq(&self, entry: &DlqEntry) -> Result<(), StoreError>;

    /// List DLQ entries in insertion order
    async fn list_dlq(&self, pagination: Pagination) -> Result<Vec<DlqEntry>, StoreError>;

    /// Read a DLQ entry by original task id
    async fn get_dlq(&self, task_id: Uuid) -> Result<DlqEntry, StoreError>;

    /// Explicitly remove an entry (operator requeue or discard)
    async fn remove_dlq(&self, task_id: Uuid) -> Result<DlqEntry, StoreError>;

    // =========================================================================
    // Circuit Breaker Operations
    // =========================================================================

    /// Read shared breaker state for a named dependency
    async fn get_breaker(&self, name: &str) -> Result<Option<BreakerRow>, StoreError>;

    /// Upsert shared breaker state
    async fn put_breaker(&self, row: &BreakerRow) -> Result<(), StoreError>;

    /// Atomically claim the single half-open probe
    ///
    /// Succeeds when the breaker is OPEN and the recovery timeout has elapsed,
    /// moving it to HALF_OPEN with the probe marked in flight. Exactly one
    /// caller wins; everyone else keeps failing fast.
    async fn claim_probe(&self, name: &str, recovery: Duration) -> Result<bool, StoreError>;
}
