//! Core data model: tasks, workers, execution records, DLQ entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::status::TaskStatus;
use crate::retry::RetryStrategy;

/// Bounds enforced at the submit boundary
pub const MAX_NAME_LEN: usize = 255;
pub const MAX_RETRIES_CEILING: u32 = 10;
pub const MIN_TIMEOUT_SECONDS: u64 = 1;
pub const MAX_TIMEOUT_SECONDS: u64 = 3600;
pub const MIN_PRIORITY: i32 = 1;
pub const MAX_PRIORITY: i32 = 10;

/// How a child waits on its parents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// Ready when every parent completed
    #[default]
    WaitForAll,

    /// Ready when at least one parent completed
    WaitForAny,

    /// Wait-for-all with a single parent per level
    Sequential,
}

/// What a submitter provides: the work item and its policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDescriptor {
    /// Handler name (non-empty, at most 255 chars)
    pub name: String,

    /// Positional arguments, JSON-encoded at the boundary
    #[serde(default)]
    pub args: Vec<Value>,

    /// Keyword arguments
    #[serde(default)]
    pub kwargs: serde_json::Map<String, Value>,

    /// Priority in [1..10], 10 highest
    pub priority: i32,

    /// Retry ceiling in [0..10]
    pub max_retries: u32,

    pub retry_strategy: RetryStrategy,
    pub backoff_base_seconds: u64,
    pub max_backoff_seconds: u64,

    /// Per-attempt execution deadline in [1..3600]
    pub timeout_seconds: u64,

    /// Absolute release time; task stays pending until due
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,

    /// 5-field cron expression for recurring tasks
    #[serde(default)]
    pub cron_expression: Option<String>,

    #[serde(default)]
    pub is_recurring: bool,

    /// Parent task ids this task waits on (owned by the child)
    #[serde(default)]
    pub depends_on: Vec<Uuid>,

    #[serde(default)]
    pub dependency_kind: DependencyKind,

    #[serde(default)]
    pub parent_task_id: Option<Uuid>,

    #[serde(default)]
    pub workflow_id: Option<Uuid>,
}

impl TaskDescriptor {
    /// Create a descriptor with the default policies
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: vec![],
            kwargs: serde_json::Map::new(),
            priority: 5,
            max_retries: 5,
            retry_strategy: RetryStrategy::Exponential,
            backoff_base_seconds: 2,
            max_backoff_seconds: 3600,
            timeout_seconds: 300,
            scheduled_at: None,
            cron_expression: None,
            is_recurring: false,
            depends_on: vec![],
            dependency_kind: DependencyKind::WaitForAll,
            parent_task_id: None,
            workflow_id: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn with_backoff_base(mut self, seconds: u64) -> Self {
        self.backoff_base_seconds = seconds;
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_cron(mut self, expression: impl Into<String>) -> Self {
        self.cron_expression = Some(expression.into());
        self.is_recurring = true;
        self
    }

    pub fn with_depends_on(mut self, parents: Vec<Uuid>) -> Self {
        self.depends_on = parents;
        self
    }

    pub fn with_dependency_kind(mut self, kind: DependencyKind) -> Self {
        self.dependency_kind = kind;
        self
    }
}

/// A task row: descriptor plus lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub descriptor: TaskDescriptor,
    pub status: TaskStatus,

    /// Retries consumed so far; never exceeds `descriptor.max_retries`
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,

    /// COMPLETED via a false gating condition rather than execution
    pub skipped: bool,

    /// Cooperative cancellation flag; checked at handler checkpoints
    pub cancel_requested: bool,

    pub worker_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub result: Option<Value>,

    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a pending task from a descriptor
    pub fn from_descriptor(descriptor: TaskDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            descriptor,
            status: TaskStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            skipped: false,
            cancel_requested: false,
            worker_id: None,
            error_message: None,
            result: None,
            created_at: now,
            queued_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            updated_at: now,
        }
    }

    /// Attempt number of the in-flight or most recent attempt (1-based)
    pub fn attempt_number(&self) -> u32 {
        self.retry_count + 1
    }
}

/// Worker operational states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Accepts new claims
    Active,

    /// Retains assignments, no new claims
    Paused,

    /// Finishes current work, no new claims; becomes Dead at load 0
    Draining,

    /// Active with zero load
    Idle,

    /// No longer counted; its running tasks become orphans
    Dead,
}

impl WorkerState {
    /// Whether the worker may claim new tasks
    pub fn accepts_claims(&self) -> bool {
        matches!(self, WorkerState::Active | WorkerState::Idle)
    }

    /// Whether the worker counts toward liveness sweeps
    pub fn is_live(&self) -> bool {
        !matches!(self, WorkerState::Dead)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Draining => write!(f, "draining"),
            Self::Idle => write!(f, "idle"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

impl std::str::FromStr for WorkerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "draining" => Ok(Self::Draining),
            "idle" => Ok(Self::Idle),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown worker state: {other}")),
        }
    }
}

/// A registered executor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: Uuid,
    pub hostname: String,
    pub status: WorkerState,

    /// Concurrent task slots; at least 1
    pub capacity: u32,

    /// Tasks currently assigned; never exceeds capacity
    pub current_load: u32,

    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(hostname: impl Into<String>, capacity: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            hostname: hostname.into(),
            status: WorkerState::Idle,
            capacity: capacity.max(1),
            current_load: 0,
            last_heartbeat: Some(now),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One row per attempt, append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub worker_id: Option<Uuid>,
    pub attempt_number: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: DateTime<Utc>,
    pub status: TaskStatus,
    pub error_message: Option<String>,
}

/// Final-failure record retained for operators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub task_id: Uuid,
    pub reason: String,

    /// Total attempts made before dead-lettering
    pub attempts: u32,

    /// Snapshot of the original descriptor, so the task can be requeued
    pub descriptor: TaskDescriptor,

    pub dead_at: DateTime<Utc>,
}
