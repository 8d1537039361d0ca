//! Queue broker: the shared fast fabric in front of the store
//!
//! This module provides:
//! - [`Broker`] trait - priority queues, scheduled set, metadata mirror,
//!   DLQ mirror, completion/alert pub/sub, rate limits, worker flags
//! - [`MemoryBroker`] - the in-process fabric implementation
//!
//! The broker owns ephemeral queue membership only. It never transitions
//! task state; the store is the single source of truth, and everything held
//! here can be rebuilt from it.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::breaker::DegradationStrategy;
use crate::events::{AlertEvent, CompletionEvent};
use crate::task::{DlqEntry, Task};
use crate::workflow::{WorkflowMeta, WorkflowTemplate};

pub use memory::MemoryBroker;

/// Error type for broker operations
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The shared fabric is unreachable; retryable
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Priority band backing one FIFO queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityBand {
    /// Priorities 8-10
    High,

    /// Priorities 4-7
    Medium,

    /// Priorities 1-3
    Low,
}

impl PriorityBand {
    /// Claim order: HIGH before MEDIUM before LOW
    pub const ALL: [PriorityBand; 3] = [
        PriorityBand::High,
        PriorityBand::Medium,
        PriorityBand::Low,
    ];

    /// Band for a priority value; out-of-range values land in MEDIUM
    pub fn for_priority(priority: i32) -> Self {
        match priority {
            8..=10 => PriorityBand::High,
            4..=7 => PriorityBand::Medium,
            1..=3 => PriorityBand::Low,
            _ => PriorityBand::Medium,
        }
    }
}

impl std::fmt::Display for PriorityBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

/// The subset of task fields workers read without a store round-trip
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMeta {
    pub name: String,
    pub priority: i32,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl From<&Task> for TaskMeta {
    fn from(task: &Task) -> Self {
        Self {
            name: task.descriptor.name.clone(),
            priority: task.descriptor.priority,
            timeout_seconds: task.descriptor.timeout_seconds,
            max_retries: task.descriptor.max_retries,
        }
    }
}

/// Per-worker runtime overrides, readable before each claim
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkerRuntimeConfig {
    pub capacity: Option<u32>,
    pub timeout_seconds: Option<u64>,
}

/// Pause/drain flags mirrored for fast reads
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WorkerFlags {
    pub paused: bool,
    pub draining: bool,
}

/// Queue depths per band, for operators and tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl QueueDepths {
    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }
}

/// Shared key-value fabric holding the queues, scheduled set, claim support
/// structures, and the pub/sub channels
///
/// Implementations must be thread-safe. Queues tolerate duplicate deliveries;
/// idempotency is enforced by the store's conditional transitions.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    // =========================================================================
    // Priority Queues
    // =========================================================================

    /// Right-push a task id onto the band for its priority
    async fn enqueue(&self, task_id: Uuid, priority: i32) -> Result<PriorityBand, BrokerError>;

    /// Left-pop the next task id, scanning the given bands in order and
    /// blocking up to `timeout` across all of them
    async fn dequeue(
        &self,
        bands: &[PriorityBand],
        timeout: Duration,
    ) -> Result<Option<Uuid>, BrokerError>;

    /// Remove a task id from whichever queue holds it (cancellation path)
    async fn remove(&self, task_id: Uuid) -> Result<bool, BrokerError>;

    /// Current queue depths
    async fn depths(&self) -> Result<QueueDepths, BrokerError>;

    // =========================================================================
    // Scheduled Set
    // =========================================================================

    /// Add a task to the scheduled set, ordered by due time
    async fn schedule(&self, task_id: Uuid, due: DateTime<Utc>) -> Result<(), BrokerError>;

    /// Task ids whose due time has arrived, oldest first
    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, BrokerError>;

    /// Remove a task from the scheduled set
    async fn unschedule(&self, task_id: Uuid) -> Result<bool, BrokerError>;

    // =========================================================================
    // Task Metadata Mirror
    // =========================================================================

    async fn put_task_meta(&self, task_id: Uuid, meta: TaskMeta) -> Result<(), BrokerError>;

    async fn task_meta(&self, task_id: Uuid) -> Result<Option<TaskMeta>, BrokerError>;

    async fn clear_task_meta(&self, task_id: Uuid) -> Result<(), BrokerError>;

    // =========================================================================
    // Dead Letter Mirror
    // =========================================================================

    /// Append to the DLQ ordered set; entries only accumulate
    async fn push_dlq(&self, entry: &DlqEntry) -> Result<(), BrokerError>;

    /// List mirrored DLQ entries in insertion order
    async fn list_dlq(&self) -> Result<Vec<DlqEntry>, BrokerError>;

    /// Explicit removal on operator requeue or discard
    async fn remove_dlq(&self, task_id: Uuid) -> Result<bool, BrokerError>;

    // =========================================================================
    // Pub/Sub Channels
    // =========================================================================

    /// Publish a completion event; best-effort
    async fn publish_completion(&self, event: CompletionEvent) -> Result<(), BrokerError>;

    /// Subscribe to completion events
    fn subscribe_completions(&self) -> broadcast::Receiver<CompletionEvent>;

    /// Publish an alert event; best-effort
    async fn publish_alert(&self, event: AlertEvent) -> Result<(), BrokerError>;

    /// Subscribe to alert events
    fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent>;

    // =========================================================================
    // Rate Limiting
    // =========================================================================

    /// Count a hit against a windowed per-resource limit
    ///
    /// Returns false when the limit for the current window is exhausted.
    async fn check_rate_limit(
        &self,
        resource: &str,
        limit: u32,
        window: Duration,
    ) -> Result<bool, BrokerError>;

    // =========================================================================
    // Worker State Keys
    // =========================================================================

    async fn set_worker_flags(&self, worker_id: Uuid, flags: WorkerFlags)
        -> Result<(), BrokerError>;

    async fn worker_flags(&self, worker_id: Uuid) -> Result<WorkerFlags, BrokerError>;

    async fn clear_worker_state(&self, worker_id: Uuid) -> Result<(), BrokerError>;

    async fn set_worker_config(
        &self,
        worker_id: Uuid,
        config: WorkerRuntimeConfig,
    ) -> Result<(), BrokerError>;

    async fn worker_config(&self, worker_id: Uuid) -> Result<WorkerRuntimeConfig, BrokerError>;

    // =========================================================================
    // Degradation Signals
    // =========================================================================

    /// Flag a dependency as degraded for `ttl`
    async fn mark_degraded(
        &self,
        dependency: &str,
        strategy: DegradationStrategy,
        ttl: Duration,
    ) -> Result<(), BrokerError>;

    /// Active degradation strategy for a dependency, if any
    async fn degradation(&self, dependency: &str)
        -> Result<Option<DegradationStrategy>, BrokerError>;

    async fn clear_degraded(&self, dependency: &str) -> Result<(), BrokerError>;

    /// Install a tasks-per-minute admission cap for `ttl`
    async fn set_throughput_cap(&self, per_minute: u32, ttl: Duration) -> Result<(), BrokerError>;

    /// Active admission cap, if any
    async fn throughput_cap(&self) -> Result<Option<u32>, BrokerError>;

    /// Cache a last known good result for the return-cached fallback
    async fn cache_fallback(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), BrokerError>;

    /// Read a cached fallback result, if still fresh
    async fn fallback_cache(&self, key: &str) -> Result<Option<serde_json::Value>, BrokerError>;

    // =========================================================================
    // Workflow Fabric
    // =========================================================================

    async fn put_workflow_meta(&self, meta: WorkflowMeta) -> Result<(), BrokerError>;

    async fn workflow_meta(&self, workflow_id: Uuid) -> Result<Option<WorkflowMeta>, BrokerError>;

    async fn save_template(&self, template: WorkflowTemplate) -> Result<(), BrokerError>;

    async fn template(&self, template_id: &str) -> Result<Option<WorkflowTemplate>, BrokerError>;

    /// Delete a template definition; instances already submitted are untouched
    async fn delete_template(&self, template_id: &str) -> Result<bool, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_mapping() {
        assert_eq!(PriorityBand::for_priority(10), PriorityBand::High);
        assert_eq!(PriorityBand::for_priority(8), PriorityBand::High);
        assert_eq!(PriorityBand::for_priority(7), PriorityBand::Medium);
        assert_eq!(PriorityBand::for_priority(4), PriorityBand::Medium);
        assert_eq!(PriorityBand::for_priority(3), PriorityBand::Low);
        assert_eq!(PriorityBand::for_priority(1), PriorityBand::Low);
    }

    #[test]
    fn test_out_of_range_priority_clamps_to_medium() {
        assert_eq!(PriorityBand::for_priority(0), PriorityBand::Medium);
        assert_eq!(PriorityBand::for_priority(11), PriorityBand::Medium);
        assert_eq!(PriorityBand::for_priority(-5), PriorityBand::Medium);
    }

    #[test]
    fn test_claim_order() {
        assert_eq!(
            PriorityBand::ALL,
            [
                PriorityBand::High,
                PriorityBand::Medium,
                PriorityBand::Low
            ]
        );
    }
}
