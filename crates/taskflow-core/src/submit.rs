//! Submit boundary: validation, persistence, release or schedule
//!
//! The only write path into the core for outside callers. Validates the
//! descriptor, persists the task, then either releases it to a priority
//! queue, parks it in the scheduled set, or leaves it pending behind its
//! dependencies.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::events::CompletionEvent;
use crate::retry::RetryStrategy;
use crate::scheduler::validate_cron;
use crate::store::{StatusChange, StoreError, TaskStore};
use crate::task::{
    Task, TaskDescriptor, TaskStatus, MAX_NAME_LEN, MAX_PRIORITY, MAX_RETRIES_CEILING,
    MAX_TIMEOUT_SECONDS, MIN_PRIORITY, MIN_TIMEOUT_SECONDS,
};

/// Validate a descriptor against the submit-boundary bounds
///
/// Out-of-range priorities are NOT rejected here; enqueue clamps them to the
/// medium band. Everything else is a hard error.
pub fn validate_descriptor(
    descriptor: &TaskDescriptor,
    allow_custom_strategy: bool,
) -> Result<(), CoreError> {
    if descriptor.name.is_empty() {
        return Err(CoreError::InvalidTask("task name must not be empty".into()));
    }
    if descriptor.name.len() > MAX_NAME_LEN {
        return Err(CoreError::InvalidTask(format!(
            "task name exceeds {MAX_NAME_LEN} chars"
        )));
    }
    if descriptor.max_retries > MAX_RETRIES_CEILING {
        return Err(CoreError::InvalidTask(format!(
            "max_retries {} exceeds ceiling {MAX_RETRIES_CEILING}",
            descriptor.max_retries
        )));
    }
    if descriptor.timeout_seconds < MIN_TIMEOUT_SECONDS
        || descriptor.timeout_seconds > MAX_TIMEOUT_SECONDS
    {
        return Err(CoreError::InvalidTask(format!(
            "timeout_seconds {} outside [{MIN_TIMEOUT_SECONDS}..{MAX_TIMEOUT_SECONDS}]",
            descriptor.timeout_seconds
        )));
    }
    if descriptor.retry_strategy == RetryStrategy::Custom && !allow_custom_strategy {
        return Err(CoreError::InvalidTask(
            "custom retry strategy requires a plugged-in backoff computation".into(),
        ));
    }
    if let Some(expression) = &descriptor.cron_expression {
        validate_cron(expression)?;
    }
    if descriptor.is_recurring && descriptor.cron_expression.is_none() {
        return Err(CoreError::InvalidTask(
            "recurring task requires a cron expression".into(),
        ));
    }
    Ok(())
}

/// Entry point for submitters
pub struct Submitter {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    config: CoreConfig,

    /// Whether a custom backoff computation is plugged into the planner
    allow_custom_strategy: bool,
}

impl Submitter {
    pub fn new(store: Arc<dyn TaskStore>, broker: Arc<dyn Broker>, config: CoreConfig) -> Self {
        Self {
            store,
            broker,
            config,
            allow_custom_strategy: false,
        }
    }

    pub fn with_custom_strategy_allowed(mut self, allowed: bool) -> Self {
        self.allow_custom_strategy = allowed;
        self
    }

    /// Validate, persist, and release or schedule one task
    #[instrument(skip(self, descriptor), fields(name = %descriptor.name))]
    pub async fn submit(&self, mut descriptor: TaskDescriptor) -> Result<Uuid, CoreError> {
        self.admit().await?;
        validate_descriptor(&descriptor, self.allow_custom_strategy)?;

        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&descriptor.priority) {
            warn!(
                priority = descriptor.priority,
                "priority out of range, using default"
            );
            descriptor.priority = self.config.default_priority;
        }

        for parent_id in &descriptor.depends_on {
            if self.store.get_task(*parent_id).await.is_err() {
                return Err(CoreError::NotFound(format!("parent task {parent_id}")));
            }
        }

        let task = Task::from_descriptor(descriptor);
        let task_id = task.id;
        self.store.insert_task(&task).await?;

        let due = task.descriptor.scheduled_at.filter(|at| *at > Utc::now());
        if let Some(due) = due {
            self.broker.schedule(task_id, due).await?;
            debug!(%task_id, %due, "task scheduled");
        } else if task.descriptor.depends_on.is_empty() {
            let queued = self
                .store
                .transition(task_id, TaskStatus::Pending, StatusChange::Queued)
                .await?;
            self.broker
                .put_task_meta(task_id, (&queued).into())
                .await?;
            let band = self
                .broker
                .enqueue(task_id, queued.descriptor.priority)
                .await?;
            debug!(%task_id, %band, "task enqueued");
        } else {
            // Stays pending until the dependency engine releases it.
            debug!(%task_id, parents = task.descriptor.depends_on.len(), "task gated on parents");
        }

        info!(%task_id, name = %task.descriptor.name, "task submitted");
        Ok(task_id)
    }

    /// Cancel a task
    ///
    /// Non-running tasks transition to CANCELLED immediately. A running task
    /// is cancelled cooperatively: the flag is set, the in-flight attempt is
    /// never aborted, and the returned status remains RUNNING until the
    /// worker observes the flag.
    #[instrument(skip(self))]
    pub async fn cancel(&self, task_id: Uuid) -> Result<TaskStatus, CoreError> {
        let task = self.store.get_task(task_id).await?;

        match task.status {
            status if status.is_terminal() => Ok(status),
            TaskStatus::Running => {
                self.store.request_cancel(task_id).await?;
                debug!(%task_id, "cooperative cancellation requested");
                Ok(TaskStatus::Running)
            }
            status => {
                match self
                    .store
                    .transition(task_id, status, StatusChange::Cancelled)
                    .await
                {
                    Ok(cancelled) => {
                        self.broker.remove(task_id).await?;
                        self.broker.unschedule(task_id).await?;
                        self.broker.clear_task_meta(task_id).await?;
                        let _ = self
                            .broker
                            .publish_completion(CompletionEvent {
                                task_id,
                                status: TaskStatus::Cancelled,
                            })
                            .await;
                        info!(%task_id, "task cancelled");
                        Ok(cancelled.status)
                    }
                    Err(StoreError::InvalidTransition { from, .. }) => {
                        // Raced with a worker; fall back to the cooperative path.
                        self.store.request_cancel(task_id).await?;
                        Ok(from)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Requeue a dead-lettered task as a fresh task with a new id
    ///
    /// The DLQ entry is removed explicitly; the new task starts with a full
    /// retry budget.
    #[instrument(skip(self))]
    pub async fn requeue_dlq(&self, task_id: Uuid) -> Result<Uuid, CoreError> {
        let entry = self.store.remove_dlq(task_id).await?;
        self.broker.remove_dlq(task_id).await?;

        let mut descriptor = entry.descriptor;
        descriptor.scheduled_at = None;
        let new_task = Task::from_descriptor(descriptor);
        let new_id = new_task.id;

        self.store.insert_task(&new_task).await?;
        let queued = self
            .store
            .transition(new_id, TaskStatus::Pending, StatusChange::Queued)
            .await?;
        self.broker.put_task_meta(new_id, (&queued).into()).await?;
        self.broker
            .enqueue(new_id, queued.descriptor.priority)
            .await?;

        info!(original = %task_id, %new_id, "dead-lettered task requeued");
        Ok(new_id)
    }

    /// Discard a dead-lettered task; the entry is removed, the task row stays
    #[instrument(skip(self))]
    pub async fn discard_dlq(&self, task_id: Uuid) -> Result<(), CoreError> {
        self.store.remove_dlq(task_id).await?;
        self.broker.remove_dlq(task_id).await?;
        info!(%task_id, "dead-lettered task discarded");
        Ok(())
    }

    /// Throughput-cap admission check
    async fn admit(&self) -> Result<(), CoreError> {
        if let Some(per_minute) = self.broker.throughput_cap().await? {
            let allowed = self
                .broker
                .check_rate_limit("submit", per_minute, Duration::from_secs(60))
                .await?;
            if !allowed {
                return Err(CoreError::CapacityExceeded(format!(
                    "throughput cap of {per_minute}/min reached"
                )));
            }
        }
        Ok(())
    }
}
