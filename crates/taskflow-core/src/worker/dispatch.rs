//! Per-slot dispatch loop: claim, execute, ack or fail
//!
//! One loop per worker slot. The broker hands out task ids; the store's
//! conditional QUEUED -> RUNNING transition decides who actually owns the
//! claim. Handler panics are caught at the join point and synthesized into a
//! FAILED transition; deadline expiry synthesizes TIMEOUT.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use super::registry::{HandlerContext, HandlerRegistry};
use crate::breaker::DegradationStrategy;
use crate::broker::{Broker, PriorityBand};
use crate::error::CoreError;
use crate::events::CompletionEvent;
use crate::retry::{ErrorClass, HandlerError, RetryPlanner};
use crate::store::{StatusChange, StoreError, TaskStore};
use crate::task::{Task, TaskStatus};

/// Dispatch loop tuning
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Blocking dequeue timeout per claim attempt
    pub claim_timeout: Duration,

    /// Sleep while paused, draining, or at capacity
    pub idle_sleep: Duration,

    /// Bands this worker claims from, in preference order
    pub bands: Vec<PriorityBand>,

    /// Fallback per-attempt timeout when neither the task nor the worker
    /// config carries one
    pub default_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            claim_timeout: Duration::from_secs(5),
            idle_sleep: Duration::from_millis(500),
            bands: PriorityBand::ALL.to_vec(),
            default_timeout: Duration::from_secs(300),
        }
    }
}

/// How one claimed attempt ended
enum AttemptOutcome {
    Success(serde_json::Value),
    Failure(HandlerError),
    TimedOut(Duration),
}

/// One cooperative claim-execute-ack loop
pub struct DispatchLoop {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    planner: Arc<RetryPlanner>,
    worker_id: Uuid,
    config: DispatchConfig,

    /// Shared across the worker's slots; compared against capacity
    load: Arc<AtomicU32>,
}

impl DispatchLoop {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        planner: Arc<RetryPlanner>,
        worker_id: Uuid,
        load: Arc<AtomicU32>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            planner,
            worker_id,
            config,
            load,
        }
    }

    /// Run until shutdown; DRAINING semantics on the way out
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.step(&mut shutdown).await {
                Ok(()) => {}
                Err(e) if e.is_retryable() => {
                    warn!(worker_id = %self.worker_id, "transient dispatch error: {}", e);
                    tokio::time::sleep(self.config.idle_sleep).await;
                }
                Err(e) => {
                    error!(worker_id = %self.worker_id, "dispatch error: {}", e);
                    tokio::time::sleep(self.config.idle_sleep).await;
                }
            }
        }
        debug!(worker_id = %self.worker_id, "dispatch loop exited");
    }

    /// One iteration: gate on worker state, claim, process
    async fn step(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), CoreError> {
        let flags = self.broker.worker_flags(self.worker_id).await?;
        if flags.paused || flags.draining {
            self.idle_wait(shutdown).await;
            return Ok(());
        }

        let capacity = self.effective_capacity().await?;
        if self.load.load(Ordering::Relaxed) >= capacity {
            self.idle_wait(shutdown).await;
            return Ok(());
        }

        let claimed = tokio::select! {
            claimed = self.broker.dequeue(&self.config.bands, self.config.claim_timeout) => claimed?,
            _ = shutdown.changed() => return Ok(()),
        };

        if let Some(task_id) = claimed {
            self.process_claim(task_id).await?;
        }
        Ok(())
    }

    async fn idle_wait(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.idle_sleep) => {}
            _ = shutdown.changed() => {}
        }
    }

    async fn effective_capacity(&self) -> Result<u32, CoreError> {
        let config = self.broker.worker_config(self.worker_id).await?;
        match config.capacity {
            Some(capacity) => Ok(capacity.max(1)),
            None => Ok(self
                .store
                .get_worker(self.worker_id)
                .await
                .map(|w| w.capacity)
                .unwrap_or(1)),
        }
    }

    /// Drive one claimed task id to an acked outcome
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn process_claim(&self, task_id: Uuid) -> Result<(), CoreError> {
        let task = match self.store.get_task(task_id).await {
            Ok(task) => task,
            Err(StoreError::TaskNotFound(_)) => {
                warn!(%task_id, "claimed id has no task row, discarding");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // Degradation may short-circuit the claim before RUNNING is taken.
        let strategy = self.broker.degradation(&task.descriptor.name).await?;
        if strategy == Some(DegradationStrategy::QueueToFallback) {
            debug!(%task_id, "dependency degraded, routing to fallback queue");
            self.broker.enqueue(task_id, 1).await?;
            tokio::time::sleep(self.config.idle_sleep).await;
            return Ok(());
        }

        let claimed = match self
            .store
            .transition(
                task_id,
                TaskStatus::Queued,
                StatusChange::Running {
                    worker_id: self.worker_id,
                },
            )
            .await
        {
            Ok(claimed) => claimed,
            Err(StoreError::InvalidTransition { from, .. }) => {
                // Another worker won the race, or the task was cancelled.
                debug!(%task_id, current = %from, "claim lost, discarding");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if claimed.cancel_requested {
            self.finish_cancelled(&claimed).await?;
            return Ok(());
        }

        self.load.fetch_add(1, Ordering::Relaxed);
        let result = self.execute_and_ack(claimed, strategy).await;
        self.load.fetch_sub(1, Ordering::Relaxed);
        result
    }

    async fn execute_and_ack(
        &self,
        task: Task,
        strategy: Option<DegradationStrategy>,
    ) -> Result<(), CoreError> {
        let outcome = match strategy {
            Some(DegradationStrategy::ReturnCached) => {
                match self.broker.fallback_cache(&task.descriptor.name).await? {
                    Some(cached) => AttemptOutcome::Success(cached),
                    None => self.execute(&task).await,
                }
            }
            Some(DegradationStrategy::DefaultValue) => {
                AttemptOutcome::Success(serde_json::Value::Null)
            }
            _ => self.execute(&task).await,
        };

        match outcome {
            AttemptOutcome::Success(result) => {
                // Cooperative cancellation wins over a late success.
                let current = self.store.get_task(task.id).await?;
                if current.cancel_requested {
                    return self.finish_cancelled(&task).await;
                }

                match self
                    .store
                    .transition(
                        task.id,
                        TaskStatus::Running,
                        StatusChange::Completed {
                            result: Some(result),
                        },
                    )
                    .await
                {
                    Ok(_) => {}
                    Err(StoreError::InvalidTransition { from, .. }) => {
                        // The orphan sweep resolved the attempt first.
                        debug!(task_id = %task.id, current = %from, "late ack discarded");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
                self.broker.clear_task_meta(task.id).await?;
                let _ = self
                    .broker
                    .publish_completion(CompletionEvent {
                        task_id: task.id,
                        status: TaskStatus::Completed,
                    })
                    .await;
                debug!(task_id = %task.id, "task completed");
                Ok(())
            }
            AttemptOutcome::Failure(error) => {
                let current = self.store.get_task(task.id).await?;
                if current.cancel_requested {
                    return self.finish_cancelled(&task).await;
                }

                let failed = match self
                    .store
                    .transition(
                        task.id,
                        TaskStatus::Running,
                        StatusChange::Failed {
                            error: error.message.clone(),
                        },
                    )
                    .await
                {
                    Ok(failed) => failed,
                    Err(StoreError::InvalidTransition { from, .. }) => {
                        debug!(task_id = %task.id, current = %from, "late nack discarded");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };
                warn!(task_id = %task.id, class = ?error.class, "attempt failed: {}", error.message);
                self.planner.on_attempt_failed(&failed, error.class).await?;
                Ok(())
            }
            AttemptOutcome::TimedOut(limit) => {
                let error = format!("execution exceeded {}s deadline", limit.as_secs());

                // A timeout is retryable while budget remains; once exhausted
                // the attempt ends in terminal FAILED (TIMEOUT has no edge to
                // FAILED, so the exhaustion check comes first).
                let retries_remain = crate::retry::RetryPolicy::for_task(&task)
                    .should_retry(task.retry_count, ErrorClass::Timeout);
                let change = if retries_remain {
                    StatusChange::TimedOut { error }
                } else {
                    StatusChange::Failed { error }
                };

                let ended = match self
                    .store
                    .transition(task.id, TaskStatus::Running, change)
                    .await
                {
                    Ok(ended) => ended,
                    Err(StoreError::InvalidTransition { from, .. }) => {
                        debug!(task_id = %task.id, current = %from, "late timeout discarded");
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                };
                warn!(task_id = %task.id, limit_secs = limit.as_secs(), "attempt timed out");
                self.planner
                    .on_attempt_failed(&ended, ErrorClass::Timeout)
                    .await?;
                Ok(())
            }
        }
    }

    /// Run the handler under the attempt deadline, catching panics
    async fn execute(&self, task: &Task) -> AttemptOutcome {
        let Some(handler) = self.registry.get(&task.descriptor.name) else {
            return AttemptOutcome::Failure(HandlerError::new(
                ErrorClass::InvalidInput,
                format!("no handler registered for task: {}", task.descriptor.name),
            ));
        };

        let limit = self.attempt_timeout(task).await;
        let token = CancellationToken::new();
        let ctx = HandlerContext::new(task.clone(), token.clone(), self.broker.clone());

        let handle = tokio::spawn(handler(ctx));
        match tokio::time::timeout(limit, handle).await {
            Err(_) => {
                // Deadline expired; tell a cooperative handler to stop.
                token.cancel();
                AttemptOutcome::TimedOut(limit)
            }
            Ok(Err(join_error)) => AttemptOutcome::Failure(HandlerError::new(
                ErrorClass::Handler,
                format!("handler panicked: {join_error}"),
            )),
            Ok(Ok(Ok(value))) => AttemptOutcome::Success(value),
            Ok(Ok(Err(error))) => AttemptOutcome::Failure(error),
        }
    }

    async fn attempt_timeout(&self, task: &Task) -> Duration {
        let worker_override = self
            .broker
            .worker_config(self.worker_id)
            .await
            .ok()
            .and_then(|c| c.timeout_seconds);

        match worker_override {
            Some(secs) => Duration::from_secs(secs),
            None if task.descriptor.timeout_seconds > 0 => {
                Duration::from_secs(task.descriptor.timeout_seconds)
            }
            None => self.config.default_timeout,
        }
    }

    async fn finish_cancelled(&self, task: &Task) -> Result<(), CoreError> {
        match self
            .store
            .transition(task.id, TaskStatus::Running, StatusChange::Cancelled)
            .await
        {
            Ok(_) | Err(StoreError::InvalidTransition { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.broker.clear_task_meta(task.id).await?;
        let _ = self
            .broker
            .publish_completion(CompletionEvent {
                task_id: task.id,
                status: TaskStatus::Cancelled,
            })
            .await;
        debug!(task_id = %task.id, "cancelled cooperatively");
        Ok(())
    }
}
