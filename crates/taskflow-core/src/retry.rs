//! Retry policies and terminal-failure routing
//!
//! Computes next-attempt delays, classifies retryable vs terminal errors,
//! and routes exhausted or non-retryable failures to the dead-letter queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::error::CoreError;
use crate::events::{AlertEvent, AlertSeverity, CompletionEvent};
use crate::store::{StatusChange, TaskStore};
use crate::task::{DlqEntry, Task, TaskStatus};

/// Retry strategy types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Retry immediately
    Immediate,

    /// base + retry_count * increment, capped
    Linear,

    /// base * 2^retry_count, capped
    #[default]
    Exponential,

    /// Delegated to a plugged-in computation; rejected at submit otherwise
    Custom,
}

impl std::fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate => write!(f, "immediate"),
            Self::Linear => write!(f, "linear"),
            Self::Exponential => write!(f, "exponential"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Error classification reported by handlers
///
/// The first five classes are never retried; everything else is considered
/// transient and retried while the budget lasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Authentication,
    PermissionDenied,
    ResourceNotFound,
    InvalidInput,
    Timeout,
    Transient,
    Handler,
}

impl ErrorClass {
    /// Whether a failure of this class may be retried at all
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ErrorClass::Validation
                | ErrorClass::Authentication
                | ErrorClass::PermissionDenied
                | ErrorClass::ResourceNotFound
                | ErrorClass::InvalidInput
        )
    }
}

/// Error surfaced by a task handler
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerError {
    pub class: ErrorClass,
    pub message: String,
}

impl HandlerError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Validation, message)
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.class, self.message)
    }
}

impl std::error::Error for HandlerError {}

/// Pluggable computation for [`RetryStrategy::Custom`]
pub trait CustomBackoff: Send + Sync + 'static {
    /// Delay before the attempt following `retry_count` retries
    fn delay(&self, retry_count: u32, base: Duration, max: Duration) -> Duration;
}

/// Per-task retry parameters, derived from the task descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: RetryStrategy,
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,

    /// Increment for the linear strategy
    pub linear_increment: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(3600),
            linear_increment: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn for_task(task: &Task) -> Self {
        Self {
            strategy: task.descriptor.retry_strategy,
            max_retries: task.descriptor.max_retries,
            base_delay: Duration::from_secs(task.descriptor.backoff_base_seconds),
            max_delay: Duration::from_secs(task.descriptor.max_backoff_seconds),
            linear_increment: Duration::from_secs(10),
        }
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base: Duration) -> Self {
        self.base_delay = base;
        self
    }

    pub fn with_max_delay(mut self, max: Duration) -> Self {
        self.max_delay = max;
        self
    }

    /// Delay before the next attempt, given the retries consumed so far
    ///
    /// `Custom` falls back to exponential when no computation is plugged in;
    /// submission rejects custom-strategy tasks in that configuration, so the
    /// fallback only covers tasks persisted before the calculator was removed.
    pub fn delay_for(&self, retry_count: u32, custom: Option<&dyn CustomBackoff>) -> Duration {
        let delay = match self.strategy {
            RetryStrategy::Immediate => Duration::ZERO,
            RetryStrategy::Linear => self.base_delay + self.linear_increment * retry_count,
            RetryStrategy::Exponential => {
                let factor = 2u64.saturating_pow(retry_count.min(32));
                self.base_delay.saturating_mul(factor.min(u32::MAX as u64) as u32)
            }
            RetryStrategy::Custom => match custom {
                Some(c) => c.delay(retry_count, self.base_delay, self.max_delay),
                None => {
                    let factor = 2u64.saturating_pow(retry_count.min(32));
                    self.base_delay.saturating_mul(factor.min(u32::MAX as u64) as u32)
                }
            },
        };
        delay.min(self.max_delay)
    }

    /// Whether another retry is permitted
    pub fn should_retry(&self, retry_count: u32, class: ErrorClass) -> bool {
        class.is_retryable() && retry_count < self.max_retries
    }

    /// Full delay ladder for operator display
    pub fn schedule(&self, custom: Option<&dyn CustomBackoff>) -> Vec<Duration> {
        (0..self.max_retries)
            .map(|n| self.delay_for(n, custom))
            .collect()
    }
}

/// Outcome of routing a failed attempt
#[derive(Debug, Clone)]
pub enum FailureOutcome {
    /// Transitioned to RETRYING; scheduled for re-queue
    WillRetry {
        next_attempt: u32,
        delay: Duration,
    },

    /// Left FAILED and recorded in the dead-letter queue
    DeadLettered,

    /// Left FAILED terminally with the DLQ disabled
    FailedTerminal,
}

/// Routes RUNNING -> FAILED/TIMEOUT events to a retry or the DLQ
///
/// Both the dispatch loop and the orphan-recovery sweep report failures here.
pub struct RetryPlanner {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    dlq_enabled: bool,
    custom: Option<Arc<dyn CustomBackoff>>,
}

impl RetryPlanner {
    pub fn new(store: Arc<dyn TaskStore>, broker: Arc<dyn Broker>) -> Self {
        Self {
            store,
            broker,
            dlq_enabled: true,
            custom: None,
        }
    }

    pub fn with_dlq_enabled(mut self, enabled: bool) -> Self {
        self.dlq_enabled = enabled;
        self
    }

    /// Plug in a computation for the custom strategy
    pub fn with_custom_backoff(mut self, custom: Arc<dyn CustomBackoff>) -> Self {
        self.custom = Some(custom);
        self
    }

    /// Whether custom-strategy tasks can be accepted
    pub fn supports_custom(&self) -> bool {
        self.custom.is_some()
    }

    /// Decide the fate of a task whose attempt just ended in FAILED or TIMEOUT
    ///
    /// The task must already be in FAILED or TIMEOUT; this either moves it to
    /// RETRYING (and schedules the re-queue) or leaves it FAILED and
    /// dead-letters it.
    pub async fn on_attempt_failed(
        &self,
        task: &Task,
        class: ErrorClass,
    ) -> Result<FailureOutcome, CoreError> {
        debug_assert!(matches!(
            task.status,
            TaskStatus::Failed | TaskStatus::Timeout
        ));

        let policy = RetryPolicy::for_task(task);

        if !policy.should_retry(task.retry_count, class) {
            return self.dead_letter(task, class).await;
        }

        let delay = policy.delay_for(task.retry_count, self.custom.as_deref());
        let next_retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();

        let updated = self
            .store
            .transition(task.id, task.status, StatusChange::Retrying { next_retry_at })
            .await?;

        self.broker.schedule(task.id, next_retry_at).await?;

        let _ = self
            .broker
            .publish_alert(AlertEvent::new(
                "task.retry_scheduled",
                AlertSeverity::Info,
                serde_json::json!({
                    "task_id": task.id,
                    "attempt": updated.retry_count,
                    "delay_seconds": delay.as_secs(),
                }),
            ))
            .await;

        info!(
            task_id = %task.id,
            attempt = updated.retry_count,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );

        Ok(FailureOutcome::WillRetry {
            next_attempt: updated.retry_count + 1,
            delay,
        })
    }

    async fn dead_letter(
        &self,
        task: &Task,
        class: ErrorClass,
    ) -> Result<FailureOutcome, CoreError> {
        let reason = task
            .error_message
            .clone()
            .unwrap_or_else(|| format!("{class:?} failure"));

        if self.dlq_enabled {
            let entry = DlqEntry {
                task_id: task.id,
                reason: reason.clone(),
                attempts: task.attempt_number(),
                descriptor: task.descriptor.clone(),
                dead_at: Utc::now(),
            };
            self.store.insert_dlq(&entry).await?;
            self.broker.push_dlq(&entry).await?;
        } else {
            warn!(task_id = %task.id, "DLQ disabled; task left in terminal failure");
        }

        let _ = self
            .broker
            .publish_alert(AlertEvent::new(
                "task.dead_lettered",
                AlertSeverity::Warning,
                serde_json::json!({
                    "task_id": task.id,
                    "reason": reason,
                    "attempts": task.attempt_number(),
                }),
            ))
            .await;

        // Terminal failure is a completion from the perspective of dependents.
        let _ = self
            .broker
            .publish_completion(CompletionEvent {
                task_id: task.id,
                status: TaskStatus::Failed,
            })
            .await;

        debug!(task_id = %task.id, %reason, "task dead-lettered");

        Ok(if self.dlq_enabled {
            FailureOutcome::DeadLettered
        } else {
            FailureOutcome::FailedTerminal
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_delay() {
        let policy = RetryPolicy::default().with_strategy(RetryStrategy::Immediate);
        assert_eq!(policy.delay_for(0, None), Duration::ZERO);
        assert_eq!(policy.delay_for(7, None), Duration::ZERO);
    }

    #[test]
    fn test_linear_delay() {
        let policy = RetryPolicy::default()
            .with_strategy(RetryStrategy::Linear)
            .with_base_delay(Duration::from_secs(2));

        assert_eq!(policy.delay_for(0, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(12));
        assert_eq!(policy.delay_for(3, None), Duration::from_secs(32));
    }

    #[test]
    fn test_exponential_delay() {
        let policy = RetryPolicy::default().with_base_delay(Duration::from_secs(2));

        assert_eq!(policy.delay_for(0, None), Duration::from_secs(2));
        assert_eq!(policy.delay_for(1, None), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2, None), Duration::from_secs(8));
        assert_eq!(policy.delay_for(3, None), Duration::from_secs(16));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_secs(2))
            .with_max_delay(Duration::from_secs(60));

        assert_eq!(policy.delay_for(10, None), Duration::from_secs(60));
    }

    #[test]
    fn test_custom_delegation() {
        struct Fixed;
        impl CustomBackoff for Fixed {
            fn delay(&self, _retry_count: u32, _base: Duration, _max: Duration) -> Duration {
                Duration::from_secs(42)
            }
        }

        let policy = RetryPolicy::default().with_strategy(RetryStrategy::Custom);
        assert_eq!(policy.delay_for(0, Some(&Fixed)), Duration::from_secs(42));
    }

    #[test]
    fn test_non_retryable_classes() {
        let policy = RetryPolicy::default().with_max_retries(3);

        assert!(!policy.should_retry(0, ErrorClass::Validation));
        assert!(!policy.should_retry(0, ErrorClass::Authentication));
        assert!(!policy.should_retry(0, ErrorClass::PermissionDenied));
        assert!(!policy.should_retry(0, ErrorClass::ResourceNotFound));
        assert!(!policy.should_retry(0, ErrorClass::InvalidInput));
        assert!(policy.should_retry(0, ErrorClass::Timeout));
        assert!(policy.should_retry(0, ErrorClass::Transient));
    }

    #[test]
    fn test_retry_budget() {
        let policy = RetryPolicy::default().with_max_retries(3);

        assert!(policy.should_retry(2, ErrorClass::Transient));
        assert!(!policy.should_retry(3, ErrorClass::Transient));
        assert!(!policy.should_retry(4, ErrorClass::Transient));
    }

    #[test]
    fn test_schedule_ladder() {
        let policy = RetryPolicy::default()
            .with_max_retries(3)
            .with_base_delay(Duration::from_secs(2));

        let ladder = policy.schedule(None);
        assert_eq!(
            ladder,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8)
            ]
        );
    }

    #[test]
    fn test_strategy_serialization() {
        let json = serde_json::to_string(&RetryStrategy::Exponential).unwrap();
        assert_eq!(json, "\"exponential\"");
        let parsed: RetryStrategy = serde_json::from_str("\"linear\"").unwrap();
        assert_eq!(parsed, RetryStrategy::Linear);
    }
}
