//! Timer-based release of scheduled tasks and recurring-schedule expansion
//!
//! One logical scheduler per deployment (standbys are safe: promotion runs
//! under conditional transitions, so double-release is impossible). Every
//! poll it promotes due tasks to their priority queues and expands recurring
//! cron schedules into fresh task instances.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::Broker;
use crate::error::CoreError;
use crate::store::{StatusChange, StoreError, TaskStore};
use crate::task::{Task, TaskStatus};

/// Validate a 5-field cron expression
///
/// Standard minute/hour/day/month/day-of-week semantics; anything else is
/// rejected with `InvalidCron` at submission.
pub fn validate_cron(expression: &str) -> Result<(), CoreError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CoreError::InvalidCron(format!(
            "expected 5 fields, got {}: {expression}",
            fields.len()
        )));
    }
    parse_schedule(expression).map(|_| ())
}

/// Next occurrence strictly after `after`
pub fn next_occurrence(
    expression: &str,
    after: DateTime<Utc>,
) -> Result<DateTime<Utc>, CoreError> {
    let schedule = parse_schedule(expression)?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| CoreError::InvalidCron(format!("no next occurrence: {expression}")))
}

/// The cron crate parses 6/7-field expressions; prepend a seconds field after
/// the 5-field shape has been checked.
fn parse_schedule(expression: &str) -> Result<cron::Schedule, CoreError> {
    cron::Schedule::from_str(&format!("0 {expression}"))
        .map_err(|e| CoreError::InvalidCron(format!("{expression}: {e}")))
}

/// What one scheduler poll accomplished
#[derive(Debug, Clone, Copy, Default)]
pub struct PromotionReport {
    /// Tasks released into priority queues
    pub promoted: usize,

    /// New instances created from recurring schedules
    pub recurring_spawned: usize,
}

/// Periodic promoter of due scheduled and retrying tasks
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn TaskStore>, broker: Arc<dyn Broker>) -> Self {
        Self {
            store,
            broker,
            poll_interval: Duration::from_secs(60),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Run the poll loop until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.poll_interval.as_secs(), "scheduler started");
        let mut ticker = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll_once().await {
                        Ok(report) if report.promoted > 0 => {
                            info!(
                                promoted = report.promoted,
                                recurring = report.recurring_spawned,
                                "released due tasks"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("scheduler poll failed: {}", e),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("scheduler: shutdown requested");
                    break;
                }
            }
        }
    }

    /// One promotion sweep over due scheduled and due retrying tasks
    ///
    /// Failure of a single task's promotion is logged and skipped; the next
    /// poll retries it.
    #[instrument(skip(self))]
    pub async fn poll_once(&self) -> Result<PromotionReport, CoreError> {
        let now = Utc::now();
        let mut report = PromotionReport::default();

        let mut due = self.store.due_scheduled(now).await?;
        due.extend(self.store.due_retries(now).await?);

        for task in due {
            match self.promote(&task, now).await {
                Ok(spawned_recurring) => {
                    report.promoted += 1;
                    if spawned_recurring {
                        report.recurring_spawned += 1;
                    }
                }
                Err(CoreError::InvalidTransition { .. }) => {
                    // Another scheduler instance won the release.
                }
                Err(e) => {
                    warn!(task_id = %task.id, "promotion failed, will retry next poll: {}", e);
                }
            }
        }

        Ok(report)
    }

    /// Promote one due task under a conditional transition
    async fn promote(&self, task: &Task, now: DateTime<Utc>) -> Result<bool, CoreError> {
        debug_assert!(matches!(
            task.status,
            TaskStatus::Pending | TaskStatus::Retrying
        ));

        let queued = match self
            .store
            .transition(task.id, task.status, StatusChange::Queued)
            .await
        {
            Ok(queued) => queued,
            Err(StoreError::InvalidTransition { task_id, from, to }) => {
                return Err(CoreError::InvalidTransition { task_id, from, to })
            }
            Err(e) => return Err(e.into()),
        };

        self.broker.unschedule(task.id).await?;
        self.broker.put_task_meta(queued.id, (&queued).into()).await?;
        self.broker
            .enqueue(queued.id, queued.descriptor.priority)
            .await?;
        debug!(task_id = %queued.id, "promoted to queue");

        // A recurring task spawns its next instance when the current one is
        // released; the instance is a fresh task with the same descriptor.
        if task.descriptor.is_recurring {
            if let Some(expression) = &task.descriptor.cron_expression {
                match next_occurrence(expression, now) {
                    Ok(next) => {
                        let mut descriptor = task.descriptor.clone();
                        descriptor.scheduled_at = Some(next);
                        let instance = Task::from_descriptor(descriptor);
                        self.store.insert_task(&instance).await?;
                        self.broker.schedule(instance.id, next).await?;
                        debug!(
                            task_id = %instance.id,
                            %next,
                            "scheduled next recurring instance"
                        );
                        return Ok(true);
                    }
                    Err(e) => {
                        // The expression was validated at submit; log and move on.
                        error!(task_id = %task.id, "cron expansion failed: {}", e);
                    }
                }
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::store::MemoryStore;
    use crate::task::TaskDescriptor;

    #[test]
    fn test_validate_five_fields() {
        assert!(validate_cron("0 6 * * *").is_ok());
        assert!(validate_cron("*/5 * * * *").is_ok());
        assert!(validate_cron("30 2 1 * 0").is_ok());
    }

    #[test]
    fn test_reject_wrong_field_count() {
        assert!(matches!(
            validate_cron("0 6 * *"),
            Err(CoreError::InvalidCron(_))
        ));
        assert!(matches!(
            validate_cron("0 0 6 * * *"),
            Err(CoreError::InvalidCron(_))
        ));
        assert!(matches!(validate_cron(""), Err(CoreError::InvalidCron(_))));
    }

    #[test]
    fn test_reject_garbage_fields() {
        assert!(matches!(
            validate_cron("61 6 * * *"),
            Err(CoreError::InvalidCron(_))
        ));
        assert!(matches!(
            validate_cron("a b c d e"),
            Err(CoreError::InvalidCron(_))
        ));
    }

    #[test]
    fn test_next_occurrence_strictly_after() {
        let base = Utc::now();
        let next = next_occurrence("*/5 * * * *", base).unwrap();
        assert!(next > base);

        // And monotone when chained
        let after = next_occurrence("*/5 * * * *", next).unwrap();
        assert!(after > next);
    }

    #[test]
    fn test_daily_occurrence_at_six() {
        use chrono::Timelike;
        let next = next_occurrence("0 6 * * *", Utc::now()).unwrap();
        assert_eq!(next.hour(), 6);
        assert_eq!(next.minute(), 0);
    }

    fn scheduler() -> (Arc<MemoryStore>, Arc<MemoryBroker>, Scheduler) {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let scheduler = Scheduler::new(store.clone(), broker.clone());
        (store, broker, scheduler)
    }

    #[tokio::test]
    async fn test_poll_promotes_due_task() {
        let (store, broker, scheduler) = scheduler();

        let task = Task::from_descriptor(
            TaskDescriptor::new("report")
                .with_priority(9)
                .with_scheduled_at(Utc::now() - chrono::Duration::seconds(1)),
        );
        store.insert_task(&task).await.unwrap();
        broker
            .schedule(task.id, task.descriptor.scheduled_at.unwrap())
            .await
            .unwrap();

        let report = scheduler.poll_once().await.unwrap();
        assert_eq!(report.promoted, 1);

        let promoted = store.get_task(task.id).await.unwrap();
        assert_eq!(promoted.status, TaskStatus::Queued);
        assert_eq!(broker.depths().await.unwrap().high, 1);
        // Removed from the scheduled set
        assert!(broker.due_scheduled(Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poll_ignores_future_tasks() {
        let (store, _, scheduler) = scheduler();

        let task = Task::from_descriptor(
            TaskDescriptor::new("later")
                .with_scheduled_at(Utc::now() + chrono::Duration::seconds(3600)),
        );
        store.insert_task(&task).await.unwrap();

        let report = scheduler.poll_once().await.unwrap();
        assert_eq!(report.promoted, 0);
        assert_eq!(
            store.get_task(task.id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_poll_requeues_due_retry() {
        let (store, broker, scheduler) = scheduler();

        let task = Task::from_descriptor(TaskDescriptor::new("flaky"));
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
                    worker_id: uuid::Uuid::now_v7(),
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
        store
            .transition(
                task.id,
                TaskStatus::Failed,
                StatusChange::Retrying {
                    next_retry_at: Utc::now() - chrono::Duration::seconds(1),
                },
            )
            .await
            .unwrap();

        let report = scheduler.poll_once().await.unwrap();
        assert_eq!(report.promoted, 1);

        let requeued = store.get_task(task.id).await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(broker.depths().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_recurring_spawns_next_instance() {
        let (store, broker, scheduler) = scheduler();

        let mut descriptor = TaskDescriptor::new("nightly").with_cron("0 3 * * *");
        descriptor.scheduled_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let task = Task::from_descriptor(descriptor);
        store.insert_task(&task).await.unwrap();
        broker
            .schedule(task.id, task.descriptor.scheduled_at.unwrap())
            .await
            .unwrap();

        let report = scheduler.poll_once().await.unwrap();
        assert_eq!(report.promoted, 1);
        assert_eq!(report.recurring_spawned, 1);

        // A fresh instance with a future due time now exists
        assert_eq!(store.task_count(), 2);
        let future_due = broker
            .due_scheduled(Utc::now() + chrono::Duration::days(2))
            .await
            .unwrap();
        assert_eq!(future_due.len(), 1);
        assert_ne!(future_due[0], task.id);
    }

    #[tokio::test]
    async fn test_double_release_impossible() {
        let (store, broker, scheduler) = scheduler();

        let task = Task::from_descriptor(
            TaskDescriptor::new("once")
                .with_scheduled_at(Utc::now() - chrono::Duration::seconds(1)),
        );
        store.insert_task(&task).await.unwrap();

        let first = scheduler.poll_once().await.unwrap();
        assert_eq!(first.promoted, 1);
        let second = scheduler.poll_once().await.unwrap();
        assert_eq!(second.promoted, 0);

        assert_eq!(broker.depths().await.unwrap().total(), 1);
    }
}
