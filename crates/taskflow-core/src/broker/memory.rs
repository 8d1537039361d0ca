//! In-process implementation of the broker fabric
//!
//! Backs the priority queues with notify-based blocking pops. Suitable for
//! tests and single-process deployments; the trait is the seam for a shared
//! fabric in multi-host topologies.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tracing::debug;
use uuid::Uuid;

use super::{
    Broker, BrokerError, PriorityBand, QueueDepths, TaskMeta, WorkerFlags, WorkerRuntimeConfig,
};
use crate::breaker::DegradationStrategy;
use crate::events::{AlertEvent, CompletionEvent};
use crate::task::DlqEntry;
use crate::workflow::{WorkflowMeta, WorkflowTemplate};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct Queues {
    high: VecDeque<Uuid>,
    medium: VecDeque<Uuid>,
    low: VecDeque<Uuid>,
}

impl Queues {
    fn band_mut(&mut self, band: PriorityBand) -> &mut VecDeque<Uuid> {
        match band {
            PriorityBand::High => &mut self.high,
            PriorityBand::Medium => &mut self.medium,
            PriorityBand::Low => &mut self.low,
        }
    }
}

struct RateWindow {
    count: u32,
    resets_at: Instant,
}

struct DegradedEntry {
    strategy: DegradationStrategy,
    expires_at: Instant,
}

/// In-memory implementation of [`Broker`]
///
/// # Example
///
/// ```
/// use taskflow_core::broker::MemoryBroker;
///
/// let broker = MemoryBroker::new();
/// ```
pub struct MemoryBroker {
    queues: Mutex<Queues>,
    queue_notify: Notify,
    scheduled: Mutex<(BTreeSet<(DateTime<Utc>, Uuid)>, HashMap<Uuid, DateTime<Utc>>)>,
    task_meta: Mutex<HashMap<Uuid, TaskMeta>>,
    dlq: Mutex<Vec<DlqEntry>>,
    completions: broadcast::Sender<CompletionEvent>,
    alerts: broadcast::Sender<AlertEvent>,
    rate_limits: Mutex<HashMap<String, RateWindow>>,
    worker_flags: Mutex<HashMap<Uuid, WorkerFlags>>,
    worker_configs: Mutex<HashMap<Uuid, WorkerRuntimeConfig>>,
    degraded: Mutex<HashMap<String, DegradedEntry>>,
    throughput_cap: Mutex<Option<(u32, Instant)>>,
    fallback_cache: Mutex<HashMap<String, (serde_json::Value, Instant)>>,
    workflow_meta: Mutex<HashMap<Uuid, WorkflowMeta>>,
    templates: Mutex<HashMap<String, WorkflowTemplate>>,
}

impl MemoryBroker {
    /// Create a new in-memory broker
    pub fn new() -> Self {
        let (completions, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (alerts, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            queues: Mutex::new(Queues::default()),
            queue_notify: Notify::new(),
            scheduled: Mutex::new((BTreeSet::new(), HashMap::new())),
            task_meta: Mutex::new(HashMap::new()),
            dlq: Mutex::new(Vec::new()),
            completions,
            alerts,
            rate_limits: Mutex::new(HashMap::new()),
            worker_flags: Mutex::new(HashMap::new()),
            worker_configs: Mutex::new(HashMap::new()),
            degraded: Mutex::new(HashMap::new()),
            throughput_cap: Mutex::new(None),
            fallback_cache: Mutex::new(HashMap::new()),
            workflow_meta: Mutex::new(HashMap::new()),
            templates: Mutex::new(HashMap::new()),
        }
    }

    fn try_pop(&self, bands: &[PriorityBand]) -> Option<Uuid> {
        let mut queues = self.queues.lock();
        for band in bands {
            if let Some(id) = queues.band_mut(*band).pop_front() {
                return Some(id);
            }
        }
        None
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, task_id: Uuid, priority: i32) -> Result<PriorityBand, BrokerError> {
        let band = PriorityBand::for_priority(priority);
        self.queues.lock().band_mut(band).push_back(task_id);
        self.queue_notify.notify_waiters();
        debug!(%task_id, %band, "enqueued task");
        Ok(band)
    }

    async fn dequeue(
        &self,
        bands: &[PriorityBand],
        timeout: Duration,
    ) -> Result<Option<Uuid>, BrokerError> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before checking, so an enqueue between the
            // check and the await cannot be missed.
            let notified = self.queue_notify.notified();

            if let Some(id) = self.try_pop(bands) {
                return Ok(Some(id));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn remove(&self, task_id: Uuid) -> Result<bool, BrokerError> {
        let mut queues = self.queues.lock();
        for band in PriorityBand::ALL {
            let queue = queues.band_mut(band);
            if let Some(pos) = queue.iter().position(|id| *id == task_id) {
                queue.remove(pos);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn depths(&self) -> Result<QueueDepths, BrokerError> {
        let queues = self.queues.lock();
        Ok(QueueDepths {
            high: queues.high.len(),
            medium: queues.medium.len(),
            low: queues.low.len(),
        })
    }

    async fn schedule(&self, task_id: Uuid, due: DateTime<Utc>) -> Result<(), BrokerError> {
        let mut scheduled = self.scheduled.lock();
        if let Some(prev) = scheduled.1.insert(task_id, due) {
            scheduled.0.remove(&(prev, task_id));
        }
        scheduled.0.insert((due, task_id));
        Ok(())
    }

    async fn due_scheduled(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, BrokerError> {
        let scheduled = self.scheduled.lock();
        Ok(scheduled
            .0
            .iter()
            .take_while(|(due, _)| *due <= now)
            .map(|(_, id)| *id)
            .collect())
    }

    async fn unschedule(&self, task_id: Uuid) -> Result<bool, BrokerError> {
        let mut scheduled = self.scheduled.lock();
        match scheduled.1.remove(&task_id) {
            Some(due) => {
                scheduled.0.remove(&(due, task_id));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn put_task_meta(&self, task_id: Uuid, meta: TaskMeta) -> Result<(), BrokerError> {
        self.task_meta.lock().insert(task_id, meta);
        Ok(())
    }

    async fn task_meta(&self, task_id: Uuid) -> Result<Option<TaskMeta>, BrokerError> {
        Ok(self.task_meta.lock().get(&task_id).cloned())
    }

    async fn clear_task_meta(&self, task_id: Uuid) -> Result<(), BrokerError> {
        self.task_meta.lock().remove(&task_id);
        Ok(())
    }

    async fn push_dlq(&self, entry: &DlqEntry) -> Result<(), BrokerError> {
        self.dlq.lock().push(entry.clone());
        Ok(())
    }

    async fn list_dlq(&self) -> Result<Vec<DlqEntry>, BrokerError> {
        Ok(self.dlq.lock().clone())
    }

    async fn remove_dlq(&self, task_id: Uuid) -> Result<bool, BrokerError> {
        let mut dlq = self.dlq.lock();
        match dlq.iter().position(|e| e.task_id == task_id) {
            Some(pos) => {
                dlq.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn publish_completion(&self, event: CompletionEvent) -> Result<(), BrokerError> {
        // Best-effort: no subscribers is not an error.
        let _ = self.completions.send(event);
        Ok(())
    }

    fn subscribe_completions(&self) -> broadcast::Receiver<CompletionEvent> {
        self.completions.subscribe()
    }

    async fn publish_alert(&self, event: AlertEvent) -> Result<(), BrokerError> {
        let _ = self.alerts.send(event);
        Ok(())
    }

    fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts.subscribe()
    }

    async fn check_rate_limit(
        &self,
        resource: &str,
        limit: u32,
        window: Duration,
    ) -> Result<bool, BrokerError> {
        let now = Instant::now();
        let mut limits = self.rate_limits.lock();
        let entry = limits.entry(resource.to_string()).or_insert(RateWindow {
            count: 0,
            resets_at: now + window,
        });

        if now >= entry.resets_at {
            entry.count = 0;
            entry.resets_at = now + window;
        }

        if entry.count >= limit {
            return Ok(false);
        }
        entry.count += 1;
        Ok(true)
    }

    async fn set_worker_flags(
        &self,
        worker_id: Uuid,
        flags: WorkerFlags,
    ) -> Result<(), BrokerError> {
        self.worker_flags.lock().insert(worker_id, flags);
        Ok(())
    }

    async fn worker_flags(&self, worker_id: Uuid) -> Result<WorkerFlags, BrokerError> {
        Ok(self
            .worker_flags
            .lock()
            .get(&worker_id)
            .copied()
            .unwrap_or_default())
    }

    async fn clear_worker_state(&self, worker_id: Uuid) -> Result<(), BrokerError> {
        self.worker_flags.lock().remove(&worker_id);
        self.worker_configs.lock().remove(&worker_id);
        Ok(())
    }

    async fn set_worker_config(
        &self,
        worker_id: Uuid,
        config: WorkerRuntimeConfig,
    ) -> Result<(), BrokerError> {
        self.worker_configs.lock().insert(worker_id, config);
        Ok(())
    }

    async fn worker_config(&self, worker_id: Uuid) -> Result<WorkerRuntimeConfig, BrokerError> {
        Ok(self
            .worker_configs
            .lock()
            .get(&worker_id)
            .copied()
            .unwrap_or_default())
    }

    async fn mark_degraded(
        &self,
        dependency: &str,
        strategy: DegradationStrategy,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        self.degraded.lock().insert(
            dependency.to_string(),
            DegradedEntry {
                strategy,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn degradation(
        &self,
        dependency: &str,
    ) -> Result<Option<DegradationStrategy>, BrokerError> {
        let mut degraded = self.degraded.lock();
        match degraded.get(dependency) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.strategy)),
            Some(_) => {
                degraded.remove(dependency);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn clear_degraded(&self, dependency: &str) -> Result<(), BrokerError> {
        self.degraded.lock().remove(dependency);
        Ok(())
    }

    async fn set_throughput_cap(&self, per_minute: u32, ttl: Duration) -> Result<(), BrokerError> {
        *self.throughput_cap.lock() = Some((per_minute, Instant::now() + ttl));
        Ok(())
    }

    async fn throughput_cap(&self) -> Result<Option<u32>, BrokerError> {
        let mut cap = self.throughput_cap.lock();
        match *cap {
            Some((limit, expires_at)) if expires_at > Instant::now() => Ok(Some(limit)),
            Some(_) => {
                *cap = None;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn cache_fallback(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), BrokerError> {
        self.fallback_cache
            .lock()
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn fallback_cache(&self, key: &str) -> Result<Option<serde_json::Value>, BrokerError> {
        let mut cache = self.fallback_cache.lock();
        match cache.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                cache.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put_workflow_meta(&self, meta: WorkflowMeta) -> Result<(), BrokerError> {
        self.workflow_meta.lock().insert(meta.workflow_id, meta);
        Ok(())
    }

    async fn workflow_meta(&self, workflow_id: Uuid) -> Result<Option<WorkflowMeta>, BrokerError> {
        Ok(self.workflow_meta.lock().get(&workflow_id).cloned())
    }

    async fn save_template(&self, template: WorkflowTemplate) -> Result<(), BrokerError> {
        self.templates
            .lock()
            .insert(template.template_id.clone(), template);
        Ok(())
    }

    async fn template(&self, template_id: &str) -> Result<Option<WorkflowTemplate>, BrokerError> {
        Ok(self.templates.lock().get(template_id).cloned())
    }

    async fn delete_template(&self, template_id: &str) -> Result<bool, BrokerError> {
        Ok(self.templates.lock().remove(template_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskStatus;

    #[tokio::test]
    async fn test_enqueue_routes_by_priority() {
        let broker = MemoryBroker::new();

        assert_eq!(
            broker.enqueue(Uuid::now_v7(), 9).await.unwrap(),
            PriorityBand::High
        );
        assert_eq!(
            broker.enqueue(Uuid::now_v7(), 5).await.unwrap(),
            PriorityBand::Medium
        );
        assert_eq!(
            broker.enqueue(Uuid::now_v7(), 2).await.unwrap(),
            PriorityBand::Low
        );

        let depths = broker.depths().await.unwrap();
        assert_eq!(depths, QueueDepths { high: 1, medium: 1, low: 1 });
    }

    #[tokio::test]
    async fn test_dequeue_prefers_high_band() {
        let broker = MemoryBroker::new();
        let low = Uuid::now_v7();
        let high = Uuid::now_v7();
        let medium = Uuid::now_v7();

        broker.enqueue(low, 1).await.unwrap();
        broker.enqueue(medium, 5).await.unwrap();
        broker.enqueue(high, 10).await.unwrap();

        let first = broker
            .dequeue(&PriorityBand::ALL, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(first, Some(high));
        let second = broker
            .dequeue(&PriorityBand::ALL, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(second, Some(medium));
        let third = broker
            .dequeue(&PriorityBand::ALL, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(third, Some(low));
    }

    #[tokio::test]
    async fn test_fifo_within_band() {
        let broker = MemoryBroker::new();
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();

        broker.enqueue(first, 5).await.unwrap();
        broker.enqueue(second, 5).await.unwrap();

        assert_eq!(
            broker
                .dequeue(&PriorityBand::ALL, Duration::from_millis(10))
                .await
                .unwrap(),
            Some(first)
        );
        assert_eq!(
            broker
                .dequeue(&PriorityBand::ALL, Duration::from_millis(10))
                .await
                .unwrap(),
            Some(second)
        );
    }

    #[tokio::test]
    async fn test_dequeue_times_out_empty() {
        let broker = MemoryBroker::new();
        let start = Instant::now();
        let result = broker
            .dequeue(&PriorityBand::ALL, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(result, None);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let broker = std::sync::Arc::new(MemoryBroker::new());
        let id = Uuid::now_v7();

        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .dequeue(&PriorityBand::ALL, Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.enqueue(id, 5).await.unwrap();

        let got = waiter.await.unwrap();
        assert_eq!(got, Some(id));
    }

    #[tokio::test]
    async fn test_remove_from_queue() {
        let broker = MemoryBroker::new();
        let id = Uuid::now_v7();
        broker.enqueue(id, 5).await.unwrap();

        assert!(broker.remove(id).await.unwrap());
        assert!(!broker.remove(id).await.unwrap());
        assert_eq!(broker.depths().await.unwrap().total(), 0);
    }

    #[tokio::test]
    async fn test_scheduled_set_ordering() {
        let broker = MemoryBroker::new();
        let soon = Uuid::now_v7();
        let later = Uuid::now_v7();
        let now = Utc::now();

        broker
            .schedule(later, now + chrono::Duration::seconds(3600))
            .await
            .unwrap();
        broker
            .schedule(soon, now - chrono::Duration::seconds(1))
            .await
            .unwrap();

        let due = broker.due_scheduled(now).await.unwrap();
        assert_eq!(due, vec![soon]);

        assert!(broker.unschedule(soon).await.unwrap());
        assert!(broker.due_scheduled(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_completion_pubsub() {
        let broker = MemoryBroker::new();
        let mut rx = broker.subscribe_completions();
        let task_id = Uuid::now_v7();

        broker
            .publish_completion(CompletionEvent {
                task_id,
                status: TaskStatus::Completed,
            })
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.task_id, task_id);
        assert_eq!(event.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_alert_pubsub() {
        let broker = MemoryBroker::new();
        let mut rx = broker.subscribe_alerts();

        broker
            .publish_alert(AlertEvent::new(
                "worker.expired",
                crate::events::AlertSeverity::Warning,
                serde_json::json!({"worker_id": "w-1"}),
            ))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, "worker.expired");
        assert_eq!(event.severity, crate::events::AlertSeverity::Warning);
        assert_eq!(event.metadata["worker_id"], "w-1");
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let broker = MemoryBroker::new();
        broker
            .publish_completion(CompletionEvent {
                task_id: Uuid::now_v7(),
                status: TaskStatus::Failed,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_window() {
        let broker = MemoryBroker::new();
        let window = Duration::from_secs(60);

        assert!(broker.check_rate_limit("submit", 2, window).await.unwrap());
        assert!(broker.check_rate_limit("submit", 2, window).await.unwrap());
        assert!(!broker.check_rate_limit("submit", 2, window).await.unwrap());
        // Separate resources do not share windows
        assert!(broker.check_rate_limit("other", 2, window).await.unwrap());
    }

    #[tokio::test]
    async fn test_degradation_ttl() {
        let broker = MemoryBroker::new();
        broker
            .mark_degraded(
                "external-api",
                DegradationStrategy::ReturnCached,
                Duration::from_millis(30),
            )
            .await
            .unwrap();

        assert_eq!(
            broker.degradation("external-api").await.unwrap(),
            Some(DegradationStrategy::ReturnCached)
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(broker.degradation("external-api").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_worker_flags_default() {
        let broker = MemoryBroker::new();
        let worker_id = Uuid::now_v7();

        let flags = broker.worker_flags(worker_id).await.unwrap();
        assert!(!flags.paused);
        assert!(!flags.draining);

        broker
            .set_worker_flags(
                worker_id,
                WorkerFlags {
                    paused: true,
                    draining: false,
                },
            )
            .await
            .unwrap();
        assert!(broker.worker_flags(worker_id).await.unwrap().paused);
    }
}
