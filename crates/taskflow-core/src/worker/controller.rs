//! Worker administration and liveness
//!
//! Registration, heartbeats, pause/drain/terminate semantics, capacity and
//! timeout updates, and the orphan-recovery sweep that reclaims tasks from
//! expired workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::broker::{Broker, WorkerFlags};
use crate::error::CoreError;
use crate::events::{AlertEvent, AlertSeverity};
use crate::retry::{ErrorClass, RetryPlanner};
use crate::store::{StatusChange, TaskStore};
use crate::task::{TaskStatus, WorkerRecord, WorkerState};

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Heartbeat age after which a live worker is declared dead
    pub dead_timeout: Duration,

    /// Orphan-recovery sweep cadence
    pub sweep_interval: Duration,

    /// Capacity assigned when registration omits one
    pub default_capacity: u32,

    /// Slack past a task's deadline before an unacked claim is reclaimed
    pub claim_grace: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            dead_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(30),
            default_capacity: 5,
            claim_grace: Duration::from_secs(30),
        }
    }
}

/// What one orphan-recovery sweep accomplished
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub dead_workers: usize,
    pub orphans_recovered: usize,
}

/// Control plane for worker lifecycle and operations
pub struct WorkerController {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    planner: Arc<RetryPlanner>,
    config: ControllerConfig,
}

impl WorkerController {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn Broker>,
        planner: Arc<RetryPlanner>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            broker,
            planner,
            config,
        }
    }

    /// Register a new worker; capacity defaults from configuration
    #[instrument(skip(self))]
    pub async fn register(
        &self,
        hostname: &str,
        capacity: Option<u32>,
    ) -> Result<WorkerRecord, CoreError> {
        let worker = WorkerRecord::new(hostname, capacity.unwrap_or(self.config.default_capacity));
        self.store.insert_worker(&worker).await?;
        info!(worker_id = %worker.id, %hostname, capacity = worker.capacity, "worker registered");
        Ok(worker)
    }

    /// Record a heartbeat with the reported load
    ///
    /// Also performs the load-derived bookkeeping: ACTIVE and IDLE flip by
    /// load, and a draining worker whose load reached zero becomes DEAD.
    pub async fn heartbeat(
        &self,
        worker_id: Uuid,
        current_load: u32,
    ) -> Result<WorkerRecord, CoreError> {
        let worker = self.store.worker_heartbeat(worker_id, current_load).await?;

        let next = match worker.status {
            WorkerState::Draining if worker.current_load == 0 => Some(WorkerState::Dead),
            WorkerState::Active if worker.current_load == 0 => Some(WorkerState::Idle),
            WorkerState::Idle if worker.current_load > 0 => Some(WorkerState::Active),
            _ => None,
        };

        match next {
            Some(WorkerState::Dead) => {
                info!(%worker_id, "drained worker retired");
                self.broker.clear_worker_state(worker_id).await?;
                Ok(self.store.set_worker_status(worker_id, WorkerState::Dead).await?)
            }
            Some(status) => Ok(self.store.set_worker_status(worker_id, status).await?),
            None => Ok(worker),
        }
    }

    /// Pause: retain assignments, stop new claims; idempotent
    #[instrument(skip(self))]
    pub async fn pause(&self, worker_id: Uuid) -> Result<WorkerRecord, CoreError> {
        let worker = self
            .store
            .set_worker_status(worker_id, WorkerState::Paused)
            .await?;
        self.broker
            .set_worker_flags(
                worker_id,
                WorkerFlags {
                    paused: true,
                    draining: false,
                },
            )
            .await?;
        Ok(worker)
    }

    /// Resume a paused worker; idempotent
    #[instrument(skip(self))]
    pub async fn resume(&self, worker_id: Uuid) -> Result<WorkerRecord, CoreError> {
        let current = self.store.get_worker(worker_id).await?;
        let status = if current.current_load > 0 {
            WorkerState::Active
        } else {
            WorkerState::Idle
        };
        let worker = self.store.set_worker_status(worker_id, status).await?;
        self.broker
            .set_worker_flags(worker_id, WorkerFlags::default())
            .await?;
        Ok(worker)
    }

    /// Drain: finish current work, claim nothing new; DEAD at load zero
    #[instrument(skip(self))]
    pub async fn drain(&self, worker_id: Uuid) -> Result<WorkerRecord, CoreError> {
        let worker = self
            .store
            .set_worker_status(worker_id, WorkerState::Draining)
            .await?;
        self.broker
            .set_worker_flags(
                worker_id,
                WorkerFlags {
                    paused: false,
                    draining: true,
                },
            )
            .await?;

        if worker.current_load == 0 {
            self.broker.clear_worker_state(worker_id).await?;
            return Ok(self
                .store
                .set_worker_status(worker_id, WorkerState::Dead)
                .await?);
        }
        Ok(worker)
    }

    /// Update capacity; workers read this before each claim
    #[instrument(skip(self))]
    pub async fn update_capacity(
        &self,
        worker_id: Uuid,
        capacity: u32,
    ) -> Result<WorkerRecord, CoreError> {
        if capacity < 1 {
            return Err(CoreError::InvalidTask("capacity must be at least 1".into()));
        }
        let worker = self.store.set_worker_capacity(worker_id, capacity).await?;
        let mut config = self.broker.worker_config(worker_id).await?;
        config.capacity = Some(capacity);
        self.broker.set_worker_config(worker_id, config).await?;
        Ok(worker)
    }

    /// Update the per-attempt timeout applied to subsequent attempts
    #[instrument(skip(self))]
    pub async fn update_timeout(
        &self,
        worker_id: Uuid,
        timeout_seconds: u64,
    ) -> Result<(), CoreError> {
        if timeout_seconds < 1 {
            return Err(CoreError::InvalidTask("timeout must be at least 1s".into()));
        }
        // The override lives in the broker fabric only; the store keeps no
        // per-worker timeout column.
        self.store.get_worker(worker_id).await?;
        let mut config = self.broker.worker_config(worker_id).await?;
        config.timeout_seconds = Some(timeout_seconds);
        self.broker.set_worker_config(worker_id, config).await?;
        Ok(())
    }

    /// Force DEAD regardless of load; orphans are recovered by the next sweep
    #[instrument(skip(self))]
    pub async fn terminate(&self, worker_id: Uuid) -> Result<WorkerRecord, CoreError> {
        let worker = self
            .store
            .set_worker_status(worker_id, WorkerState::Dead)
            .await?;
        self.broker.clear_worker_state(worker_id).await?;
        warn!(%worker_id, "worker terminated administratively");
        Ok(worker)
    }

    /// One orphan-recovery sweep
    ///
    /// Expired live workers become DEAD; their RUNNING tasks fail with
    /// "worker expired" and go through the retry policy.
    #[instrument(skip(self))]
    pub async fn run_sweep(&self) -> Result<SweepReport, CoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.dead_timeout).unwrap_or_default();
        let expired = self.store.expired_workers(cutoff).await?;
        let mut report = SweepReport::default();

        let mut dead_ids: Vec<Uuid> = Vec::new();
        for worker in expired {
            warn!(
                worker_id = %worker.id,
                hostname = %worker.hostname,
                "worker heartbeat expired"
            );
            self.store
                .set_worker_status(worker.id, WorkerState::Dead)
                .await?;
            self.broker.clear_worker_state(worker.id).await?;
            let _ = self
                .broker
                .publish_alert(AlertEvent::new(
                    "worker.expired",
                    AlertSeverity::Warning,
                    serde_json::json!({
                        "worker_id": worker.id,
                        "hostname": worker.hostname,
                    }),
                ))
                .await;
            dead_ids.push(worker.id);
            report.dead_workers += 1;
        }

        // Also pick up tasks still assigned to workers that died earlier.
        for worker in self
            .store
            .list_workers(crate::store::WorkerFilter::by_status(WorkerState::Dead))
            .await?
        {
            if !dead_ids.contains(&worker.id) {
                dead_ids.push(worker.id);
            }
        }

        for worker_id in dead_ids {
            for task in self.store.running_tasks_for_worker(worker_id).await? {
                match self
                    .store
                    .transition(
                        task.id,
                        TaskStatus::Running,
                        StatusChange::Failed {
                            error: "worker expired".into(),
                        },
                    )
                    .await
                {
                    Ok(failed) => {
                        self.planner
                            .on_attempt_failed(&failed, ErrorClass::Transient)
                            .await?;
                        report.orphans_recovered += 1;
                    }
                    Err(crate::store::StoreError::InvalidTransition { .. }) => {
                        // The attempt resolved on its own in the meantime.
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        // Claims that were never acked: the attempt deadline plus grace has
        // passed, but the assigned worker still heartbeats. The dispatch loop
        // normally synthesizes TIMEOUT itself; this covers a loop that died.
        for task in self
            .store
            .stale_running(Utc::now(), self.config.claim_grace)
            .await?
        {
            match self
                .store
                .transition(
                    task.id,
                    TaskStatus::Running,
                    StatusChange::Failed {
                        error: "claim not acknowledged before deadline".into(),
                    },
                )
                .await
            {
                Ok(failed) => {
                    self.planner
                        .on_attempt_failed(&failed, ErrorClass::Timeout)
                        .await?;
                    report.orphans_recovered += 1;
                }
                Err(crate::store::StoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if report.dead_workers > 0 || report.orphans_recovered > 0 {
            info!(
                dead_workers = report.dead_workers,
                orphans = report.orphans_recovered,
                "orphan recovery sweep finished"
            );
        }
        Ok(report)
    }

    /// Run the sweep loop until shutdown
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_sweep().await {
                        error!("orphan recovery sweep failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    debug!("worker controller: shutdown requested");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::store::MemoryStore;
    use crate::task::{Task, TaskDescriptor};

    fn controller() -> (Arc<MemoryStore>, Arc<MemoryBroker>, WorkerController) {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let planner = Arc::new(RetryPlanner::new(store.clone(), broker.clone()));
        let controller = WorkerController::new(
            store.clone(),
            broker.clone(),
            planner,
            ControllerConfig::default(),
        );
        (store, broker, controller)
    }

    #[tokio::test]
    async fn test_register_uses_default_capacity() {
        let (_, _, controller) = controller();
        let worker = controller.register("host-a", None).await.unwrap();
        assert_eq!(worker.capacity, 5);
        assert_eq!(worker.status, WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_pause_resume_cycle() {
        let (_, broker, controller) = controller();
        let worker = controller.register("host-a", Some(2)).await.unwrap();

        let paused = controller.pause(worker.id).await.unwrap();
        assert_eq!(paused.status, WorkerState::Paused);
        assert!(broker.worker_flags(worker.id).await.unwrap().paused);

        // Idempotent
        let paused = controller.pause(worker.id).await.unwrap();
        assert_eq!(paused.status, WorkerState::Paused);

        let resumed = controller.resume(worker.id).await.unwrap();
        assert_eq!(resumed.status, WorkerState::Idle);
        assert!(!broker.worker_flags(worker.id).await.unwrap().paused);
    }

    #[tokio::test]
    async fn test_drain_with_zero_load_dies_immediately() {
        let (_, _, controller) = controller();
        let worker = controller.register("host-a", Some(2)).await.unwrap();

        let drained = controller.drain(worker.id).await.unwrap();
        assert_eq!(drained.status, WorkerState::Dead);
    }

    #[tokio::test]
    async fn test_drain_waits_for_load_then_heartbeat_retires() {
        let (_, _, controller) = controller();
        let worker = controller.register("host-a", Some(2)).await.unwrap();
        controller.heartbeat(worker.id, 1).await.unwrap();

        let drained = controller.drain(worker.id).await.unwrap();
        assert_eq!(drained.status, WorkerState::Draining);

        // Load drops to zero; the next heartbeat retires the worker
        let final_state = controller.heartbeat(worker.id, 0).await.unwrap();
        assert_eq!(final_state.status, WorkerState::Dead);
    }

    #[tokio::test]
    async fn test_heartbeat_flips_active_idle() {
        let (_, _, controller) = controller();
        let worker = controller.register("host-a", Some(2)).await.unwrap();

        let busy = controller.heartbeat(worker.id, 1).await.unwrap();
        assert_eq!(busy.status, WorkerState::Active);

        let idle = controller.heartbeat(worker.id, 0).await.unwrap();
        assert_eq!(idle.status, WorkerState::Idle);
    }

    #[tokio::test]
    async fn test_capacity_update_validation() {
        let (_, broker, controller) = controller();
        let worker = controller.register("host-a", Some(2)).await.unwrap();

        assert!(controller.update_capacity(worker.id, 0).await.is_err());

        let updated = controller.update_capacity(worker.id, 8).await.unwrap();
        assert_eq!(updated.capacity, 8);
        assert_eq!(
            broker.worker_config(worker.id).await.unwrap().capacity,
            Some(8)
        );
    }

    #[tokio::test]
    async fn test_timeout_update() {
        let (_, broker, controller) = controller();
        let worker = controller.register("host-a", Some(2)).await.unwrap();

        assert!(controller.update_timeout(worker.id, 0).await.is_err());
        controller.update_timeout(worker.id, 120).await.unwrap();
        assert_eq!(
            broker
                .worker_config(worker.id)
                .await
                .unwrap()
                .timeout_seconds,
            Some(120)
        );
    }

    #[tokio::test]
    async fn test_sweep_recovers_orphans() {
        let (store, _, controller) = controller();
        let worker = controller.register("host-a", Some(2)).await.unwrap();

        // A task running on the worker
        let task = Task::from_descriptor(TaskDescriptor::new("slow").with_max_retries(3));
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
                    worker_id: worker.id,
                },
            )
            .await
            .unwrap();

        // Heartbeat goes stale
        {
            let mut record = store.get_worker(worker.id).await.unwrap();
            record.status = WorkerState::Active;
            record.last_heartbeat = Some(Utc::now() - chrono::Duration::seconds(120));
            store.insert_worker(&record).await.unwrap();
        }

        let report = controller.run_sweep().await.unwrap();
        assert_eq!(report.dead_workers, 1);
        assert_eq!(report.orphans_recovered, 1);

        assert_eq!(
            store.get_worker(worker.id).await.unwrap().status,
            WorkerState::Dead
        );
        // The orphan went through the retry policy
        let recovered = store.get_task(task.id).await.unwrap();
        assert_eq!(recovered.status, TaskStatus::Retrying);
        assert_eq!(recovered.retry_count, 1);
        assert_eq!(
            recovered.error_message.as_deref(),
            Some("worker expired")
        );
    }

    #[tokio::test]
    async fn test_sweep_reclaims_unacked_claim() {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let planner = Arc::new(RetryPlanner::new(store.clone(), broker.clone()));
        let controller = WorkerController::new(
            store.clone(),
            broker.clone(),
            planner,
            ControllerConfig {
                claim_grace: Duration::from_secs(0),
                ..Default::default()
            },
        );
        let worker = controller.register("host-a", Some(1)).await.unwrap();
        controller.heartbeat(worker.id, 1).await.unwrap();

        // Attempt started long past its 1s deadline, worker still healthy
        let task = Task::from_descriptor(
            TaskDescriptor::new("hung").with_timeout(1).with_max_retries(1),
        );
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
                    worker_id: worker.id,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let report = controller.run_sweep().await.unwrap();
        assert_eq!(report.dead_workers, 0);
        assert_eq!(report.orphans_recovered, 1);

        let reclaimed = store.get_task(task.id).await.unwrap();
        assert_eq!(reclaimed.status, TaskStatus::Retrying);
    }

    #[tokio::test]
    async fn test_terminate_forces_dead() {
        let (store, _, controller) = controller();
        let worker = controller.register("host-a", Some(2)).await.unwrap();
        controller.heartbeat(worker.id, 2).await.unwrap();

        let dead = controller.terminate(worker.id).await.unwrap();
        assert_eq!(dead.status, WorkerState::Dead);
        assert_eq!(
            store.get_worker(worker.id).await.unwrap().status,
            WorkerState::Dead
        );
    }
}
