//! Worker host: registration, heartbeat, and `capacity` dispatch loops
//!
//! Parallelism on one worker comes from running `capacity` cooperative
//! dispatch loops over a shared load counter. Shutdown drains: loops stop
//! claiming, in-flight attempts finish, then the worker retires.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::controller::WorkerController;
use super::dispatch::{DispatchConfig, DispatchLoop};
use super::registry::HandlerRegistry;
use crate::broker::Broker;
use crate::error::CoreError;
use crate::retry::RetryPlanner;
use crate::store::TaskStore;

/// Worker host configuration
#[derive(Debug, Clone)]
pub struct WorkerHostConfig {
    pub hostname: String,

    /// Dispatch slots; defaults from the controller when absent
    pub capacity: Option<u32>,

    pub heartbeat_interval: Duration,

    /// Graceful shutdown bound
    pub shutdown_timeout: Duration,

    pub dispatch: DispatchConfig,
}

impl Default for WorkerHostConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            capacity: None,
            heartbeat_interval: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl WorkerHostConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = Some(capacity.max(1));
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }
}

/// One worker process: registration, heartbeat loop, dispatch loops
pub struct WorkerHost {
    store: Arc<dyn TaskStore>,
    broker: Arc<dyn Broker>,
    registry: Arc<HandlerRegistry>,
    planner: Arc<RetryPlanner>,
    controller: Arc<WorkerController>,
    config: WorkerHostConfig,

    load: Arc<AtomicU32>,
    worker_id: std::sync::Mutex<Option<Uuid>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerHost {
    pub fn new(
        store: Arc<dyn TaskStore>,
        broker: Arc<dyn Broker>,
        registry: Arc<HandlerRegistry>,
        planner: Arc<RetryPlanner>,
        controller: Arc<WorkerController>,
        config: WorkerHostConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            broker,
            registry,
            planner,
            controller,
            config,
            load: Arc::new(AtomicU32::new(0)),
            worker_id: std::sync::Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Registered worker id, once started
    pub fn worker_id(&self) -> Option<Uuid> {
        *self.worker_id.lock().unwrap()
    }

    /// Tasks currently in flight on this host
    pub fn current_load(&self) -> u32 {
        self.load.load(Ordering::Relaxed)
    }

    /// Register and start the heartbeat and dispatch loops
    #[instrument(skip(self), fields(hostname = %self.config.hostname))]
    pub async fn start(&self) -> Result<Uuid, CoreError> {
        let worker = self
            .controller
            .register(&self.config.hostname, self.config.capacity)
            .await?;
        *self.worker_id.lock().unwrap() = Some(worker.id);

        info!(
            worker_id = %worker.id,
            capacity = worker.capacity,
            handlers = ?self.registry.names(),
            "worker host starting"
        );

        let mut handles = self.handles.lock().unwrap();
        handles.push(self.spawn_heartbeat(worker.id));
        for slot in 0..worker.capacity {
            handles.push(self.spawn_dispatch(worker.id, slot));
        }

        Ok(worker.id)
    }

    /// Signal shutdown, wait for in-flight work, retire the worker
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        let Some(worker_id) = self.worker_id() else {
            return Ok(());
        };

        info!(%worker_id, "worker host draining");
        self.controller.drain(worker_id).await?;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let load = self.load.load(Ordering::Relaxed);
            if load == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(%worker_id, remaining = load, "shutdown timeout reached");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // Final heartbeat retires a drained worker at load zero.
        let _ = self
            .controller
            .heartbeat(worker_id, self.load.load(Ordering::Relaxed))
            .await;

        for handle in self.handles.lock().unwrap().drain(..) {
            handle.abort();
        }

        info!(%worker_id, "worker host stopped");
        Ok(())
    }

    fn spawn_heartbeat(&self, worker_id: Uuid) -> JoinHandle<()> {
        let controller = Arc::clone(&self.controller);
        let load = Arc::clone(&self.load);
        let interval = self.config.heartbeat_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let current = load.load(Ordering::Relaxed);
                        if let Err(e) = controller.heartbeat(worker_id, current).await {
                            error!(%worker_id, "heartbeat failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(%worker_id, "heartbeat loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_dispatch(&self, worker_id: Uuid, slot: u32) -> JoinHandle<()> {
        let dispatch = DispatchLoop::new(
            Arc::clone(&self.store),
            Arc::clone(&self.broker),
            Arc::clone(&self.registry),
            Arc::clone(&self.planner),
            worker_id,
            Arc::clone(&self.load),
            self.config.dispatch.clone(),
        );
        let shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            debug!(%worker_id, slot, "dispatch slot started");
            dispatch.run(shutdown_rx).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::store::MemoryStore;
    use crate::task::{Task, TaskDescriptor, TaskStatus, WorkerState};
    use crate::worker::controller::ControllerConfig;

    fn host(capacity: u32) -> (Arc<MemoryStore>, Arc<MemoryBroker>, Arc<HandlerRegistry>, WorkerHost) {
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let registry = Arc::new(HandlerRegistry::new());
        let planner = Arc::new(RetryPlanner::new(store.clone(), broker.clone()));
        let controller = Arc::new(WorkerController::new(
            store.clone(),
            broker.clone(),
            planner.clone(),
            ControllerConfig::default(),
        ));
        let config = WorkerHostConfig::new("test-host")
            .with_capacity(capacity)
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_dispatch(DispatchConfig {
                claim_timeout: Duration::from_millis(50),
                idle_sleep: Duration::from_millis(20),
                ..Default::default()
            });
        let host = WorkerHost::new(store.clone(), broker.clone(), registry.clone(), planner, controller, config);
        (store, broker, registry, host)
    }

    #[tokio::test]
    async fn test_end_to_end_execution() {
        let (store, broker, registry, host) = host(2);
        registry.register("echo", |ctx| async move {
            Ok(serde_json::json!({"name": ctx.task.descriptor.name}))
        });

        let worker_id = host.start().await.unwrap();

        let task = Task::from_descriptor(TaskDescriptor::new("echo").with_priority(8));
        store.insert_task(&task).await.unwrap();
        store
            .transition(task.id, TaskStatus::Pending, crate::store::StatusChange::Queued)
            .await
            .unwrap();
        broker.enqueue(task.id, 8).await.unwrap();

        // Give the dispatch loop a moment to claim and run
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if store.get_task(task.id).await.unwrap().status == TaskStatus::Completed {
                break;
            }
        }

        let done = store.get_task(task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.worker_id, Some(worker_id));

        host.shutdown().await.unwrap();
        let retired = store.get_worker(worker_id).await.unwrap();
        assert_eq!(retired.status, WorkerState::Dead);
    }

    #[tokio::test]
    async fn test_shutdown_without_start_is_noop() {
        let (_, _, _, host) = host(1);
        host.shutdown().await.unwrap();
    }
}
