//! TaskFlow worker process
//!
//! Wires configuration, the store, the broker fabric, a handler registry,
//! and the dispatch host together, then runs until interrupted. With
//! DATABASE_URL set the worker persists through PostgreSQL; without it the
//! process runs self-contained on the in-memory store (useful for local
//! development).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use taskflow_core::broker::MemoryBroker;
use taskflow_core::retry::{HandlerError, RetryPlanner};
use taskflow_core::scheduler::Scheduler;
use taskflow_core::store::{MemoryStore, PostgresStore, TaskStore};
use taskflow_core::worker::{
    ControllerConfig, WorkerController, WorkerHost, WorkerHostConfig,
};
use taskflow_core::workflow::WorkflowEngine;
use taskflow_core::{CoreConfig, HandlerRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("taskflow_worker=info,taskflow_core=info")),
        )
        .init();

    tracing::info!("taskflow-worker starting...");

    let config = CoreConfig::from_env();
    let hostname = hostname_or_default();

    let store: Arc<dyn TaskStore> = match std::env::var("DATABASE_URL") {
        Ok(url) => {
            let pool = sqlx::PgPool::connect(&url)
                .await
                .context("failed to connect to DATABASE_URL")?;
            let store = PostgresStore::new(pool);
            store
                .run_migrations()
                .await
                .context("failed to run migrations")?;
            tracing::info!("using PostgreSQL store");
            Arc::new(store)
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            Arc::new(MemoryStore::new())
        }
    };
    let broker = Arc::new(MemoryBroker::new());

    let planner = Arc::new(
        RetryPlanner::new(store.clone(), broker.clone()).with_dlq_enabled(config.dlq_enabled),
    );
    let controller = Arc::new(WorkerController::new(
        store.clone(),
        broker.clone(),
        planner.clone(),
        ControllerConfig {
            dead_timeout: config.dead_timeout,
            sweep_interval: config.dead_timeout,
            default_capacity: config.worker_capacity,
            ..Default::default()
        },
    ));
    let engine = Arc::new(WorkflowEngine::new(store.clone(), broker.clone()));
    let scheduler = Arc::new(
        Scheduler::new(store.clone(), broker.clone())
            .with_poll_interval(config.scheduler_poll_interval),
    );

    let registry = Arc::new(HandlerRegistry::new());
    register_builtin_handlers(&registry);

    let host = WorkerHost::new(
        store,
        broker,
        registry,
        planner,
        controller.clone(),
        WorkerHostConfig::new(hostname)
            .with_capacity(config.worker_capacity)
            .with_heartbeat_interval(config.heartbeat_interval),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = {
        let scheduler = scheduler.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(rx).await })
    };
    let sweep_handle = {
        let controller = controller.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { controller.run(rx).await })
    };
    let engine_handle = {
        let engine = engine.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { engine.run(rx).await })
    };

    let worker_id = host.start().await.context("failed to start worker host")?;
    tracing::info!(%worker_id, capacity = config.worker_capacity, "worker running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("received shutdown signal, draining");

    let _ = shutdown_tx.send(true);
    host.shutdown().await.context("shutdown failed")?;

    scheduler_handle.abort();
    sweep_handle.abort();
    engine_handle.abort();

    tracing::info!("worker shutdown complete");
    Ok(())
}

fn hostname_or_default() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "taskflow-worker".to_string())
}

/// Example handlers so a fresh deployment has something to execute
fn register_builtin_handlers(registry: &HandlerRegistry) {
    registry.register("noop", |_| async { Ok(serde_json::json!({"status": "ok"})) });

    registry.register("sleep", |ctx| async move {
        let seconds = ctx
            .task
            .descriptor
            .kwargs
            .get("seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(1);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {
                Ok(serde_json::json!({"slept": seconds}))
            }
            _ = ctx.cancel.cancelled() => {
                Err(HandlerError::transient("cancelled at checkpoint"))
            }
        }
    });

    registry.register("echo", |ctx| async move {
        Ok(serde_json::json!({
            "args": ctx.task.descriptor.args,
            "kwargs": ctx.task.descriptor.kwargs,
        }))
    });
}
