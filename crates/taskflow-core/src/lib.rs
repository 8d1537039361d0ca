//! # TaskFlow Core
//!
//! The dispatch and execution plane of a distributed task queue: accepts
//! work items, persists them durably, dispatches them to workers by priority
//! and dependency constraints, tracks a strict lifecycle, retries transient
//! failures, and dead-letters the rest.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Submitter                             │
//! │     (validate, persist, release / schedule / gate)           │
//! └──────────────────────────────────────────────────────────────┘
//!                  │                              │
//!                  ▼                              ▼
//! ┌───────────────────────────┐   ┌──────────────────────────────┐
//! │        TaskStore          │   │           Broker             │
//! │  (authoritative rows,     │◄──┤  (priority queues, scheduled │
//! │   conditional transitions,│   │   set, pub/sub, rate limits) │
//! │   attempts, DLQ, breakers)│   └──────────────────────────────┘
//! └───────────────────────────┘                 ▲
//!                  ▲                            │
//!      ┌───────────┴───────────┬────────────────┼────────────────┐
//!      │                       │                │                │
//! ┌──────────┐        ┌───────────────┐  ┌────────────┐  ┌───────────────┐
//! │ Scheduler│        │ WorkerHost    │  │  Workflow  │  │  Worker       │
//! │ (timers, │        │ (dispatch x N,│  │  Engine    │  │  Controller   │
//! │  cron)   │        │  heartbeat)   │  │  (DAGs)    │  │  (sweeps)     │
//! └──────────┘        └───────────────┘  └────────────┘  └───────────────┘
//! ```
//!
//! The store is the single writer of authoritative state; every transition
//! is a conditional update keyed on the prior status, so concurrent writers
//! lose predictably. The broker fabric is a rebuildable cache in front of it.
//!
//! ## Example
//!
//! ```ignore
//! use taskflow_core::prelude::*;
//!
//! let store = Arc::new(MemoryStore::new());
//! let broker = Arc::new(MemoryBroker::new());
//! let config = CoreConfig::from_env();
//!
//! let submitter = Submitter::new(store.clone(), broker.clone(), config.clone());
//! let task_id = submitter
//!     .submit(TaskDescriptor::new("send_email").with_priority(8))
//!     .await?;
//! ```

pub mod breaker;
pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod submit;
pub mod task;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::breaker::{
        BreakerConfig, CircuitBreaker, CircuitState, DegradationStrategy, GracefulDegradation,
    };
    pub use crate::broker::{Broker, MemoryBroker, PriorityBand};
    pub use crate::config::CoreConfig;
    pub use crate::error::CoreError;
    pub use crate::events::{AlertEvent, AlertSeverity, CompletionEvent};
    pub use crate::retry::{ErrorClass, HandlerError, RetryPlanner, RetryPolicy, RetryStrategy};
    pub use crate::scheduler::Scheduler;
    pub use crate::store::{MemoryStore, PostgresStore, StatusChange, TaskStore};
    pub use crate::submit::Submitter;
    pub use crate::task::{Task, TaskDescriptor, TaskStatus, WorkerState};
    pub use crate::worker::{
        ControllerConfig, HandlerRegistry, WorkerController, WorkerHost, WorkerHostConfig,
    };
    pub use crate::workflow::{Condition, WorkflowEngine, WorkflowSpec, WorkflowTaskSpec};
}

// Re-export key types at crate root
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState, DegradationStrategy};
pub use broker::{Broker, MemoryBroker, PriorityBand};
pub use config::CoreConfig;
pub use error::CoreError;
pub use retry::{ErrorClass, HandlerError, RetryPlanner, RetryPolicy, RetryStrategy};
pub use scheduler::Scheduler;
pub use store::{MemoryStore, PostgresStore, TaskStore};
pub use submit::Submitter;
pub use task::{Task, TaskDescriptor, TaskStatus};
pub use worker::{HandlerRegistry, WorkerController, WorkerHost, WorkerHostConfig};
pub use workflow::{WorkflowEngine, WorkflowSpec};
