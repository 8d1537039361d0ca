//! Task data model and lifecycle state machine
//!
//! This module provides:
//! - [`TaskStatus`] and the legal transition table
//! - [`Task`] / [`TaskDescriptor`] - the unit of work and its policies
//! - [`WorkerRecord`] / [`WorkerState`] - executor registrations
//! - [`ExecutionRecord`] and [`DlqEntry`] - attempt history and dead letters

mod model;
mod status;

pub use model::{
    DependencyKind, DlqEntry, ExecutionRecord, Task, TaskDescriptor, WorkerRecord, WorkerState,
    MAX_NAME_LEN, MAX_PRIORITY, MAX_RETRIES_CEILING, MAX_TIMEOUT_SECONDS, MIN_PRIORITY,
    MIN_TIMEOUT_SECONDS,
};
pub use status::{is_valid_transition, TaskStatus};
