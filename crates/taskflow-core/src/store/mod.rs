//! Persistence layer: the authoritative record of tasks, workers, attempts,
//! dead letters, and breaker state
//!
//! This module provides:
//! - [`TaskStore`] trait with conditional-transition semantics
//! - [`MemoryStore`] for tests and single-process deployments
//! - [`PostgresStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;
pub use store::{
    BreakerRow, Pagination, StatusChange, StoreError, TaskFilter, TaskStore, WorkerFilter,
};
