//! Error types surfaced to collaborators of the core

use uuid::Uuid;

use crate::store::StoreError;

/// Errors surfaced by the core's public interfaces
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Task descriptor failed validation at the submit boundary
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// Cron expression is not a valid 5-field schedule
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Attempted lifecycle transition is not in the legal transition table
    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: Uuid,
        from: crate::task::TaskStatus,
        to: crate::task::TaskStatus,
    },

    /// Workflow graph contains a cycle; nothing was persisted
    #[error("cycle detected in workflow graph: {0}")]
    CycleDetected(String),

    /// Referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Admission rejected by a throughput cap or a capacity bound
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Circuit breaker for the named dependency is open
    #[error("circuit breaker open: {0}")]
    BreakerOpen(String),

    /// Durable store unreachable; retryable
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Broker fabric unreachable; retryable
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),
}

impl CoreError {
    /// Whether the caller may retry the same operation after a backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::StoreUnavailable(_) | CoreError::BrokerUnavailable(_)
        )
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TaskNotFound(id) => CoreError::NotFound(format!("task {id}")),
            StoreError::WorkerNotFound(id) => CoreError::NotFound(format!("worker {id}")),
            StoreError::DlqEntryNotFound(id) => CoreError::NotFound(format!("dlq entry {id}")),
            StoreError::InvalidTransition { task_id, from, to } => {
                CoreError::InvalidTransition { task_id, from, to }
            }
            StoreError::Database(msg) | StoreError::Serialization(msg) => {
                CoreError::StoreUnavailable(msg)
            }
        }
    }
}

impl From<crate::broker::BrokerError> for CoreError {
    fn from(err: crate::broker::BrokerError) -> Self {
        CoreError::BrokerUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoreError::StoreUnavailable("down".into()).is_retryable());
        assert!(CoreError::BrokerUnavailable("down".into()).is_retryable());
        assert!(!CoreError::InvalidTask("bad".into()).is_retryable());
        assert!(!CoreError::CycleDetected("a -> b -> a".into()).is_retryable());
    }

    #[test]
    fn test_store_error_conversion() {
        let id = Uuid::now_v7();
        let err: CoreError = StoreError::TaskNotFound(id).into();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
