//! Task lifecycle state machine
//!
//! Encodes the legal status transitions. Every lifecycle change goes through
//! the store's conditional transition, which consults this table; an attempt
//! outside the table fails and leaves state unchanged.

use serde::{Deserialize, Serialize};

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created but not yet released to a queue
    Pending,

    /// Waiting in a priority queue
    Queued,

    /// Claimed by a worker, attempt in flight
    Running,

    /// Finished successfully (or skipped by a gating condition)
    Completed,

    /// Last attempt failed; terminal once retries are exhausted
    Failed,

    /// Cancelled by an authorized caller
    Cancelled,

    /// Waiting for the next retry attempt
    Retrying,

    /// Last attempt exceeded its deadline
    Timeout,
}

impl TaskStatus {
    /// Legal successor statuses
    pub fn valid_next(&self) -> &'static [TaskStatus] {
        match self {
            TaskStatus::Pending => &[TaskStatus::Queued, TaskStatus::Cancelled],
            TaskStatus::Queued => &[TaskStatus::Running, TaskStatus::Cancelled],
            TaskStatus::Running => &[
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Timeout,
                TaskStatus::Cancelled,
            ],
            TaskStatus::Failed => &[TaskStatus::Retrying, TaskStatus::Cancelled],
            TaskStatus::Retrying => &[TaskStatus::Queued, TaskStatus::Cancelled],
            TaskStatus::Timeout => &[TaskStatus::Retrying, TaskStatus::Cancelled],
            TaskStatus::Completed | TaskStatus::Cancelled => &[],
        }
    }

    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        self.valid_next().is_empty()
    }
}

/// Check whether `from -> to` is in the legal transition table
pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    from.valid_next().contains(&to)
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Retrying => write!(f, "retrying"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "retrying" => Ok(Self::Retrying),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_transitions() {
        assert!(is_valid_transition(TaskStatus::Pending, TaskStatus::Queued));
        assert!(is_valid_transition(
            TaskStatus::Pending,
            TaskStatus::Cancelled
        ));
        assert!(!is_valid_transition(
            TaskStatus::Pending,
            TaskStatus::Running
        ));
        assert!(!is_valid_transition(
            TaskStatus::Pending,
            TaskStatus::Completed
        ));
    }

    #[test]
    fn test_running_transitions() {
        assert!(is_valid_transition(
            TaskStatus::Running,
            TaskStatus::Completed
        ));
        assert!(is_valid_transition(TaskStatus::Running, TaskStatus::Failed));
        assert!(is_valid_transition(
            TaskStatus::Running,
            TaskStatus::Timeout
        ));
        assert!(is_valid_transition(
            TaskStatus::Running,
            TaskStatus::Cancelled
        ));
        assert!(!is_valid_transition(TaskStatus::Running, TaskStatus::Queued));
    }

    #[test]
    fn test_retry_cycle() {
        assert!(is_valid_transition(
            TaskStatus::Failed,
            TaskStatus::Retrying
        ));
        assert!(is_valid_transition(
            TaskStatus::Timeout,
            TaskStatus::Retrying
        ));
        assert!(is_valid_transition(
            TaskStatus::Retrying,
            TaskStatus::Queued
        ));
        assert!(!is_valid_transition(
            TaskStatus::Retrying,
            TaskStatus::Running
        ));
        assert!(!is_valid_transition(TaskStatus::Failed, TaskStatus::Queued));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Timeout.is_terminal());
    }

    #[test]
    fn test_no_transition_out_of_terminal() {
        for to in [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Failed,
            TaskStatus::Retrying,
            TaskStatus::Timeout,
            TaskStatus::Cancelled,
        ] {
            assert!(!is_valid_transition(TaskStatus::Completed, to));
            assert!(!is_valid_transition(TaskStatus::Cancelled, to));
        }
    }

    #[test]
    fn test_round_trip_parse() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Retrying,
            TaskStatus::Timeout,
        ] {
            let parsed: TaskStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
