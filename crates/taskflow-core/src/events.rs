//! Event stream payloads
//!
//! Two broadcast topics leave the core: task completions (terminal status
//! changes) and operational alerts. Delivery is best-effort; observers that
//! miss events recover state by polling the store.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskStatus;

/// `(task-id, terminal-status)` message on the completion channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub task_id: Uuid,
    pub status: TaskStatus,
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// `(type, severity, metadata)` message on the alert channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: String,
    pub severity: AlertSeverity,
    pub metadata: serde_json::Value,
}

impl AlertEvent {
    pub fn new(
        kind: impl Into<String>,
        severity: AlertSeverity,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            severity,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_event_serialization() {
        let ev = CompletionEvent {
            task_id: Uuid::now_v7(),
            status: TaskStatus::Completed,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["status"], "completed");
    }

    #[test]
    fn test_alert_event() {
        let ev = AlertEvent::new(
            "worker.expired",
            AlertSeverity::Warning,
            serde_json::json!({"worker_id": "w-1"}),
        );
        assert_eq!(ev.kind, "worker.expired");
        assert_eq!(ev.severity, AlertSeverity::Warning);
    }
}
