//! Events published to observers through a [`NotificationChannel`].
//!
//! Each event has a stable wire name (`controller:status`, `task:failed`, ...)
//! and a serde payload. Delivery is at-most-once; nothing in the controller
//! depends on an event being seen.
//!
//! [`NotificationChannel`]: crate::testing::NotificationChannel

use super::state::{ControllerStatus, Progress};
use crate::approval::{ApprovalActionType, ApprovalRequest, ApprovalStatus};
use crate::classifier::ActionKind;
use crate::usage::{UsageLimitStatus, UsageUpdate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Severity of a free-form controller message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ControllerEvent {
    #[serde(rename = "controller:status", rename_all = "camelCase")]
    Status {
        previous: ControllerStatus,
        status: ControllerStatus,
        reason: String,
    },

    #[serde(rename = "controller:usage", rename_all = "camelCase")]
    Usage {
        previous: UsageLimitStatus,
        status: UsageLimitStatus,
        hourly_percentage: f64,
        daily_percentage: f64,
        rolled_over: bool,
    },

    #[serde(rename = "controller:progress")]
    Progress(Progress),

    #[serde(rename = "controller:message")]
    Message { level: MessageLevel, message: String },

    #[serde(rename = "task:started", rename_all = "camelCase")]
    TaskStarted {
        task_id: String,
        title: String,
        session_id: String,
    },

    #[serde(rename = "task:completed", rename_all = "camelCase")]
    TaskCompleted {
        task_id: String,
        action: ActionKind,
        /// `true` when completion went through a human or rule approval.
        approved: bool,
    },

    #[serde(rename = "task:failed", rename_all = "camelCase")]
    TaskFailed {
        task_id: String,
        error: String,
        retry_count: u32,
        next_retry_at: Option<DateTime<Utc>>,
        permanent: bool,
    },

    #[serde(rename = "approval:requested")]
    ApprovalRequested(ApprovalRequest),

    #[serde(rename = "approval:resolved", rename_all = "camelCase")]
    ApprovalResolved {
        request_id: String,
        task_id: String,
        action_type: ApprovalActionType,
        status: ApprovalStatus,
        note: Option<String>,
    },
}

impl ControllerEvent {
    /// Stable wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ControllerEvent::Status { .. } => "controller:status",
            ControllerEvent::Usage { .. } => "controller:usage",
            ControllerEvent::Progress(_) => "controller:progress",
            ControllerEvent::Message { .. } => "controller:message",
            ControllerEvent::TaskStarted { .. } => "task:started",
            ControllerEvent::TaskCompleted { .. } => "task:completed",
            ControllerEvent::TaskFailed { .. } => "task:failed",
            ControllerEvent::ApprovalRequested(_) => "approval:requested",
            ControllerEvent::ApprovalResolved { .. } => "approval:resolved",
        }
    }

    #[must_use]
    pub fn usage(update: &UsageUpdate) -> Self {
        ControllerEvent::Usage {
            previous: update.previous_status,
            status: update.status,
            hourly_percentage: update.hourly_percentage,
            daily_percentage: update.daily_percentage,
            rolled_over: update.rolled_over,
        }
    }

    #[must_use]
    pub fn resolved(request: &ApprovalRequest) -> Self {
        ControllerEvent::ApprovalResolved {
            request_id: request.id.clone(),
            task_id: request.task_id.clone(),
            action_type: request.action_type,
            status: request.status,
            note: request.resolution_note.clone(),
        }
    }

    /// Payload as JSON, without the name.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        match serde_json::to_value(self) {
            Ok(mut value) => value
                .get_mut("payload")
                .map(serde_json::Value::take)
                .unwrap_or(serde_json::Value::Null),
            Err(_) => serde_json::Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let event = ControllerEvent::Status {
            previous: ControllerStatus::Idle,
            status: ControllerStatus::Running,
            reason: "activated".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "controller:status");
        assert_eq!(json["payload"]["status"], "running");
        assert_eq!(event.name(), "controller:status");
    }

    #[test]
    fn test_name_matches_serde_tag() {
        let events = [
            ControllerEvent::Message {
                level: MessageLevel::Info,
                message: "idle".into(),
            },
            ControllerEvent::TaskFailed {
                task_id: "t1".into(),
                error: "boom".into(),
                retry_count: 1,
                next_retry_at: None,
                permanent: false,
            },
            ControllerEvent::Progress(Progress::new("executing", 1, 3, "Running agent")),
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.name());
        }
    }

    #[test]
    fn test_payload_strips_envelope() {
        let event = ControllerEvent::TaskStarted {
            task_id: "t1".into(),
            title: "Write docs".into(),
            session_id: "s1".into(),
        };
        let payload = event.payload();
        assert_eq!(payload["taskId"], "t1");
        assert!(payload.get("event").is_none());
    }
}
