//! Controller status and the observable state snapshot.

use crate::usage::{DailyUsage, HourlyUsage, TokenUsageTracker, UsageLimitConfig, UsageLimitStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Global status of the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerStatus {
    #[default]
    Idle,
    Running,
    Paused,
    WaitingApproval,
    WindingDown,
}

impl ControllerStatus {
    /// Whether the periodic tick should be armed in this status.
    #[must_use]
    pub fn needs_tick(&self) -> bool {
        matches!(
            self,
            ControllerStatus::Running
                | ControllerStatus::WaitingApproval
                | ControllerStatus::WindingDown
        )
    }

    /// Whether `pause()` is accepted from this status.
    #[must_use]
    pub fn can_pause(&self) -> bool {
        self.needs_tick()
    }
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerStatus::Idle => write!(f, "idle"),
            ControllerStatus::Running => write!(f, "running"),
            ControllerStatus::Paused => write!(f, "paused"),
            ControllerStatus::WaitingApproval => write!(f, "waiting_approval"),
            ControllerStatus::WindingDown => write!(f, "winding_down"),
        }
    }
}

/// Ephemeral progress of the in-flight task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub phase: String,
    pub step: u32,
    pub total_steps: u32,
    pub description: String,
}

impl Progress {
    #[must_use]
    pub fn new(phase: &str, step: u32, total_steps: u32, description: impl Into<String>) -> Self {
        Self {
            phase: phase.to_string(),
            step,
            total_steps,
            description: description.into(),
        }
    }
}

/// Observable controller state.
///
/// Owned and mutated by the controller alone; everyone else sees clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerState {
    pub status: ControllerStatus,
    pub current_task_id: Option<String>,
    pub current_session_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub processed_count: u64,
    pub approved_count: u64,
    pub rejected_count: u64,
    pub error_count: u64,
    pub current_progress: Option<Progress>,
    pub token_usage: HourlyUsage,
    pub daily_token_usage: DailyUsage,
    pub usage_limit_config: UsageLimitConfig,
    pub usage_limit_status: UsageLimitStatus,
    pub paused_due_to_limit: bool,
    pub pending_approvals: usize,
    pub status_message: Option<String>,
    pub last_tick_at: Option<DateTime<Utc>>,
}

impl ControllerState {
    /// Fresh `idle` state mirroring `usage`.
    #[must_use]
    pub fn new(usage: &TokenUsageTracker) -> Self {
        Self {
            status: ControllerStatus::Idle,
            current_task_id: None,
            current_session_id: None,
            started_at: None,
            processed_count: 0,
            approved_count: 0,
            rejected_count: 0,
            error_count: 0,
            current_progress: None,
            token_usage: *usage.hourly(),
            daily_token_usage: *usage.daily(),
            usage_limit_config: *usage.config(),
            usage_limit_status: usage.status(),
            paused_due_to_limit: false,
            pending_approvals: 0,
            status_message: None,
            last_tick_at: None,
        }
    }

    /// Copy the tracker's buckets and status into the snapshot.
    pub fn sync_usage(&mut self, usage: &TokenUsageTracker) {
        self.token_usage = *usage.hourly();
        self.daily_token_usage = *usage.daily();
        self.usage_limit_config = *usage.config();
        self.usage_limit_status = usage.status();
    }

    /// Drop the current task pointer and its progress.
    pub fn clear_current(&mut self) {
        self.current_task_id = None;
        self.current_session_id = None;
        self.current_progress = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_tick() {
        assert!(!ControllerStatus::Idle.needs_tick());
        assert!(!ControllerStatus::Paused.needs_tick());
        assert!(ControllerStatus::Running.needs_tick());
        assert!(ControllerStatus::WaitingApproval.needs_tick());
        assert!(ControllerStatus::WindingDown.needs_tick());
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let tracker = TokenUsageTracker::new(UsageLimitConfig::default(), Utc::now());
        let state = ControllerState::new(&tracker);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "idle");
        assert_eq!(json["usageLimitStatus"], "ok");
        assert!(json["tokenUsage"]["resetAt"].is_string());
        assert_eq!(json["pausedDueToLimit"], false);
    }
}
