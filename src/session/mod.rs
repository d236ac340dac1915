//! Execution session tracking.
//!
//! Every dispatch of a task to the agent opens a fresh [`ExecutionSession`].
//! A session moves forward through its lifecycle and ends in exactly one
//! terminal state; it is never reused for a second attempt.
//!
//! # Lifecycle
//!
//! ```text
//! starting ──► running ◄──► waiting_input
//!    │            │               │
//!    └────────────┴───────────────┴──► completed | failed | cancelled
//! ```
//!
//! [`SessionTracker`] validates each transition and mirrors activity into a
//! [`SessionLogStore`]. Illegal transitions are rejected without changing
//! anything.

use crate::error::{ForemanError, Result};
use crate::testing::{LogKind, SessionLogStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Lifecycle status of an execution session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Starting,
    Running,
    WaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is legal.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, to) if to.is_terminal() => true,
            (Starting, Running) | (Running, WaitingInput) | (WaitingInput, Running) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Running => write!(f, "running"),
            SessionStatus::WaitingInput => write!(f, "waiting_input"),
            SessionStatus::Completed => write!(f, "completed"),
            SessionStatus::Failed => write!(f, "failed"),
            SessionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One attempt at executing a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSession {
    pub id: String,
    pub task_id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tool_calls: u32,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

impl ExecutionSession {
    #[must_use]
    pub fn new(task_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.into(),
            status: SessionStatus::Starting,
            started_at: now,
            updated_at: now,
            ended_at: None,
            tool_calls: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            error: None,
            result: None,
        }
    }
}

/// Owns one session and its activity log.
pub struct SessionTracker {
    session: ExecutionSession,
    log: Arc<dyn SessionLogStore>,
}

impl fmt::Debug for SessionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTracker")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl SessionTracker {
    /// Open a session for `task_id` in the `starting` state.
    #[must_use]
    pub fn start(task_id: &str, log: Arc<dyn SessionLogStore>, now: DateTime<Utc>) -> Self {
        let session = ExecutionSession::new(task_id, now);
        log.append(
            &session.id,
            LogKind::Status,
            &format!("session started for task {task_id}"),
        );
        debug!("Session {} opened for task {}", session.id, task_id);
        Self { session, log }
    }

    #[must_use]
    pub fn session(&self) -> &ExecutionSession {
        &self.session
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.session.id
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.session.status
    }

    fn transition(&mut self, next: SessionStatus, now: DateTime<Utc>) -> Result<()> {
        let from = self.session.status;
        if !from.can_transition_to(next) {
            return Err(ForemanError::InvalidSessionTransition {
                from: from.to_string(),
                to: next.to_string(),
            });
        }
        self.session.status = next;
        self.session.updated_at = now;
        if next.is_terminal() {
            self.session.ended_at = Some(now);
        }
        self.log
            .append(&self.session.id, LogKind::Status, &format!("{from} -> {next}"));
        Ok(())
    }

    /// The agent call is underway.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSessionTransition` unless the session is `starting` or
    /// `waiting_input`.
    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(SessionStatus::Running, now)
    }

    /// # Errors
    ///
    /// Returns `InvalidSessionTransition` unless the session is `running`.
    pub fn mark_waiting_input(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(SessionStatus::WaitingInput, now)
    }

    pub fn record_tool_call(&mut self, name: &str) {
        self.session.tool_calls += 1;
        self.log.append(&self.session.id, LogKind::ToolCall, name);
    }

    /// Add tool calls reported in bulk by the agent.
    pub fn record_tool_calls(&mut self, count: u32) {
        if count > 0 {
            self.session.tool_calls += count;
            self.log.append(
                &self.session.id,
                LogKind::ToolCall,
                &format!("{count} tool call(s)"),
            );
        }
    }

    pub fn record_usage(&mut self, input_tokens: u64, output_tokens: u64, cost_usd: Option<f64>) {
        self.session.input_tokens += input_tokens;
        self.session.output_tokens += output_tokens;
        if let Some(cost) = cost_usd {
            self.session.cost_usd += cost;
        }
        self.log.append(
            &self.session.id,
            LogKind::Usage,
            &format!("input={input_tokens} output={output_tokens}"),
        );
    }

    pub fn log(&self, kind: LogKind, content: &str) {
        self.log.append(&self.session.id, kind, content);
    }

    /// # Errors
    ///
    /// Returns `InvalidSessionTransition` if the session already ended.
    pub fn complete(&mut self, result: Option<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(SessionStatus::Completed, now)?;
        self.session.result = result;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `InvalidSessionTransition` if the session already ended.
    pub fn fail(&mut self, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(SessionStatus::Failed, now)?;
        self.session.error = Some(error.to_string());
        self.log.append(&self.session.id, LogKind::Error, error);
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `InvalidSessionTransition` if the session already ended.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(SessionStatus::Cancelled, now)
    }
}
