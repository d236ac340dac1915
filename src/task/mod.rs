//! Work items driven by the controller.
//!
//! This module contains the task model shared by the controller and the
//! task store adapters:
//! - [`Task`] - A unit of work owned by the task store
//! - [`TaskStatus`] / [`TaskPriority`] - Lifecycle and ordering enums
//! - [`TaskUpdate`] - Partial field update issued by the controller
//! - [`readiness`] - Selection predicate and next-task rule

pub mod readiness;

pub use readiness::{select_next, summarize, Readiness, ReadinessSummary};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default retry budget for tasks that do not specify one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ============================================================================
// Task Status
// ============================================================================

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be picked up
    #[default]
    Todo,
    /// Currently executing (or awaiting approval of its result)
    InProgress,
    /// Finished successfully
    Done,
    /// Retry budget exhausted
    Failed,
    /// Waiting on unfinished dependencies
    Blocked,
}

impl TaskStatus {
    /// Check if this status is terminal for the scheduler.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Todo => write!(f, "todo"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Blocked => write!(f, "blocked"),
        }
    }
}

// ============================================================================
// Task Priority
// ============================================================================

/// Scheduling priority. Declaration order is selection order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPriority::High => write!(f, "high"),
            TaskPriority::Medium => write!(f, "medium"),
            TaskPriority::Low => write!(f, "low"),
        }
    }
}

// ============================================================================
// Task
// ============================================================================

/// A unit of work.
///
/// # Example
///
/// ```
/// use foreman::task::{Task, TaskPriority, TaskStatus};
///
/// let task = Task::new("t1", "Add login form").with_priority(TaskPriority::High);
/// assert_eq!(task.status, TaskStatus::Todo);
/// assert_eq!(task.retry_count, 0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: TaskPriority,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Ids of tasks whose completion gates this one.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    /// Earliest time the task may run.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Task {
    /// Create a new `todo` task with medium priority.
    #[must_use]
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Todo,
            priority: TaskPriority::Medium,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            last_error: None,
            last_attempt_at: None,
            next_retry_at: None,
            blocked_by: Vec::new(),
            scheduled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_blocked_by<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.blocked_by = ids.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    #[must_use]
    pub fn with_next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    #[must_use]
    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Build the agent prompt for this task.
    #[must_use]
    pub fn prompt(&self) -> String {
        if self.description.trim().is_empty() {
            format!("Task: {}", self.title)
        } else {
            format!("Task: {}\n\n{}", self.title, self.description)
        }
    }
}

// ============================================================================
// Task Update
// ============================================================================

/// Partial update of the fields the controller is allowed to change.
///
/// `None` leaves a field untouched. Clearable fields use a nested option:
/// `Some(None)` clears them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub retry_count: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub last_attempt_at: Option<Option<DateTime<Utc>>>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
}

impl TaskUpdate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Update that only changes the status.
    #[must_use]
    pub fn status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    #[must_use]
    pub fn with_last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    #[must_use]
    pub fn with_last_attempt_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_attempt_at = Some(Some(at));
        self
    }

    #[must_use]
    pub fn with_next_retry_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    /// Check if the update changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Apply the update to a task, stamping `updated_at`.
    pub fn apply(&self, task: &mut Task, now: DateTime<Utc>) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(count) = self.retry_count {
            task.retry_count = count;
        }
        if let Some(ref error) = self.last_error {
            task.last_error = error.clone();
        }
        if let Some(at) = self.last_attempt_at {
            task.last_attempt_at = at;
        }
        if let Some(at) = self.next_retry_at {
            task.next_retry_at = at;
        }
        task.updated_at = now;
    }
}
