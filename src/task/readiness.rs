//! Task readiness and next-task selection.
//!
//! Selection is defined entirely by [`Readiness`], which is computed from a
//! task, the set of completed task ids and the current time. Keeping this pure
//! lets the selection rule be tested without a task store.

use super::{Task, TaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Why a task can or cannot be picked up right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Readiness {
    /// Eligible for execution.
    Ready,
    /// Not in the `todo` state.
    NotTodo { status: TaskStatus },
    /// Waiting on dependencies that are not done.
    BlockedBy { ids: Vec<String> },
    /// Backing off after a failed attempt.
    RetryAt { at: DateTime<Utc> },
    /// Not yet due.
    ScheduledAt { at: DateTime<Utc> },
}

impl Readiness {
    /// Compute readiness for a task.
    ///
    /// Dependencies on unknown ids count as unmet.
    #[must_use]
    pub fn of(task: &Task, done: &HashSet<&str>, now: DateTime<Utc>) -> Self {
        if task.status != TaskStatus::Todo {
            return Readiness::NotTodo {
                status: task.status,
            };
        }

        let unmet = unmet_dependencies(task, done);
        if !unmet.is_empty() {
            return Readiness::BlockedBy { ids: unmet };
        }

        if let Some(at) = task.next_retry_at {
            if at > now {
                return Readiness::RetryAt { at };
            }
        }

        if let Some(at) = task.scheduled_at {
            if at > now {
                return Readiness::ScheduledAt { at };
            }
        }

        Readiness::Ready
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => write!(f, "ready"),
            Readiness::NotTodo { status } => write!(f, "{status}"),
            Readiness::BlockedBy { ids } => write!(f, "blocked by {}", ids.join(", ")),
            Readiness::RetryAt { at } => write!(f, "retry at {}", at.format("%H:%M:%S")),
            Readiness::ScheduledAt { at } => {
                write!(f, "scheduled for {}", at.format("%Y-%m-%d %H:%M"))
            }
        }
    }
}

/// Ids of tasks that have status `done`.
#[must_use]
pub fn done_ids(tasks: &[Task]) -> HashSet<&str> {
    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Done)
        .map(|t| t.id.as_str())
        .collect()
}

/// Dependencies of `task` that are not in `done`, in declaration order.
#[must_use]
pub fn unmet_dependencies(task: &Task, done: &HashSet<&str>) -> Vec<String> {
    task.blocked_by
        .iter()
        .filter(|id| !done.contains(id.as_str()))
        .cloned()
        .collect()
}

/// Select the next executable task.
///
/// Ready tasks are ordered by priority, then creation time, then id so the
/// result is deterministic for a fixed task set and clock.
///
/// # Example
///
/// ```
/// use foreman::task::{select_next, Task, TaskPriority};
/// use chrono::Utc;
///
/// let tasks = vec![
///     Task::new("b", "later").with_priority(TaskPriority::Low),
///     Task::new("a", "first").with_priority(TaskPriority::High),
/// ];
/// assert_eq!(select_next(&tasks, Utc::now()).map(|t| t.id.as_str()), Some("a"));
/// ```
#[must_use]
pub fn select_next(tasks: &[Task], now: DateTime<Utc>) -> Option<&Task> {
    let done = done_ids(tasks);
    tasks
        .iter()
        .filter(|t| Readiness::of(t, &done, now).is_ready())
        .min_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        })
}

/// Counts of tasks per readiness class, used for idle status messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessSummary {
    pub ready: usize,
    pub blocked: usize,
    pub retrying: usize,
    pub scheduled: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
}

impl ReadinessSummary {
    /// Human-readable explanation for a tick that found nothing to run.
    #[must_use]
    pub fn idle_message(&self) -> String {
        let mut parts = Vec::new();
        if self.in_progress > 0 {
            parts.push(format!("{} in progress", self.in_progress));
        }
        if self.blocked > 0 {
            parts.push(format!("{} blocked on dependencies", self.blocked));
        }
        if self.retrying > 0 {
            parts.push(format!("{} waiting to retry", self.retrying));
        }
        if self.scheduled > 0 {
            parts.push(format!("{} scheduled for later", self.scheduled));
        }
        if parts.is_empty() {
            "No executable tasks".to_string()
        } else {
            format!("No executable tasks ({})", parts.join(", "))
        }
    }
}

/// Classify every task and count the results.
#[must_use]
pub fn summarize(tasks: &[Task], now: DateTime<Utc>) -> ReadinessSummary {
    let done = done_ids(tasks);
    let mut summary = ReadinessSummary::default();
    for task in tasks {
        match Readiness::of(task, &done, now) {
            Readiness::Ready => summary.ready += 1,
            Readiness::BlockedBy { .. } => summary.blocked += 1,
            Readiness::RetryAt { .. } => summary.retrying += 1,
            Readiness::ScheduledAt { .. } => summary.scheduled += 1,
            Readiness::NotTodo { status } => match status {
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Done => summary.done += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Blocked => summary.blocked += 1,
                TaskStatus::Todo => {}
            },
        }
    }
    summary
}
