//! Retry scheduling and dependency unblocking.
//!
//! Failed executions are never surfaced as hard faults. They are routed here,
//! where the task either gets a backoff-delayed retry or, once its retry
//! budget is spent, becomes terminally `failed`.
//!
//! # Architecture
//!
//! ```text
//! failed attempt ──> plan_retry ──> RetryDecision ──> TaskUpdate ──> TaskStore
//!
//! task done ──> plan_dependency_sweep ──> [(id, blocked|todo)] ──> TaskStore
//! ```
//!
//! The planning functions are pure; [`RetryScheduler`] applies them to a
//! [`TaskStore`].

use crate::error::{IntoForemanError, Result};
use crate::task::readiness::{done_ids, unmet_dependencies};
use crate::task::{Task, TaskStatus, TaskUpdate};
use crate::testing::TaskStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Backoff Constants and Calculation
// ============================================================================

/// Base backoff delay in milliseconds for retry attempts.
pub const RETRY_BACKOFF_BASE_MS: u64 = 60_000;

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 16 * 60_000;

/// Multiplier for exponential backoff.
pub const BACKOFF_MULTIPLIER: u64 = 2;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    RETRY_BACKOFF_BASE_MS
}

fn default_max_delay_ms() -> u64 {
    MAX_BACKOFF_MS
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: RETRY_BACKOFF_BASE_MS,
            max_delay_ms: MAX_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry_count` (already incremented).
    ///
    /// # Example
    ///
    /// ```
    /// use foreman::retry::RetryPolicy;
    /// use std::time::Duration;
    ///
    /// let policy = RetryPolicy::default();
    /// assert_eq!(policy.backoff(1), Duration::from_secs(120));
    /// assert_eq!(policy.backoff(2), Duration::from_secs(240));
    /// assert_eq!(policy.backoff(10), Duration::from_secs(16 * 60));
    /// ```
    #[must_use]
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let multiplier = BACKOFF_MULTIPLIER.saturating_pow(retry_count);
        let delay = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Calculate the default exponential backoff for a retry count.
#[must_use]
pub fn calculate_backoff(retry_count: u32) -> Duration {
    RetryPolicy::default().backoff(retry_count)
}

// ============================================================================
// Retry Decisions
// ============================================================================

/// Outcome of scheduling a retry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RetryDecision {
    /// The task goes back to `todo` and becomes selectable at `next_retry_at`.
    Retry {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Retry budget exhausted; the task is terminally failed.
    Failed { retry_count: u32 },
}

impl RetryDecision {
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        match self {
            RetryDecision::Retry { retry_count, .. } | RetryDecision::Failed { retry_count } => {
                *retry_count
            }
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, RetryDecision::Failed { .. })
    }

    /// Store update realizing this decision.
    #[must_use]
    pub fn to_update(&self, error: &str) -> TaskUpdate {
        match self {
            RetryDecision::Retry {
                retry_count,
                next_retry_at,
            } => TaskUpdate::new()
                .with_status(TaskStatus::Todo)
                .with_retry_count(*retry_count)
                .with_last_error(error)
                .with_next_retry_at(Some(*next_retry_at)),
            RetryDecision::Failed { retry_count } => TaskUpdate::new()
                .with_status(TaskStatus::Failed)
                .with_retry_count(*retry_count)
                .with_last_error(error)
                .with_next_retry_at(None),
        }
    }
}

/// Decide what happens to a task after a failed attempt.
#[must_use]
pub fn plan_retry(task: &Task, policy: &RetryPolicy, now: DateTime<Utc>) -> RetryDecision {
    let retry_count = task.retry_count.saturating_add(1);
    if retry_count >= task.max_retries {
        RetryDecision::Failed { retry_count }
    } else {
        let delay = policy.backoff(retry_count);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        RetryDecision::Retry {
            retry_count,
            next_retry_at: now + delay,
        }
    }
}

// ============================================================================
// Dependency Sweep
// ============================================================================

/// Status changes required to bring `blocked` flags in line with dependencies.
///
/// Only tasks that are neither `done` nor `in_progress` are considered, and
/// only the `blocked <-> todo` transitions are produced.
#[must_use]
pub fn plan_dependency_sweep(tasks: &[Task]) -> Vec<(String, TaskStatus)> {
    let done = done_ids(tasks);
    tasks
        .iter()
        .filter_map(|task| {
            let met = unmet_dependencies(task, &done).is_empty();
            match (task.status, met) {
                (TaskStatus::Blocked, true) => Some((task.id.clone(), TaskStatus::Todo)),
                (TaskStatus::Todo, false) => Some((task.id.clone(), TaskStatus::Blocked)),
                _ => None,
            }
        })
        .collect()
}

// ============================================================================
// Retry Scheduler
// ============================================================================

/// Applies retry and dependency decisions to a task store.
#[derive(Debug, Clone, Default)]
pub struct RetryScheduler {
    policy: RetryPolicy,
}

impl RetryScheduler {
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Record a failed attempt and schedule the next one.
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` if the task does not exist, or a store error.
    pub async fn schedule_retry(
        &self,
        store: &dyn TaskStore,
        task_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision> {
        let task = store
            .get(task_id)
            .await
            .into_foreman_store()?
            .ok_or_else(|| crate::ForemanError::TaskNotFound {
                id: task_id.to_string(),
            })?;

        let decision = plan_retry(&task, &self.policy, now);
        store
            .update(task_id, decision.to_update(error))
            .await
            .into_foreman_store()?;

        match &decision {
            RetryDecision::Retry {
                retry_count,
                next_retry_at,
            } => info!(
                "Task {} failed (attempt {}/{}), retrying at {}",
                task_id, retry_count, task.max_retries, next_retry_at
            ),
            RetryDecision::Failed { retry_count } => warn!(
                "Task {} failed permanently after {} attempts: {}",
                task_id, retry_count, error
            ),
        }

        Ok(decision)
    }

    /// Move tasks between `blocked` and `todo` according to their
    /// dependencies. Returns the applied changes.
    ///
    /// # Errors
    ///
    /// Returns a store error if the task list cannot be read. Individual
    /// update failures are logged and skipped.
    pub async fn sweep_dependencies(
        &self,
        store: &dyn TaskStore,
    ) -> Result<Vec<(String, TaskStatus)>> {
        let tasks = store.list_tasks().await.into_foreman_store()?;
        let changes = plan_dependency_sweep(&tasks);
        let mut applied = Vec::with_capacity(changes.len());

        for (id, status) in changes {
            match store.update(&id, TaskUpdate::status(status)).await {
                Ok(Some(_)) => {
                    debug!("Dependency sweep: {} -> {}", id, status);
                    applied.push((id, status));
                }
                Ok(None) => debug!("Dependency sweep: task {} vanished", id),
                Err(e) => warn!("Dependency sweep could not update {}: {}", id, e),
            }
        }

        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::select_next;
    use crate::testing::InMemoryTaskStore;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_backoff_sequence() {
        assert_eq!(calculate_backoff(1), Duration::from_secs(120));
        assert_eq!(calculate_backoff(2), Duration::from_secs(240));
        assert_eq!(calculate_backoff(3), Duration::from_secs(480));
        assert_eq!(calculate_backoff(4), Duration::from_secs(960));
        assert_eq!(calculate_backoff(5), Duration::from_secs(960));
    }

    #[test]
    fn test_backoff_monotonic_and_capped() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for count in 0..64 {
            let delay = policy.backoff(count);
            assert!(delay >= previous, "delay shrank at retry {count}");
            assert!(delay <= Duration::from_millis(MAX_BACKOFF_MS));
            previous = delay;
        }
    }

    #[test]
    fn test_custom_policy() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(5));
    }

    #[test]
    fn test_plan_retry_schedules_backoff() {
        let task = Task::new("t", "x").with_max_retries(3);
        let decision = plan_retry(&task, &RetryPolicy::default(), now());
        assert_eq!(
            decision,
            RetryDecision::Retry {
                retry_count: 1,
                next_retry_at: now() + chrono::Duration::minutes(2),
            }
        );
    }

    #[test]
    fn test_plan_retry_fails_at_budget() {
        let mut task = Task::new("t", "x").with_max_retries(2);
        task.retry_count = 1;
        let decision = plan_retry(&task, &RetryPolicy::default(), now());
        assert_eq!(decision, RetryDecision::Failed { retry_count: 2 });
        assert!(decision.is_terminal());

        let update = decision.to_update("boom");
        assert_eq!(update.status, Some(TaskStatus::Failed));
        assert_eq!(update.next_retry_at, Some(None));
    }

    #[tokio::test]
    async fn test_two_failures_exhaust_budget_of_two() {
        let store = InMemoryTaskStore::new(vec![Task::new("c", "flaky").with_max_retries(2)]);
        let scheduler = RetryScheduler::default();

        let first = scheduler
            .schedule_retry(&store, "c", "first error", now())
            .await
            .unwrap();
        assert!(!first.is_terminal());
        assert_eq!(store.task("c").unwrap().status, TaskStatus::Todo);

        let second = scheduler
            .schedule_retry(&store, "c", "second error", now())
            .await
            .unwrap();
        assert!(second.is_terminal());

        let task = store.task("c").unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.last_error.as_deref(), Some("second error"));

        // Failed tasks are never selected again, however far in the future.
        let far = now() + chrono::Duration::days(365);
        assert!(select_next(&store.snapshot(), far).is_none());
    }

    #[tokio::test]
    async fn test_retry_reenters_pool_after_delay() {
        let store = InMemoryTaskStore::new(vec![Task::new("t", "x")]);
        let scheduler = RetryScheduler::default();
        scheduler
            .schedule_retry(&store, "t", "timeout", now())
            .await
            .unwrap();

        let tasks = store.snapshot();
        assert!(select_next(&tasks, now()).is_none());
        let after = now() + chrono::Duration::minutes(2);
        assert_eq!(select_next(&tasks, after).unwrap().id, "t");
    }

    #[tokio::test]
    async fn test_schedule_retry_unknown_task() {
        let store = InMemoryTaskStore::new(Vec::new());
        let err = RetryScheduler::default()
            .schedule_retry(&store, "missing", "x", now())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::ForemanError::TaskNotFound { .. }));
    }

    #[test]
    fn test_plan_dependency_sweep() {
        let tasks = vec![
            Task::new("d", "dependent")
                .with_status(TaskStatus::Blocked)
                .with_blocked_by(["e"]),
            Task::new("e", "dependency").with_status(TaskStatus::Done),
            Task::new("f", "needs g").with_blocked_by(["g"]),
            Task::new("g", "running").with_status(TaskStatus::InProgress),
            Task::new("h", "failed dependent")
                .with_status(TaskStatus::Failed)
                .with_blocked_by(["g"]),
        ];
        let changes = plan_dependency_sweep(&tasks);
        assert_eq!(
            changes,
            vec![
                ("d".to_string(), TaskStatus::Todo),
                ("f".to_string(), TaskStatus::Blocked),
            ]
        );
    }

    #[tokio::test]
    async fn test_sweep_unblocks_after_dependency_done() {
        let store = InMemoryTaskStore::new(vec![
            Task::new("d", "dependent").with_blocked_by(["e"]),
            Task::new("e", "dependency"),
        ]);
        let scheduler = RetryScheduler::default();

        scheduler.sweep_dependencies(&store).await.unwrap();
        assert_eq!(store.task("d").unwrap().status, TaskStatus::Blocked);
        assert_eq!(select_next(&store.snapshot(), now()).unwrap().id, "e");

        store
            .update("e", TaskUpdate::status(TaskStatus::Done))
            .await
            .unwrap();
        let applied = scheduler.sweep_dependencies(&store).await.unwrap();
        assert_eq!(applied, vec![("d".to_string(), TaskStatus::Todo)]);
        assert_eq!(select_next(&store.snapshot(), now()).unwrap().id, "d");
    }
}
