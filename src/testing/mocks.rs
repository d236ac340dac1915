//! Mock implementations of the collaborator traits.
//!
//! These mocks provide controllable test doubles for the task store, the
//! agent, and the observer channels, enabling deterministic controller tests.

use super::traits::{
    AgentExecutor, AlertService, ExecutionRequest, ExecutionResult, LogKind,
    NotificationChannel, SessionLogStore, TaskStore,
};
use crate::controller::events::ControllerEvent;
use crate::task::{Task, TaskStatus, TaskUpdate};
use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Task Store
// ============================================================================

/// In-memory task store.
///
/// # Example
///
/// ```rust,ignore
/// let store = InMemoryTaskStore::new(vec![Task::new("t1", "Write tests")]);
/// assert_eq!(store.snapshot().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<Vec<Task>>,
    update_count: AtomicU32,
    fail_updates: bool,
    fail_status: Option<TaskStatus>,
}

impl InMemoryTaskStore {
    #[must_use]
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            tasks: Mutex::new(tasks),
            update_count: AtomicU32::new(0),
            fail_updates: false,
            fail_status: None,
        }
    }

    /// Configure every update to fail.
    #[must_use]
    pub fn with_failing_updates(mut self) -> Self {
        self.fail_updates = true;
        self
    }

    /// Configure updates that set `status` to fail; others still apply.
    #[must_use]
    pub fn with_failing_status(mut self, status: TaskStatus) -> Self {
        self.fail_status = Some(status);
        self
    }

    /// Copy of the current task list.
    pub fn snapshot(&self) -> Vec<Task> {
        guard(&self.tasks).clone()
    }

    /// Copy of one task.
    pub fn task(&self, id: &str) -> Option<Task> {
        guard(&self.tasks).iter().find(|t| t.id == id).cloned()
    }

    /// Add or replace a task.
    pub fn upsert(&self, task: Task) {
        let mut tasks = guard(&self.tasks);
        match tasks.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task,
            None => tasks.push(task),
        }
    }

    /// Number of successful updates applied.
    pub fn update_count(&self) -> u32 {
        self.update_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn list_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.snapshot())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.task(id))
    }

    async fn update(&self, id: &str, update: TaskUpdate) -> Result<Option<Task>> {
        if self.fail_updates {
            bail!("store is read-only");
        }
        if self.fail_status.is_some() && update.status == self.fail_status {
            bail!("disk full while writing task {}", id);
        }
        let mut tasks = guard(&self.tasks);
        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(None);
        };
        update.apply(task, Utc::now());
        self.update_count.fetch_add(1, Ordering::SeqCst);
        Ok(Some(task.clone()))
    }
}

// ============================================================================
// Agent Executor
// ============================================================================

/// Scripted agent executor.
///
/// Results are consumed from the script in order; once the script is empty
/// the default result is returned.
///
/// # Example
///
/// ```rust,ignore
/// let agent = MockAgentExecutor::new()
///     .then(ExecutionResult::failed("exit 1"))
///     .then(ExecutionResult::succeeded("Ran cargo test, all green"));
/// ```
#[derive(Debug)]
pub struct MockAgentExecutor {
    script: Mutex<VecDeque<std::result::Result<ExecutionResult, String>>>,
    default_result: ExecutionResult,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
    call_count: AtomicU32,
}

impl Default for MockAgentExecutor {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_result: ExecutionResult::succeeded("Updated the implementation.")
                .with_usage(100, 50),
            delay: None,
            prompts: Mutex::new(Vec::new()),
            call_count: AtomicU32::new(0),
        }
    }
}

impl MockAgentExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a result.
    #[must_use]
    pub fn then(self, result: ExecutionResult) -> Self {
        guard(&self.script).push_back(Ok(result));
        self
    }

    /// Queue an invocation error.
    #[must_use]
    pub fn then_error(self, error: &str) -> Self {
        guard(&self.script).push_back(Err(error.to_string()));
        self
    }

    /// Set the result returned once the script is exhausted.
    #[must_use]
    pub fn with_default(mut self, result: ExecutionResult) -> Self {
        self.default_result = result;
        self
    }

    /// Delay every run, to simulate a slow agent.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Get the number of times run was called.
    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Prompts received so far.
    pub fn prompts(&self) -> Vec<String> {
        guard(&self.prompts).clone()
    }
}

#[async_trait]
impl AgentExecutor for MockAgentExecutor {
    async fn run(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        guard(&self.prompts).push(request.prompt);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = guard(&self.script).pop_front();
        match next {
            Some(Ok(result)) => Ok(result),
            Some(Err(error)) => bail!("{}", error),
            None => Ok(self.default_result.clone()),
        }
    }
}

// ============================================================================
// Notification Channel
// ============================================================================

/// Notifier that records every published event.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<ControllerEvent>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ControllerEvent> {
        guard(&self.events).clone()
    }

    /// Names of published events, in order.
    pub fn names(&self) -> Vec<&'static str> {
        guard(&self.events).iter().map(ControllerEvent::name).collect()
    }

    /// Number of events published under `name`.
    pub fn count(&self, name: &str) -> usize {
        guard(&self.events)
            .iter()
            .filter(|e| e.name() == name)
            .count()
    }
}

impl NotificationChannel for RecordingNotifier {
    fn publish(&self, event: &ControllerEvent) {
        guard(&self.events).push(event.clone());
    }
}

// ============================================================================
// Alert Service
// ============================================================================

/// Alert sent through [`MockAlertService`].
#[derive(Debug, Clone, PartialEq)]
pub struct SentAlert {
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
}

/// Alert service that records alerts and can be configured to fail.
#[derive(Debug, Default)]
pub struct MockAlertService {
    sent: Mutex<Vec<SentAlert>>,
    error: Option<String>,
}

impl MockAlertService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure every send to fail with an error.
    #[must_use]
    pub fn with_error(mut self, error: &str) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn sent(&self) -> Vec<SentAlert> {
        guard(&self.sent).clone()
    }
}

#[async_trait]
impl AlertService for MockAlertService {
    async fn send(&self, title: &str, message: &str, metadata: serde_json::Value) -> Result<()> {
        guard(&self.sent).push(SentAlert {
            title: title.to_string(),
            message: message.to_string(),
            metadata,
        });
        match &self.error {
            Some(error) => bail!("{}", error),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Session Log Store
// ============================================================================

/// Entry recorded by [`MemorySessionLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub session_id: String,
    pub kind: LogKind,
    pub content: String,
}

/// In-memory session log.
#[derive(Debug, Default)]
pub struct MemorySessionLog {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemorySessionLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        guard(&self.entries).clone()
    }

    /// Entries for one session.
    pub fn for_session(&self, session_id: &str) -> Vec<LogEntry> {
        guard(&self.entries)
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }
}

impl SessionLogStore for MemorySessionLog {
    fn append(&self, session_id: &str, kind: LogKind, content: &str) {
        guard(&self.entries).push(LogEntry {
            session_id: session_id.to_string(),
            kind,
            content: content.to_string(),
        });
    }
}
