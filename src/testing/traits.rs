//! Trait definitions for the controller's external collaborators.
//!
//! These traits abstract the task store, the agent process, and the
//! observer-facing channels so the scheduling loop can be exercised
//! without real files, subprocesses, or alerting backends.

use crate::controller::events::ControllerEvent;
use crate::task::{Task, TaskUpdate};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Abstraction for the durable task store.
///
/// The controller only reads tasks and issues field updates; creation and
/// deletion belong to whoever authors the backlog.
///
/// # Example
///
/// ```rust,ignore
/// use foreman::testing::TaskStore;
///
/// async fn pending(store: &dyn TaskStore) -> Result<usize> {
///     Ok(store.list_tasks().await?.len())
/// }
/// ```
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// List every task.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Fetch a single task by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    async fn get(&self, id: &str) -> Result<Option<Task>>;

    /// Apply a partial update, returning the updated task or `None` if the
    /// id is unknown.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be written.
    async fn update(&self, id: &str, update: TaskUpdate) -> Result<Option<Task>>;
}

/// Token consumption reported by the agent for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Live context-window size of the agent's model, when known.
    #[serde(default)]
    pub context_window: Option<u64>,
}

/// One prompt-in/response-out invocation of the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl ExecutionRequest {
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_prompt: None,
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// Settlement value of an agent invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
    #[serde(default)]
    pub cost_usd: Option<f64>,
    #[serde(default)]
    pub tool_calls: u32,
}

impl ExecutionResult {
    /// Successful result with a response.
    #[must_use]
    pub fn succeeded(response: impl Into<String>) -> Self {
        Self {
            success: true,
            response: Some(response.into()),
            ..Self::default()
        }
    }

    /// Failed result with an error message.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        let context_window = self.token_usage.and_then(|u| u.context_window);
        self.token_usage = Some(TokenUsage {
            input_tokens,
            output_tokens,
            context_window,
        });
        self
    }

    #[must_use]
    pub fn with_context_window(mut self, context_window: u64) -> Self {
        let mut usage = self.token_usage.unwrap_or_default();
        usage.context_window = Some(context_window);
        self.token_usage = Some(usage);
        self
    }

    #[must_use]
    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }
}

/// Abstraction for the external coding agent.
///
/// A single call may take an unbounded amount of time; callers bound it and
/// may drop the future to cancel it.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run one prompt through the agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the agent could not be invoked at all. A run that
    /// completes but reports failure is `Ok` with `success == false`.
    async fn run(&self, request: ExecutionRequest) -> Result<ExecutionResult>;
}

/// Fire-and-forget channel to observers (UI clients, logs).
///
/// Delivery is at-most-once; losing an event must never affect the
/// controller.
pub trait NotificationChannel: Send + Sync {
    fn publish(&self, event: &ControllerEvent);
}

/// Best-effort external alerting (push notifications, paging).
#[async_trait]
pub trait AlertService: Send + Sync {
    /// Send an alert.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery failed. Callers log and move on.
    async fn send(&self, title: &str, message: &str, metadata: serde_json::Value) -> Result<()>;
}

/// Kind of a session log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Status,
    Prompt,
    Response,
    ToolCall,
    Usage,
    Error,
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogKind::Status => write!(f, "status"),
            LogKind::Prompt => write!(f, "prompt"),
            LogKind::Response => write!(f, "response"),
            LogKind::ToolCall => write!(f, "tool_call"),
            LogKind::Usage => write!(f, "usage"),
            LogKind::Error => write!(f, "error"),
        }
    }
}

/// Write-only, per-session activity log.
pub trait SessionLogStore: Send + Sync {
    fn append(&self, session_id: &str, kind: LogKind, content: &str);
}
