//! Foreman - supervisory task controller for a coding agent
//!
//! Foreman drives an external coding agent through a backlog of tasks, one
//! at a time, while keeping token spend under an hourly and daily budget and
//! holding risky actions for human approval.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`controller`] - The state machine, its actor and its event stream
//! - [`task`] - Task model and readiness-based selection
//! - [`retry`] - Exponential backoff and the dependency sweep
//! - [`usage`] - Rolling hourly/daily token budget
//! - [`classifier`] - Rule-based classification of agent responses
//! - [`approval`] - Approval queue, expiry and auto-approval rules
//! - [`session`] - Per-attempt execution session tracking
//! - [`operations`] - Real adapters (task file, `claude` CLI, alerts, logs)
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Custom error types and handling
//! - [`testing`] - Testing infrastructure (traits, mocks, fixtures)
//!
//! # Example
//!
//! ```rust,ignore
//! use foreman::config::ForemanConfig;
//! use foreman::controller::{Controller, ControllerDependencies, ControllerHandle};
//!
//! let loaded = ForemanConfig::load(Path::new("."))?;
//! let controller = Controller::new(loaded.config.controller_settings(), deps, Utc::now());
//! let handle = ControllerHandle::spawn(controller);
//! handle.activate().await?;
//! ```

pub mod approval;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod error;
pub mod operations;
pub mod retry;
pub mod session;
pub mod task;
pub mod testing;
pub mod usage;

// Re-export commonly used types
pub use error::{ForemanError, IntoForemanError, Result};

pub use approval::{ApprovalActionType, ApprovalRequest, ApprovalStatus, AutoApprovalRules};
pub use classifier::{ActionClassifier, ActionKind, Classification};
pub use config::ForemanConfig;
pub use controller::{
    Controller, ControllerDependencies, ControllerEvent, ControllerHandle, ControllerSettings,
    ControllerState, ControllerStatus,
};
pub use task::{Task, TaskPriority, TaskStatus};
pub use usage::{TokenUsageTracker, UsageLimitConfig, UsageLimitStatus};

// Re-export testing types for convenience
pub use testing::{
    AgentExecutor, AlertService, InMemoryTaskStore, MockAgentExecutor, NotificationChannel,
    SessionLogStore, TaskStore,
};
