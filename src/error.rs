//! Custom error types for Foreman.
//!
//! This module provides structured error types that enable better
//! error handling, reporting, and recovery throughout the controller.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Foreman operations
#[derive(Error, Debug)]
pub enum ForemanError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Failed to load configuration
    #[error("Configuration error: {message}")]
    Config {
        message: String,
        path: Option<PathBuf>,
    },

    /// Invalid configuration value
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: String, reason: String },

    // =========================================================================
    // Task Store Errors
    // =========================================================================
    /// Task does not exist in the store
    #[error("Task not found: {id}")]
    TaskNotFound { id: String },

    /// Task store operation failed
    #[error("Task store error: {message}")]
    Store { message: String },

    // =========================================================================
    // Controller Errors
    // =========================================================================
    /// Requested controller transition is not valid from the current status
    #[error("Invalid controller transition: cannot {action} while {from}")]
    InvalidTransition { action: String, from: String },

    /// The controller actor is no longer running
    #[error("Controller is not running")]
    ControllerUnavailable,

    // =========================================================================
    // Approval Errors
    // =========================================================================
    /// Approval request is unknown or already resolved
    #[error("Approval request not found: {id}")]
    ApprovalNotFound { id: String },

    // =========================================================================
    // Session Errors
    // =========================================================================
    /// Session status change violates the session lifecycle
    #[error("Invalid session transition: {from} -> {to}")]
    InvalidSessionTransition { from: String, to: String },

    /// No execution is currently in flight
    #[error("No execution in flight")]
    NoActiveSession,

    // =========================================================================
    // Execution Errors
    // =========================================================================
    /// Agent executor failed
    #[error("Agent execution failed: {message}")]
    Executor { message: String },

    /// Agent executor exceeded its time budget
    #[error("Agent execution timed out after {timeout_secs}s")]
    ExecutionTimeout { timeout_secs: u64 },

    /// Missing required tool
    #[error("Missing required tool: {tool}")]
    MissingTool { tool: String },

    // =========================================================================
    // Alert Errors
    // =========================================================================
    /// Alert delivery failed
    #[error("Alert delivery failed: {message}")]
    Alert { message: String },

    // =========================================================================
    // Wrapped Errors
    // =========================================================================
    /// IO error wrapper
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON error wrapper
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic error wrapper
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForemanError {
    // =========================================================================
    // Constructor helpers
    // =========================================================================

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            path: None,
        }
    }

    /// Create a configuration error with path
    pub fn config_with_path(message: impl Into<String>, path: PathBuf) -> Self {
        Self::Config {
            message: message.into(),
            path: Some(path),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a task store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create an invalid transition error
    pub fn transition(action: impl Into<String>, from: impl std::fmt::Display) -> Self {
        Self::InvalidTransition {
            action: action.into(),
            from: from.to_string(),
        }
    }

    /// Create an executor error
    pub fn executor(message: impl Into<String>) -> Self {
        Self::Executor {
            message: message.into(),
        }
    }

    /// Create an alert error
    pub fn alert(message: impl Into<String>) -> Self {
        Self::Alert {
            message: message.into(),
        }
    }

    // =========================================================================
    // Classification helpers
    // =========================================================================

    /// Check if this error is recoverable by retrying the task later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Executor { .. }
                | Self::ExecutionTimeout { .. }
                | Self::Store { .. }
                | Self::Alert { .. }
                | Self::Io(_)
        )
    }

    /// Check if this error requires human intervention
    pub fn requires_human(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::InvalidConfig { .. }
                | Self::MissingTool { .. }
                | Self::ControllerUnavailable
        )
    }

    /// Get error code for exit status
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidTransition { .. } | Self::InvalidSessionTransition { .. } => 2,
            Self::TaskNotFound { .. } | Self::ApprovalNotFound { .. } => 3,
            Self::ControllerUnavailable => 4,
            Self::MissingTool { .. } => 6,
            Self::Config { .. } | Self::InvalidConfig { .. } => 7,
            _ => 1,
        }
    }
}

/// Type alias for Foreman results
pub type Result<T> = std::result::Result<T, ForemanError>;

/// Extension trait for converting foreign errors to ForemanError
pub trait IntoForemanError<T> {
    fn into_foreman_config(self) -> Result<T>;
    fn into_foreman_store(self) -> Result<T>;
    fn into_foreman_executor(self) -> Result<T>;
}

impl<T, E: Into<anyhow::Error>> IntoForemanError<T> for std::result::Result<T, E> {
    fn into_foreman_config(self) -> Result<T> {
        self.map_err(|e| ForemanError::config(e.into().to_string()))
    }

    fn into_foreman_store(self) -> Result<T> {
        self.map_err(|e| ForemanError::store(e.into().to_string()))
    }

    fn into_foreman_executor(self) -> Result<T> {
        self.map_err(|e| ForemanError::executor(e.into().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ForemanError::transition("pause", "idle");
        assert_eq!(
            err.to_string(),
            "Invalid controller transition: cannot pause while idle"
        );

        let err = ForemanError::ExecutionTimeout { timeout_secs: 90 };
        assert!(err.to_string().contains("90"));
    }

    #[test]
    fn test_is_recoverable() {
        assert!(ForemanError::executor("boom").is_recoverable());
        assert!(ForemanError::ExecutionTimeout { timeout_secs: 1 }.is_recoverable());
        assert!(!ForemanError::ApprovalNotFound { id: "a".into() }.is_recoverable());
        assert!(!ForemanError::config("bad").is_recoverable());
    }

    #[test]
    fn test_requires_human() {
        assert!(ForemanError::invalid_config("usageLimits", "zero").requires_human());
        assert!(ForemanError::MissingTool {
            tool: "claude".into()
        }
        .requires_human());
        assert!(!ForemanError::executor("transient").requires_human());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ForemanError::transition("resume", "running").exit_code(), 2);
        assert_eq!(
            ForemanError::TaskNotFound { id: "t1".into() }.exit_code(),
            3
        );
        assert_eq!(ForemanError::ControllerUnavailable.exit_code(), 4);
        assert_eq!(ForemanError::config("test").exit_code(), 7);
        assert_eq!(ForemanError::executor("x").exit_code(), 1);
    }

    #[test]
    fn test_config_with_path() {
        let path = PathBuf::from("/test/config.json");
        let err = ForemanError::config_with_path("failed to parse", path.clone());
        if let ForemanError::Config {
            message,
            path: opt_path,
        } = err
        {
            assert_eq!(message, "failed to parse");
            assert_eq!(opt_path, Some(path));
        } else {
            panic!("Wrong error variant");
        }
    }

    #[test]
    fn test_into_foreman_error_trait() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "tasks file missing",
        ));

        match result.into_foreman_store() {
            Err(ForemanError::Store { message }) => {
                assert!(message.contains("tasks file missing"));
            }
            other => panic!("Wrong error variant after conversion: {other:?}"),
        }
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: ForemanError = io_err.into();
        assert!(matches!(err, ForemanError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }
}
