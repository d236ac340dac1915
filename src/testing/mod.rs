//! Testing infrastructure for the controller.
//!
//! This module provides the collaborator traits, mocks, fixtures, and
//! assertions for exercising the scheduling loop without real files,
//! subprocesses, or alerting backends.
//!
//! # Architecture
//!
//! The testing infrastructure is organized into:
//! - **Traits**: Abstractions for external collaborators (task store, agent, observers)
//! - **Mocks**: Test doubles that implement the traits with controllable behavior
//! - **Fixtures**: Temporary project directories and a controller harness (test-only)
//! - **Assertions**: Custom assertions for domain-specific testing
//!
//! # Example
//!
//! ```rust,ignore
//! use foreman::testing::{InMemoryTaskStore, MockAgentExecutor, ExecutionResult};
//!
//! let store = InMemoryTaskStore::new(vec![Task::new("t1", "Write tests")]);
//! let agent = MockAgentExecutor::new()
//!     .then(ExecutionResult::failed("exit 1"))
//!     .then(ExecutionResult::succeeded("Ran cargo test"));
//! ```

pub mod assertions;
#[cfg(test)]
pub mod fixtures;
pub mod mocks;
pub mod traits;

// Re-export commonly used types
pub use assertions::*;
#[cfg(test)]
pub use fixtures::*;
pub use mocks::*;
pub use traits::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerEvent;
    use crate::task::{Task, TaskStatus, TaskUpdate};

    // =========================================================================
    // In-Memory Task Store Tests
    // =========================================================================

    #[tokio::test]
    async fn test_store_update_applies_fields() {
        let store = InMemoryTaskStore::new(vec![Task::new("t1", "One")]);
        let updated = store
            .update("t1", TaskUpdate::status(TaskStatus::Done))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Done);
        assert_eq!(store.update_count(), 1);
    }

    #[tokio::test]
    async fn test_store_unknown_id_is_none() {
        let store = InMemoryTaskStore::new(vec![]);
        let result = store.update("missing", TaskUpdate::new()).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_store_failing_updates() {
        let store = InMemoryTaskStore::new(vec![Task::new("t1", "One")]).with_failing_updates();
        assert!(store.update("t1", TaskUpdate::new()).await.is_err());
        assert_task_status(&store, "t1", TaskStatus::Todo);
    }

    #[tokio::test]
    async fn test_store_failing_status_only_blocks_that_status() {
        let store = InMemoryTaskStore::new(vec![Task::new("t1", "One")])
            .with_failing_status(TaskStatus::Done);
        assert!(store
            .update("t1", TaskUpdate::status(TaskStatus::Done))
            .await
            .is_err());
        store
            .update("t1", TaskUpdate::status(TaskStatus::InProgress))
            .await
            .unwrap();
        assert_task_status(&store, "t1", TaskStatus::InProgress);
    }

    // =========================================================================
    // Mock Agent Executor Tests
    // =========================================================================

    #[tokio::test]
    async fn test_mock_agent_default() {
        let agent = MockAgentExecutor::default();
        let result = agent.run(ExecutionRequest::new("hi")).await.unwrap();
        assert!(result.success);
        assert_eq!(agent.call_count(), 1);
        assert_eq!(agent.prompts(), vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn test_mock_agent_script_then_default() {
        let agent = MockAgentExecutor::new()
            .then(ExecutionResult::failed("exit 1"))
            .then_error("spawn failed");

        let first = agent.run(ExecutionRequest::new("a")).await.unwrap();
        assert!(!first.success);
        let second = agent.run(ExecutionRequest::new("b")).await;
        assert!(second.unwrap_err().to_string().contains("spawn failed"));
        let third = agent.run(ExecutionRequest::new("c")).await.unwrap();
        assert!(third.success);
    }

    // =========================================================================
    // Observer Mock Tests
    // =========================================================================

    #[test]
    fn test_recording_notifier() {
        let notifier = RecordingNotifier::new();
        notifier.publish(&ControllerEvent::TaskStarted {
            task_id: "t1".into(),
            title: "One".into(),
            session_id: "s1".into(),
        });
        assert_eq!(notifier.names(), vec!["task:started"]);
        assert_eq!(notifier.count("task:started"), 1);
        assert_event_published(&notifier, "task:started");
    }

    #[tokio::test]
    async fn test_mock_alert_service_records_failures() {
        let alerts = MockAlertService::new().with_error("pager down");
        let result = alerts.send("title", "body", serde_json::json!({})).await;
        assert!(result.is_err());
        assert_eq!(alerts.sent().len(), 1);
    }

    #[test]
    fn test_memory_session_log() {
        let log = MemorySessionLog::new();
        log.append("s1", LogKind::Prompt, "do it");
        log.append("s2", LogKind::Error, "boom");
        assert_eq!(log.entries().len(), 2);
        assert_eq!(log.for_session("s2")[0].kind, LogKind::Error);
    }

    // =========================================================================
    // Fixture Tests (only available in test builds)
    // =========================================================================

    #[test]
    fn test_fixture_with_tasks() {
        let fixture = TestFixture::with_tasks(&[Task::new("t1", "One")]);
        assert!(fixture.tasks_path().exists());
        assert!(fixture.foreman_dir().is_dir());
    }
}
