//! Custom assertions for domain-specific testing.

use super::mocks::{InMemoryTaskStore, RecordingNotifier};
use crate::controller::{ControllerState, ControllerStatus};
use crate::task::TaskStatus;

/// Assert that a task in the store has the expected status.
///
/// # Panics
///
/// Panics if the task is missing or has a different status.
///
/// # Example
///
/// ```rust,ignore
/// assert_task_status(&store, "t1", TaskStatus::Done);
/// ```
pub fn assert_task_status(store: &InMemoryTaskStore, id: &str, expected: TaskStatus) {
    let task = store
        .task(id)
        .unwrap_or_else(|| panic!("Expected task {id} to exist in the store"));
    assert_eq!(
        task.status, expected,
        "Expected task {id} to be {expected}, but it was {}.\nLast error: {:?}",
        task.status, task.last_error
    );
}

/// Assert the controller status.
///
/// # Panics
///
/// Panics with the full state if the status differs.
pub fn assert_controller_status(state: &ControllerState, expected: ControllerStatus) {
    assert_eq!(
        state.status, expected,
        "Expected controller to be {expected}, but it was {}.\nState: {state:#?}",
        state.status
    );
}

/// Assert that at least one event with `name` was published.
///
/// # Panics
///
/// Panics listing the published event names if none matched.
pub fn assert_event_published(notifier: &RecordingNotifier, name: &str) {
    assert!(
        notifier.count(name) > 0,
        "Expected event {name} to be published.\nPublished: {:?}",
        notifier.names()
    );
}
