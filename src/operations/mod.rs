//! Real implementations of the collaborator traits.
//!
//! These adapters talk to the file system, the `claude` CLI, and shell
//! commands. They implement the same traits as the mocks in
//! [`crate::testing`], so the binary wires them into the controller through
//! [`crate::controller::ControllerDependencies`].
//!
//! - [`JsonFileTaskStore`] - the backlog in `.foreman/tasks.json`
//! - [`ClaudeCliExecutor`] - one `claude -p` invocation per attempt
//! - [`TracingNotifier`], [`BroadcastNotifier`] - event sinks
//! - [`CommandAlertService`], [`NoopAlertService`] - external alerts
//! - [`JsonlSessionLog`] - per-session activity files

mod claude;
mod observers;
mod task_file;

pub use claude::{parse_claude_output, ClaudeCliExecutor};
pub use observers::{
    BroadcastNotifier, CommandAlertService, JsonlSessionLog, NoopAlertService, TracingNotifier,
};
pub use task_file::{JsonFileTaskStore, TaskFile};
