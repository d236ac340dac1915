//! Single-writer actor around [`Controller`].
//!
//! One tokio task owns the controller. Everyone else talks to it through a
//! cloneable [`ControllerHandle`], which sends [`ControllerCommand`]s over an
//! mpsc channel and awaits a oneshot reply. No lock ever guards controller
//! state.
//!
//! The actor multiplexes three sources:
//!
//! ```text
//! commands ──┐
//! ticker ────┼─► select! ─► Controller ─► persist
//! done_rx ───┘
//! ```
//!
//! The ticker only exists while the status needs ticking. Dispatches run on
//! their own spawned task and report back on `done_rx`; aborting that task
//! drops the executor future, which kills the agent process.

use super::{
    Controller, ControllerState, ExecutionDone, TickOutcome, TickReport, TimeoutReport,
};
use crate::approval::{ApprovalRequest, AutoApprovalRules};
use crate::error::{ForemanError, Result};
use chrono::Utc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Capacity of the command channel.
const COMMAND_BUFFER: usize = 32;

type Reply<T> = oneshot::Sender<T>;

/// Messages understood by the controller actor.
#[derive(Debug)]
pub enum ControllerCommand {
    Activate { reply: Reply<Result<ControllerState>> },
    Deactivate { reply: Reply<Result<ControllerState>> },
    Pause { reply: Reply<Result<ControllerState>> },
    Resume { reply: Reply<Result<ControllerState>> },
    Tick { reply: Reply<Result<TickReport>> },
    Approve {
        id: String,
        reply: Reply<Result<ApprovalRequest>>,
    },
    Reject {
        id: String,
        reason: Option<String>,
        reply: Reply<Result<ApprovalRequest>>,
    },
    ProcessApprovalTimeouts { reply: Reply<Result<TimeoutReport>> },
    CancelSession { reply: Reply<Result<String>> },
    UpdateTokenUsage {
        input_tokens: u64,
        output_tokens: u64,
        context_window: Option<u64>,
        reply: Reply<ControllerState>,
    },
    SetAutoApprovalRules {
        rules: AutoApprovalRules,
        reply: Reply<()>,
    },
    State { reply: Reply<ControllerState> },
    PendingApprovals { reply: Reply<Vec<ApprovalRequest>> },
    Shutdown { reply: Reply<ControllerState> },
}

/// Cloneable handle to a running controller actor.
///
/// # Example
///
/// ```rust,ignore
/// let handle = ControllerHandle::spawn(controller);
/// handle.activate().await?;
/// for request in handle.pending_approvals().await? {
///     handle.approve(&request.id).await?;
/// }
/// handle.shutdown().await?;
/// ```
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerCommand>,
}

impl ControllerHandle {
    /// Spawn the actor on the current tokio runtime.
    #[must_use]
    pub fn spawn(controller: Controller) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(run_actor(controller, rx));
        Self { tx }
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> ControllerCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ForemanError::ControllerUnavailable)?;
        rx.await.map_err(|_| ForemanError::ControllerUnavailable)
    }

    /// # Errors
    ///
    /// Returns `ControllerUnavailable` if the actor has stopped.
    pub async fn activate(&self) -> Result<ControllerState> {
        self.request(|reply| ControllerCommand::Activate { reply }).await?
    }

    /// # Errors
    ///
    /// Returns `ControllerUnavailable` if the actor has stopped.
    pub async fn deactivate(&self) -> Result<ControllerState> {
        self.request(|reply| ControllerCommand::Deactivate { reply })
            .await?
    }

    /// # Errors
    ///
    /// Returns `InvalidTransition` from the wrong status.
    pub async fn pause(&self) -> Result<ControllerState> {
        self.request(|reply| ControllerCommand::Pause { reply }).await?
    }

    /// # Errors
    ///
    /// Returns `InvalidTransition` unless paused.
    pub async fn resume(&self) -> Result<ControllerState> {
        self.request(|reply| ControllerCommand::Resume { reply }).await?
    }

    /// Run one tick now, outside the periodic schedule.
    ///
    /// # Errors
    ///
    /// Returns store errors from task selection.
    pub async fn tick(&self) -> Result<TickReport> {
        self.request(|reply| ControllerCommand::Tick { reply }).await?
    }

    /// # Errors
    ///
    /// Returns `ApprovalNotFound` for unknown or resolved ids.
    pub async fn approve(&self, id: &str) -> Result<ApprovalRequest> {
        let id = id.to_string();
        self.request(|reply| ControllerCommand::Approve { id, reply })
            .await?
    }

    /// # Errors
    ///
    /// Returns `ApprovalNotFound` for unknown or resolved ids.
    pub async fn reject(&self, id: &str, reason: Option<String>) -> Result<ApprovalRequest> {
        let id = id.to_string();
        self.request(|reply| ControllerCommand::Reject { id, reason, reply })
            .await?
    }

    /// # Errors
    ///
    /// Returns `ControllerUnavailable` if the actor has stopped.
    pub async fn process_approval_timeouts(&self) -> Result<TimeoutReport> {
        self.request(|reply| ControllerCommand::ProcessApprovalTimeouts { reply })
            .await?
    }

    /// Cancel the in-flight execution. Returns the cancelled session id.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveSession` when nothing is running.
    pub async fn cancel_session(&self) -> Result<String> {
        self.request(|reply| ControllerCommand::CancelSession { reply })
            .await?
    }

    /// # Errors
    ///
    /// Returns `ControllerUnavailable` if the actor has stopped.
    pub async fn update_token_usage(
        &self,
        input_tokens: u64,
        output_tokens: u64,
        context_window: Option<u64>,
    ) -> Result<ControllerState> {
        self.request(|reply| ControllerCommand::UpdateTokenUsage {
            input_tokens,
            output_tokens,
            context_window,
            reply,
        })
        .await
    }

    /// # Errors
    ///
    /// Returns `ControllerUnavailable` if the actor has stopped.
    pub async fn set_auto_approval_rules(&self, rules: AutoApprovalRules) -> Result<()> {
        self.request(|reply| ControllerCommand::SetAutoApprovalRules { rules, reply })
            .await
    }

    /// # Errors
    ///
    /// Returns `ControllerUnavailable` if the actor has stopped.
    pub async fn state(&self) -> Result<ControllerState> {
        self.request(|reply| ControllerCommand::State { reply }).await
    }

    /// # Errors
    ///
    /// Returns `ControllerUnavailable` if the actor has stopped.
    pub async fn pending_approvals(&self) -> Result<Vec<ApprovalRequest>> {
        self.request(|reply| ControllerCommand::PendingApprovals { reply })
            .await
    }

    /// Deactivate and stop the actor. Returns the final state.
    ///
    /// # Errors
    ///
    /// Returns `ControllerUnavailable` if the actor had already stopped.
    pub async fn shutdown(&self) -> Result<ControllerState> {
        self.request(|reply| ControllerCommand::Shutdown { reply })
            .await
    }
}

// ============================================================================
// Actor Loop
// ============================================================================

/// Spawned dispatch, keyed by session.
struct RunningExecution {
    session_id: String,
    handle: JoinHandle<()>,
}

impl RunningExecution {
    fn abort(self) {
        debug!("Aborting execution for session {}", self.session_id);
        self.handle.abort();
    }
}

enum Flow {
    Continue,
    Stop,
}

async fn run_actor(mut controller: Controller, mut commands: mpsc::Receiver<ControllerCommand>) {
    let period = controller.settings().tick_interval;
    let (done_tx, mut done_rx) = mpsc::channel::<ExecutionDone>(4);
    let mut ticker: Option<Interval> = None;
    let mut execution: Option<RunningExecution> = None;

    info!("Controller actor started (tick every {:?})", period);

    loop {
        sync_ticker(&mut ticker, &controller, period);

        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    debug!("All controller handles dropped");
                    break;
                };
                let flow = handle_command(command, &mut controller, &mut execution, &done_tx).await;
                if matches!(flow, Flow::Stop) {
                    break;
                }
            }
            () = next_tick(&mut ticker) => {
                if let Err(e) = run_tick(&mut controller, &mut execution, &done_tx).await {
                    log_failure("Tick failed", &e);
                }
            }
            Some(done) = done_rx.recv() => {
                if execution.as_ref().is_some_and(|e| e.session_id == done.session_id) {
                    execution = None;
                }
                if let Err(e) = controller.complete_execution(done, Utc::now()).await {
                    log_failure("Failed to record execution result", &e);
                }
            }
        }

        controller.persist();
    }

    if let Some(running) = execution.take() {
        running.abort();
    }
    info!("Controller actor stopped");
}

fn sync_ticker(ticker: &mut Option<Interval>, controller: &Controller, period: Duration) {
    let wanted = controller.status().needs_tick();
    match (wanted, ticker.is_some()) {
        (true, false) => {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            *ticker = Some(interval);
        }
        (false, true) => *ticker = None,
        _ => {}
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Transient failures (store hiccups) are retried on the next tick; anything
/// else is surfaced louder.
fn log_failure(context: &str, e: &ForemanError) {
    if e.is_recoverable() {
        warn!("{}: {}", context, e);
    } else {
        error!("{}: {}", context, e);
    }
}

async fn run_tick(
    controller: &mut Controller,
    execution: &mut Option<RunningExecution>,
    done_tx: &mpsc::Sender<ExecutionDone>,
) -> Result<TickReport> {
    let outcome = controller.tick(Utc::now()).await?;
    let report = outcome.report();
    if let TickOutcome::Started(dispatch) = outcome {
        let session_id = dispatch.session_id.clone();
        let executor = controller.executor();
        let done_tx = done_tx.clone();
        let handle = tokio::spawn(async move {
            let done = dispatch.execute(executor).await;
            if done_tx.send(done).await.is_err() {
                debug!("Controller gone before execution finished");
            }
        });
        *execution = Some(RunningExecution { session_id, handle });
    }
    Ok(report)
}

fn abort_execution(execution: &mut Option<RunningExecution>) {
    if let Some(running) = execution.take() {
        running.abort();
    }
}

fn send<T>(reply: Reply<T>, value: T) {
    if reply.send(value).is_err() {
        debug!("Caller dropped before the reply was sent");
    }
}

async fn handle_command(
    command: ControllerCommand,
    controller: &mut Controller,
    execution: &mut Option<RunningExecution>,
    done_tx: &mpsc::Sender<ExecutionDone>,
) -> Flow {
    let now = Utc::now();
    match command {
        ControllerCommand::Activate { reply } => {
            let result = controller.activate(now).await;
            send(reply, result.map(|()| controller.state().clone()));
        }
        ControllerCommand::Deactivate { reply } => {
            abort_execution(execution);
            let result = controller.deactivate(now).await;
            send(reply, result.map(|()| controller.state().clone()));
        }
        ControllerCommand::Pause { reply } => {
            let result = controller.pause();
            send(reply, result.map(|()| controller.state().clone()));
        }
        ControllerCommand::Resume { reply } => {
            let result = controller.resume();
            send(reply, result.map(|()| controller.state().clone()));
        }
        ControllerCommand::Tick { reply } => {
            send(reply, run_tick(controller, execution, done_tx).await);
        }
        ControllerCommand::Approve { id, reply } => {
            send(reply, controller.approve(&id, now).await);
        }
        ControllerCommand::Reject { id, reason, reply } => {
            send(reply, controller.reject(&id, reason, now));
        }
        ControllerCommand::ProcessApprovalTimeouts { reply } => {
            send(reply, controller.process_approval_timeouts(now).await);
        }
        ControllerCommand::CancelSession { reply } => {
            if controller.in_flight_session().is_some() {
                abort_execution(execution);
            }
            send(reply, controller.cancel_session(now).await);
        }
        ControllerCommand::UpdateTokenUsage {
            input_tokens,
            output_tokens,
            context_window,
            reply,
        } => {
            controller.update_token_usage(input_tokens, output_tokens, context_window, now);
            send(reply, controller.state().clone());
        }
        ControllerCommand::SetAutoApprovalRules { rules, reply } => {
            controller.set_auto_approval_rules(rules);
            send(reply, ());
        }
        ControllerCommand::State { reply } => {
            send(reply, controller.state().clone());
        }
        ControllerCommand::PendingApprovals { reply } => {
            send(reply, controller.pending_approvals().to_vec());
        }
        ControllerCommand::Shutdown { reply } => {
            abort_execution(execution);
            if let Err(e) = controller.deactivate(now).await {
                warn!("Deactivation during shutdown failed: {}", e);
            }
            controller.persist();
            send(reply, controller.state().clone());
            return Flow::Stop;
        }
    }
    Flow::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ControllerStatus, ControllerSettings};
    use crate::task::{Task, TaskStatus};
    use crate::testing::{ControllerHarness, ExecutionResult, MockAgentExecutor};

    fn settings() -> ControllerSettings {
        ControllerSettings {
            tick_interval: Duration::from_millis(10),
            ..ControllerSettings::default()
        }
    }

    async fn wait_until<F>(handle: &ControllerHandle, mut predicate: F) -> ControllerState
    where
        F: FnMut(&ControllerState) -> bool,
    {
        for _ in 0..400 {
            let state = handle.state().await.unwrap();
            if predicate(&state) {
                return state;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached: {:#?}", handle.state().await.unwrap());
    }

    #[tokio::test]
    async fn test_handle_drives_tasks_to_done() {
        let tasks = vec![Task::new("a", "One"), Task::new("b", "Two")];
        let h = ControllerHarness::with_settings(settings(), tasks, MockAgentExecutor::new(), Utc::now());
        let store = h.store.clone();
        let handle = ControllerHandle::spawn(h.controller);

        let state = handle.activate().await.unwrap();
        assert_eq!(state.status, ControllerStatus::Running);

        wait_until(&handle, |s| s.processed_count == 2).await;
        assert_eq!(store.task("a").unwrap().status, TaskStatus::Done);
        assert_eq!(store.task("b").unwrap().status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_invalid_transition_through_handle() {
        let h = ControllerHarness::with_settings(settings(), vec![], MockAgentExecutor::new(), Utc::now());
        let handle = ControllerHandle::spawn(h.controller);
        assert!(matches!(
            handle.resume().await,
            Err(ForemanError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_aborts_slow_execution() {
        let agent = MockAgentExecutor::new().with_delay(Duration::from_secs(60));
        let tasks = vec![Task::new("a", "Slow")];
        let h = ControllerHarness::with_settings(settings(), tasks, agent, Utc::now());
        let store = h.store.clone();
        let handle = ControllerHandle::spawn(h.controller);
        handle.activate().await.unwrap();

        wait_until(&handle, |s| s.current_session_id.is_some()).await;
        handle.cancel_session().await.unwrap();

        let state = handle.state().await.unwrap();
        assert_eq!(state.status, ControllerStatus::Running);
        assert!(state.current_task_id.is_none());
        let task = store.task("a").unwrap();
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.last_error.as_deref(), Some("execution cancelled"));
    }

    #[tokio::test]
    async fn test_shutdown_deactivates_and_stops() {
        let agent = MockAgentExecutor::new().with_delay(Duration::from_secs(60));
        let h = ControllerHarness::with_settings(settings(), vec![Task::new("a", "Slow")], agent, Utc::now());
        let store = h.store.clone();
        let handle = ControllerHandle::spawn(h.controller);
        handle.activate().await.unwrap();
        wait_until(&handle, |s| s.current_task_id.is_some()).await;

        let state = handle.shutdown().await.unwrap();
        assert_eq!(state.status, ControllerStatus::Idle);
        assert_eq!(store.task("a").unwrap().status, TaskStatus::Todo);
        assert!(matches!(
            handle.state().await,
            Err(ForemanError::ControllerUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_approval_round_trip_through_handle() {
        let agent = MockAgentExecutor::new().then(ExecutionResult::succeeded("git push origin main"));
        let h = ControllerHarness::with_settings(settings(), vec![Task::new("a", "Ship")], agent, Utc::now());
        let store = h.store.clone();
        let handle = ControllerHandle::spawn(h.controller);
        handle.activate().await.unwrap();

        wait_until(&handle, |s| s.status == ControllerStatus::WaitingApproval).await;
        let pending = handle.pending_approvals().await.unwrap();
        assert_eq!(pending.len(), 1);

        handle.approve(&pending[0].id).await.unwrap();
        assert_eq!(store.task("a").unwrap().status, TaskStatus::Done);
        let state = handle.state().await.unwrap();
        assert_eq!(state.approved_count, 1);
        assert_eq!(state.status, ControllerStatus::Running);
    }
}
