//! The supervisory controller.
//!
//! The [`Controller`] aggregate owns every piece of mutable scheduling state:
//! the global status, the token budget, the approval queue and the single
//! in-flight execution. It is driven by one owner at a time, normally the
//! actor behind a [`ControllerHandle`].
//!
//! # Architecture
//!
//! ```text
//! tick ─► select_next ─► Dispatch ──(spawned)──► AgentExecutor
//!                                                     │
//!        complete_execution ◄──── ExecutionDone ◄─────┘
//!           │
//!           ├─► TokenUsageTracker ─► wind-down / recovery
//!           ├─► ActionClassifier ─► ApprovalQueue ─► waiting_approval
//!           │                       └─► task done ─► dependency sweep
//!           └─► failure ─► RetryScheduler (backoff or failed)
//! ```
//!
//! A tick only hands out a [`Dispatch`]; running it is the caller's job. While
//! a dispatch is outstanding every further tick reports [`TickOutcome::Busy`],
//! so at most one task is ever in flight.
//!
//! # Example
//!
//! ```rust,ignore
//! use foreman::controller::{Controller, ControllerDependencies, ControllerSettings, TickOutcome};
//!
//! let mut controller = Controller::new(ControllerSettings::default(), deps, Utc::now());
//! controller.activate(Utc::now()).await?;
//!
//! if let TickOutcome::Started(dispatch) = controller.tick(Utc::now()).await? {
//!     let done = dispatch.execute(controller.executor()).await;
//!     controller.complete_execution(done, Utc::now()).await?;
//! }
//! ```

pub mod actor;
pub mod events;
pub mod persistence;
pub mod state;

pub use actor::{ControllerCommand, ControllerHandle};
pub use events::{ControllerEvent, MessageLevel};
pub use persistence::{PersistedState, StatePersistence};
pub use state::{ControllerState, ControllerStatus, Progress};

use crate::approval::{
    ApprovalQueue, ApprovalRequest, ApprovalStatus, AutoApprovalRules, TimeoutAction,
    DEFAULT_APPROVAL_EXPIRY_MINUTES,
};
use crate::classifier::{ActionClassifier, ActionKind};
use crate::error::{ForemanError, IntoForemanError, Result};
use crate::retry::{RetryDecision, RetryPolicy, RetryScheduler};
use crate::session::SessionTracker;
use crate::task::{select_next, summarize, Task, TaskStatus, TaskUpdate};
use crate::testing::{
    AgentExecutor, AlertService, ExecutionRequest, ExecutionResult, LogKind,
    NotificationChannel, SessionLogStore, TaskStore,
};
use crate::usage::{TokenUsageTracker, UsageLimitConfig, UsageLimitStatus, UsageUpdate};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default interval between scheduling ticks.
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 10;

/// Default bound on one agent invocation.
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 30 * 60;

/// Error recorded on a task whose session was cancelled.
pub const CANCELLED_ERROR: &str = "execution cancelled";

// ============================================================================
// Settings and Dependencies
// ============================================================================

/// Tunables for one controller instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub tick_interval: Duration,
    pub execution_timeout: Duration,
    pub approval_expiry_minutes: i64,
    pub usage_limits: UsageLimitConfig,
    pub auto_approval: AutoApprovalRules,
    pub retry: RetryPolicy,
    pub system_prompt: Option<String>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(DEFAULT_TICK_INTERVAL_SECS),
            execution_timeout: Duration::from_secs(DEFAULT_EXECUTION_TIMEOUT_SECS),
            approval_expiry_minutes: DEFAULT_APPROVAL_EXPIRY_MINUTES,
            usage_limits: UsageLimitConfig::default(),
            auto_approval: AutoApprovalRules::default(),
            retry: RetryPolicy::default(),
            system_prompt: None,
        }
    }
}

/// External collaborators of the controller.
///
/// # Example
///
/// ```rust,ignore
/// use foreman::controller::ControllerDependencies;
/// use foreman::testing::{InMemoryTaskStore, MockAgentExecutor, RecordingNotifier, MockAlertService, MemorySessionLog};
///
/// let deps = ControllerDependencies {
///     store: Arc::new(InMemoryTaskStore::new(tasks)),
///     executor: Arc::new(MockAgentExecutor::new()),
///     notifier: Arc::new(RecordingNotifier::new()),
///     alerts: Arc::new(MockAlertService::new()),
///     session_log: Arc::new(MemorySessionLog::new()),
/// };
/// ```
#[derive(Clone)]
pub struct ControllerDependencies {
    pub store: Arc<dyn TaskStore>,
    pub executor: Arc<dyn AgentExecutor>,
    pub notifier: Arc<dyn NotificationChannel>,
    pub alerts: Arc<dyn AlertService>,
    pub session_log: Arc<dyn SessionLogStore>,
}

impl std::fmt::Debug for ControllerDependencies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControllerDependencies")
            .field("store", &"<dyn TaskStore>")
            .field("executor", &"<dyn AgentExecutor>")
            .field("notifier", &"<dyn NotificationChannel>")
            .field("alerts", &"<dyn AlertService>")
            .field("session_log", &"<dyn SessionLogStore>")
            .finish()
    }
}

// ============================================================================
// Dispatch and Completion
// ============================================================================

/// Work handed out by a tick: one agent invocation for one task.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub task_id: String,
    pub session_id: String,
    pub request: ExecutionRequest,
    pub timeout: Duration,
}

impl Dispatch {
    /// Run the invocation, bounded by the dispatch timeout.
    ///
    /// Never fails: invocation errors and timeouts become outcomes.
    pub async fn execute(self, executor: Arc<dyn AgentExecutor>) -> ExecutionDone {
        let outcome = match tokio::time::timeout(self.timeout, executor.run(self.request)).await {
            Ok(Ok(result)) => ExecutionOutcome::Finished(result),
            Ok(Err(e)) => ExecutionOutcome::Errored(format!("{e:#}")),
            Err(_) => ExecutionOutcome::TimedOut(self.timeout.as_secs()),
        };
        ExecutionDone {
            task_id: self.task_id,
            session_id: self.session_id,
            outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The agent ran to completion; `success` may still be false.
    Finished(ExecutionResult),
    /// The agent could not be invoked.
    Errored(String),
    /// The invocation exceeded its timeout (seconds).
    TimedOut(u64),
}

/// Settled dispatch, fed back through [`Controller::complete_execution`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionDone {
    pub task_id: String,
    pub session_id: String,
    pub outcome: ExecutionOutcome,
}

/// What a tick did.
#[derive(Debug)]
pub enum TickOutcome {
    /// Not `running`; nothing selected.
    Inactive(ControllerStatus),
    /// An execution is already in flight.
    Busy,
    /// Nothing is executable right now.
    NoTask(String),
    Started(Dispatch),
}

impl TickOutcome {
    #[must_use]
    pub fn report(&self) -> TickReport {
        match self {
            TickOutcome::Inactive(status) => TickReport::Inactive { status: *status },
            TickOutcome::Busy => TickReport::Busy,
            TickOutcome::NoTask(message) => TickReport::NoTask {
                message: message.clone(),
            },
            TickOutcome::Started(dispatch) => TickReport::Started {
                task_id: dispatch.task_id.clone(),
                session_id: dispatch.session_id.clone(),
            },
        }
    }
}

/// Serializable summary of a [`TickOutcome`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickReport {
    Inactive { status: ControllerStatus },
    Busy,
    NoTask { message: String },
    Started { task_id: String, session_id: String },
}

/// Requests resolved by one timeout sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutReport {
    pub expired: Vec<String>,
    pub auto_approved: Vec<String>,
}

struct InFlight {
    task: Task,
    session: SessionTracker,
}

// ============================================================================
// Controller
// ============================================================================

/// Supervisory controller state machine.
pub struct Controller {
    settings: ControllerSettings,
    deps: ControllerDependencies,
    state: ControllerState,
    usage: TokenUsageTracker,
    approvals: ApprovalQueue,
    rules: AutoApprovalRules,
    classifier: ActionClassifier,
    retry: RetryScheduler,
    in_flight: Option<InFlight>,
    persistence: Option<StatePersistence>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("status", &self.state.status)
            .field("current_task_id", &self.state.current_task_id)
            .field("pending_approvals", &self.approvals.len())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Create an `idle` controller with a fresh token budget.
    #[must_use]
    pub fn new(settings: ControllerSettings, deps: ControllerDependencies, now: DateTime<Utc>) -> Self {
        let usage = TokenUsageTracker::new(settings.usage_limits, now);
        let state = ControllerState::new(&usage);
        Self {
            approvals: ApprovalQueue::new(settings.approval_expiry_minutes),
            rules: settings.auto_approval.clone(),
            retry: RetryScheduler::new(settings.retry),
            classifier: ActionClassifier::standard(),
            in_flight: None,
            persistence: None,
            usage,
            state,
            settings,
            deps,
        }
    }

    #[must_use]
    pub fn with_classifier(mut self, classifier: ActionClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Attach snapshot persistence, restoring the token budget from an
    /// existing snapshot.
    #[must_use]
    pub fn with_persistence(mut self, persistence: StatePersistence) -> Self {
        match persistence.load() {
            Ok(Some(saved)) => {
                self.usage = TokenUsageTracker::restore(self.settings.usage_limits, saved.usage);
                self.state.sync_usage(&self.usage);
                info!(
                    "Restored token usage from {} ({} tokens this hour)",
                    persistence.state_file_path().display(),
                    self.usage.hourly().total()
                );
            }
            Ok(None) => {}
            Err(e) => warn!("Could not load controller state: {}", e),
        }
        self.persistence = Some(persistence);
        self
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    #[must_use]
    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    #[must_use]
    pub fn status(&self) -> ControllerStatus {
        self.state.status
    }

    #[must_use]
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    #[must_use]
    pub fn usage(&self) -> &TokenUsageTracker {
        &self.usage
    }

    #[must_use]
    pub fn pending_approvals(&self) -> &[ApprovalRequest] {
        self.approvals.pending()
    }

    #[must_use]
    pub fn auto_approval_rules(&self) -> &AutoApprovalRules {
        &self.rules
    }

    pub fn set_auto_approval_rules(&mut self, rules: AutoApprovalRules) {
        info!(
            "Auto-approval rules updated (enabled: {}, after {} min)",
            rules.enabled, rules.max_pending_time_minutes
        );
        self.rules = rules;
    }

    /// Session id of the in-flight execution, if any.
    #[must_use]
    pub fn in_flight_session(&self) -> Option<&str> {
        self.in_flight.as_ref().map(|f| f.session.id())
    }

    #[must_use]
    pub fn executor(&self) -> Arc<dyn AgentExecutor> {
        Arc::clone(&self.deps.executor)
    }

    /// Save a snapshot if persistence is attached. Failures are logged.
    pub fn persist(&self) {
        if let Some(persistence) = &self.persistence {
            let snapshot = PersistedState::new(self.state.clone(), self.usage.snapshot());
            if let Err(e) = persistence.save(&snapshot) {
                warn!("Failed to save controller state: {}", e);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Start scheduling. A no-op unless `idle`.
    ///
    /// # Errors
    ///
    /// Currently infallible; dependency sweep failures are logged.
    pub async fn activate(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state.status != ControllerStatus::Idle {
            debug!("Activate ignored while {}", self.state.status);
            return Ok(());
        }

        self.state.started_at = Some(now);
        self.state.status_message = None;
        self.sweep_dependencies().await;
        self.settle("activated");
        Ok(())
    }

    /// Stop scheduling and return to `idle`.
    ///
    /// The in-flight task (if any) goes back to `todo` without consuming a
    /// retry. Every pending approval is discarded and its task goes back to
    /// `todo` as well, so the work is redone and re-reviewed next time.
    ///
    /// # Errors
    ///
    /// Currently infallible; store failures while reverting are logged.
    pub async fn deactivate(&mut self, now: DateTime<Utc>) -> Result<()> {
        if let Some(in_flight) = self.in_flight.take() {
            self.revert_in_flight(in_flight, now).await;
        }

        let dropped = self.approvals.drain();
        if !dropped.is_empty() {
            info!("Discarded {} pending approval(s) on deactivation", dropped.len());
        }
        for request in &dropped {
            self.revert_to_todo(&request.task_id).await;
        }
        self.state.pending_approvals = 0;
        self.state.clear_current();
        self.state.paused_due_to_limit = false;
        self.state.status_message = None;
        self.set_status(ControllerStatus::Idle, "deactivated");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `InvalidTransition` unless running, waiting for approval or
    /// winding down.
    pub fn pause(&mut self) -> Result<()> {
        if !self.state.status.can_pause() {
            return Err(ForemanError::transition("pause", self.state.status));
        }
        self.set_status(ControllerStatus::Paused, "paused by operator");
        Ok(())
    }

    /// Leave `paused`, settling on the status the current queue and budget
    /// call for.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless paused.
    pub fn resume(&mut self) -> Result<()> {
        if self.state.status != ControllerStatus::Paused {
            return Err(ForemanError::transition("resume", self.state.status));
        }
        self.settle("resumed");
        Ok(())
    }

    fn set_status(&mut self, status: ControllerStatus, reason: &str) {
        let previous = self.state.status;
        if previous == status {
            return;
        }
        self.state.status = status;
        info!("Controller {} -> {} ({})", previous, status, reason);
        self.publish(ControllerEvent::Status {
            previous,
            status,
            reason: reason.to_string(),
        });
    }

    /// Status the controller belongs in when it is not paused or idle.
    fn settled_status(&self) -> ControllerStatus {
        if !self.approvals.is_empty() {
            ControllerStatus::WaitingApproval
        } else if self.usage.status().requires_wind_down() {
            ControllerStatus::WindingDown
        } else {
            ControllerStatus::Running
        }
    }

    fn settle(&mut self, reason: &str) {
        let target = self.settled_status();
        match target {
            ControllerStatus::WindingDown => self.state.paused_due_to_limit = true,
            ControllerStatus::Running => self.state.paused_due_to_limit = false,
            _ => {}
        }
        self.set_status(target, reason);
    }

    // ------------------------------------------------------------------------
    // Scheduling
    // ------------------------------------------------------------------------

    /// One scheduling decision.
    ///
    /// # Errors
    ///
    /// Returns a store error if the task list cannot be read or the selected
    /// task cannot be claimed.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Result<TickOutcome> {
        self.state.last_tick_at = Some(now);

        if self.state.status.needs_tick() {
            if let Some(update) = self.usage.roll_if_expired(now) {
                self.apply_usage_update(update);
            }
        }

        if self.state.status != ControllerStatus::Running {
            return Ok(TickOutcome::Inactive(self.state.status));
        }

        if self.in_flight.is_some() {
            debug!("Tick skipped: execution in flight");
            return Ok(TickOutcome::Busy);
        }

        let tasks = self.deps.store.list_tasks().await.into_foreman_store()?;
        let Some(task) = select_next(&tasks, now).cloned() else {
            let message = summarize(&tasks, now).idle_message();
            if self.state.status_message.as_deref() != Some(message.as_str()) {
                debug!("{}", message);
                self.publish(ControllerEvent::Message {
                    level: MessageLevel::Info,
                    message: message.clone(),
                });
                self.state.status_message = Some(message.clone());
            }
            return Ok(TickOutcome::NoTask(message));
        };

        self.dispatch(task, now).await
    }

    async fn dispatch(&mut self, task: Task, now: DateTime<Utc>) -> Result<TickOutcome> {
        let claim = TaskUpdate::status(TaskStatus::InProgress).with_last_attempt_at(now);
        let Some(task) = self
            .deps
            .store
            .update(&task.id, claim)
            .await
            .into_foreman_store()?
        else {
            warn!("Task {} disappeared before dispatch", task.id);
            return Ok(TickOutcome::NoTask(format!("Task {} disappeared", task.id)));
        };

        let mut session = SessionTracker::start(&task.id, Arc::clone(&self.deps.session_log), now);
        session.mark_running(now)?;
        let prompt = task.prompt();
        session.log(LogKind::Prompt, &prompt);
        let session_id = session.id().to_string();

        let progress = Progress::new("executing", 1, 2, format!("Running agent on \"{}\"", task.title));
        self.state.current_task_id = Some(task.id.clone());
        self.state.current_session_id = Some(session_id.clone());
        self.state.current_progress = Some(progress.clone());
        self.state.status_message = Some(format!("Working on \"{}\"", task.title));

        info!(
            "Dispatching task {} ({}) in session {}",
            task.id, task.title, session_id
        );
        self.publish(ControllerEvent::TaskStarted {
            task_id: task.id.clone(),
            title: task.title.clone(),
            session_id: session_id.clone(),
        });
        self.publish(ControllerEvent::Progress(progress));

        let dispatch = Dispatch {
            task_id: task.id.clone(),
            session_id,
            request: ExecutionRequest {
                prompt,
                system_prompt: self.settings.system_prompt.clone(),
            },
            timeout: self.settings.execution_timeout,
        };
        self.in_flight = Some(InFlight { task, session });
        Ok(TickOutcome::Started(dispatch))
    }

    /// Apply the result of a dispatch.
    ///
    /// Results for anything but the current in-flight session are ignored.
    ///
    /// # Errors
    ///
    /// Returns a store error if a failed attempt cannot be recorded.
    pub async fn complete_execution(&mut self, done: ExecutionDone, now: DateTime<Utc>) -> Result<()> {
        if self.in_flight_session() != Some(done.session_id.as_str()) {
            debug!("Discarding result of stale session {}", done.session_id);
            return Ok(());
        }
        let Some(InFlight { task, mut session }) = self.in_flight.take() else {
            return Ok(());
        };

        self.state.processed_count += 1;
        self.state.clear_current();

        match done.outcome {
            ExecutionOutcome::Finished(result) => {
                session.record_tool_calls(result.tool_calls);
                if let Some(usage) = result.token_usage {
                    session.record_usage(usage.input_tokens, usage.output_tokens, result.cost_usd);
                    self.update_token_usage(
                        usage.input_tokens,
                        usage.output_tokens,
                        usage.context_window,
                        now,
                    );
                }
                if result.success {
                    self.finish_success(task, session, result.response.unwrap_or_default(), now)
                        .await
                } else {
                    let error = result
                        .error
                        .unwrap_or_else(|| "agent reported failure".to_string());
                    self.finish_failure(task, session, &error, now).await
                }
            }
            ExecutionOutcome::Errored(error) => self.finish_failure(task, session, &error, now).await,
            ExecutionOutcome::TimedOut(timeout_secs) => {
                let error = ForemanError::ExecutionTimeout { timeout_secs }.to_string();
                self.finish_failure(task, session, &error, now).await
            }
        }
    }

    async fn finish_success(
        &mut self,
        task: Task,
        mut session: SessionTracker,
        response: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        session.log(LogKind::Response, &response);
        let classification = self.classifier.classify(&response, &task);
        debug!("Task {} classified as {}", task.id, classification.description);

        if let Err(e) = session.complete(Some(response.clone()), now) {
            debug!("Session {} not completed: {}", session.id(), e);
        }

        if let Some(request) = self.approvals.create(&task, &classification, &response, now) {
            self.state.pending_approvals = self.approvals.len();
            self.publish(ControllerEvent::ApprovalRequested(request.clone()));
            self.alert(
                format!("Approval needed: {}", task.title),
                request.description.clone(),
                json!({
                    "approvalId": request.id,
                    "taskId": request.task_id,
                    "actionType": request.action_type,
                    "expiresAt": request.expires_at,
                }),
            );
            if matches!(
                self.state.status,
                ControllerStatus::Running | ControllerStatus::WindingDown
            ) {
                self.set_status(ControllerStatus::WaitingApproval, "approval requested");
            }
            return Ok(());
        }

        if let Err(e) = self.mark_done(&task.id, classification.kind, false).await {
            self.revert_to_todo(&task.id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn finish_failure(
        &mut self,
        task: Task,
        mut session: SessionTracker,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Err(e) = session.fail(error, now) {
            debug!("Session {} not failed: {}", session.id(), e);
        }
        self.state.error_count += 1;
        if let Err(e) = self.schedule_retry(&task, error, now).await {
            self.revert_to_todo(&task.id).await;
            return Err(e);
        }
        Ok(())
    }

    async fn schedule_retry(&mut self, task: &Task, error: &str, now: DateTime<Utc>) -> Result<()> {
        let decision = self
            .retry
            .schedule_retry(self.deps.store.as_ref(), &task.id, error, now)
            .await?;

        let next_retry_at = match &decision {
            RetryDecision::Retry { next_retry_at, .. } => Some(*next_retry_at),
            RetryDecision::Failed { .. } => None,
        };
        self.publish(ControllerEvent::TaskFailed {
            task_id: task.id.clone(),
            error: error.to_string(),
            retry_count: decision.retry_count(),
            next_retry_at,
            permanent: decision.is_terminal(),
        });

        if decision.is_terminal() {
            self.alert(
                format!("Task failed: {}", task.title),
                error.to_string(),
                json!({
                    "taskId": task.id,
                    "retryCount": decision.retry_count(),
                }),
            );
        }
        Ok(())
    }

    async fn mark_done(&mut self, task_id: &str, action: ActionKind, approved: bool) -> Result<()> {
        match self
            .deps
            .store
            .update(task_id, TaskUpdate::status(TaskStatus::Done))
            .await
            .into_foreman_store()?
        {
            Some(_) => info!("Task {} done", task_id),
            None => warn!("Task {} vanished before it could be marked done", task_id),
        }
        self.publish(ControllerEvent::TaskCompleted {
            task_id: task_id.to_string(),
            action,
            approved,
        });
        self.sweep_dependencies().await;
        Ok(())
    }

    /// Last-resort recovery when a result cannot be recorded: put the task
    /// back in the queue rather than leave it `in_progress`.
    async fn revert_to_todo(&self, task_id: &str) {
        match self
            .deps
            .store
            .update(task_id, TaskUpdate::status(TaskStatus::Todo))
            .await
        {
            Ok(_) => info!("Task {} returned to todo", task_id),
            Err(e) => warn!("Could not revert task {}: {:#}", task_id, e),
        }
    }

    async fn sweep_dependencies(&self) {
        match self.retry.sweep_dependencies(self.deps.store.as_ref()).await {
            Ok(changes) if !changes.is_empty() => {
                debug!("Dependency sweep changed {} task(s)", changes.len());
            }
            Ok(_) => {}
            Err(e) => warn!("Dependency sweep failed: {}", e),
        }
    }

    async fn revert_in_flight(&mut self, mut in_flight: InFlight, now: DateTime<Utc>) {
        if let Err(e) = in_flight.session.cancel(now) {
            debug!("Session {} not cancelled: {}", in_flight.session.id(), e);
        }
        self.revert_to_todo(&in_flight.task.id).await;
    }

    /// Cancel the in-flight execution, scheduling a retry for its task.
    ///
    /// The controller keeps its status. Returns the cancelled session id.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveSession` when nothing is in flight, or a store error
    /// if the retry cannot be recorded.
    pub async fn cancel_session(&mut self, now: DateTime<Utc>) -> Result<String> {
        let Some(InFlight { task, mut session }) = self.in_flight.take() else {
            return Err(ForemanError::NoActiveSession);
        };
        let session_id = session.id().to_string();
        if let Err(e) = session.cancel(now) {
            debug!("Session {} not cancelled: {}", session_id, e);
        }
        self.state.clear_current();
        info!("Cancelled session {} for task {}", session_id, task.id);
        self.schedule_retry(&task, CANCELLED_ERROR, now).await?;
        Ok(session_id)
    }

    // ------------------------------------------------------------------------
    // Token Budget
    // ------------------------------------------------------------------------

    /// Record token usage and apply its effect on the controller status.
    pub fn update_token_usage(
        &mut self,
        input_tokens: u64,
        output_tokens: u64,
        context_window: Option<u64>,
        now: DateTime<Utc>,
    ) -> UsageUpdate {
        let update = self.usage.update(input_tokens, output_tokens, context_window, now);
        self.apply_usage_update(update);
        update
    }

    fn apply_usage_update(&mut self, update: UsageUpdate) {
        self.state.sync_usage(&self.usage);

        if update.status_changed() {
            self.publish(ControllerEvent::usage(&update));
            if update.status == UsageLimitStatus::Warning
                && update.previous_status < UsageLimitStatus::Warning
            {
                self.publish(ControllerEvent::Message {
                    level: MessageLevel::Warning,
                    message: format!(
                        "Token usage at {:.0}% of budget",
                        update.hourly_percentage.max(update.daily_percentage) * 100.0
                    ),
                });
            }
            if update.status == UsageLimitStatus::AtLimit {
                self.alert(
                    "Token budget exhausted".to_string(),
                    format!(
                        "Hourly {:.0}%, daily {:.0}%",
                        update.hourly_percentage * 100.0,
                        update.daily_percentage * 100.0
                    ),
                    json!({
                        "hourlyPercentage": update.hourly_percentage,
                        "dailyPercentage": update.daily_percentage,
                        "resetAt": self.usage.hourly().reset_at,
                    }),
                );
            }
        }

        let status = self.state.status;
        if update.status.requires_wind_down() && status == ControllerStatus::Running {
            self.state.paused_due_to_limit = true;
            self.set_status(ControllerStatus::WindingDown, "token budget threshold reached");
        } else if update.rolled_over
            && status == ControllerStatus::WindingDown
            && !update.status.requires_wind_down()
        {
            self.state.paused_due_to_limit = false;
            self.set_status(ControllerStatus::Running, "hourly window reset");
        }
    }

    // ------------------------------------------------------------------------
    // Approvals
    // ------------------------------------------------------------------------

    /// Approve a pending request and mark its task done.
    ///
    /// # Errors
    ///
    /// Returns `ApprovalNotFound` for unknown or already-resolved ids.
    pub async fn approve(&mut self, id: &str, now: DateTime<Utc>) -> Result<ApprovalRequest> {
        self.approve_with_note(id, None, now).await
    }

    async fn approve_with_note(
        &mut self,
        id: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest> {
        let (task_id, action_type) = match self.approvals.get(id) {
            Some(pending) => (pending.task_id.clone(), pending.action_type),
            None => return Err(ForemanError::ApprovalNotFound { id: id.to_string() }),
        };
        // The request stays pending until its task is recorded as done.
        self.mark_done(&task_id, action_type.into(), true).await?;

        let request = self.approvals.resolve(id, ApprovalStatus::Approved, note, now)?;
        self.state.approved_count += 1;
        self.state.pending_approvals = self.approvals.len();
        self.publish(ControllerEvent::resolved(&request));

        if self.state.status == ControllerStatus::WaitingApproval {
            self.settle("approval granted");
        }
        Ok(request)
    }

    /// Reject a pending request. The task is left as it is.
    ///
    /// # Errors
    ///
    /// Returns `ApprovalNotFound` for unknown or already-resolved ids.
    pub fn reject(
        &mut self,
        id: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest> {
        let request = self.approvals.resolve(id, ApprovalStatus::Rejected, reason, now)?;
        self.state.rejected_count += 1;
        self.state.pending_approvals = self.approvals.len();
        self.publish(ControllerEvent::resolved(&request));

        if self.state.status == ControllerStatus::WaitingApproval {
            self.settle("approval rejected");
        }
        Ok(request)
    }

    /// Expire overdue requests and auto-approve eligible ones.
    ///
    /// # Errors
    ///
    /// Propagates failures of the approve path.
    pub async fn process_approval_timeouts(&mut self, now: DateTime<Utc>) -> Result<TimeoutReport> {
        let mut report = TimeoutReport::default();

        for action in self.approvals.plan_timeouts(&self.rules, now) {
            match action {
                TimeoutAction::Expire(id) => {
                    let request = self.approvals.resolve(
                        &id,
                        ApprovalStatus::TimedOut,
                        Some("expired without a decision".to_string()),
                        now,
                    )?;
                    warn!(
                        "Approval {} for task {} expired",
                        request.id, request.task_id
                    );
                    self.publish(ControllerEvent::resolved(&request));
                    report.expired.push(id);
                }
                TimeoutAction::AutoApprove(id) => {
                    let note = format!(
                        "auto-approved after {} minutes pending",
                        self.rules.max_pending_time_minutes
                    );
                    self.approve_with_note(&id, Some(note), now).await?;
                    report.auto_approved.push(id);
                }
            }
        }

        self.state.pending_approvals = self.approvals.len();
        if !report.expired.is_empty() && self.state.status == ControllerStatus::WaitingApproval {
            self.settle("approval expired");
        }
        Ok(report)
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    fn publish(&self, event: ControllerEvent) {
        self.deps.notifier.publish(&event);
    }

    /// Fire-and-forget alert on a detached task.
    fn alert(&self, title: String, message: String, metadata: serde_json::Value) {
        let alerts = Arc::clone(&self.deps.alerts);
        tokio::spawn(async move {
            if let Err(e) = alerts.send(&title, &message, metadata).await {
                warn!("Alert \"{}\" not delivered: {:#}", title, e);
            }
        });
    }
}
