//! End-to-end controller tests through the actor handle and the real file
//! task store.

use chrono::Utc;
use foreman::controller::{
    Controller, ControllerDependencies, ControllerHandle, ControllerSettings, ControllerState,
    ControllerStatus,
};
use foreman::operations::JsonFileTaskStore;
use foreman::testing::{
    ExecutionResult, MemorySessionLog, MockAgentExecutor, MockAlertService, RecordingNotifier,
    TaskStore,
};
use foreman::usage::{UsageLimitConfig, UsageLimitStatus};
use foreman::{ApprovalActionType, ForemanError, Task, TaskPriority, TaskStatus};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Setup {
    _dir: TempDir,
    store: Arc<JsonFileTaskStore>,
    agent: Arc<MockAgentExecutor>,
    notifier: Arc<RecordingNotifier>,
    handle: ControllerHandle,
}

fn fast_settings() -> ControllerSettings {
    ControllerSettings {
        tick_interval: Duration::from_millis(10),
        ..ControllerSettings::default()
    }
}

fn setup(tasks: &[Task], agent: MockAgentExecutor, settings: ControllerSettings) -> Setup {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(JsonFileTaskStore::new(dir.path().join(".foreman/tasks.json")));
    store.save(tasks).unwrap();

    let agent = Arc::new(agent);
    let notifier = Arc::new(RecordingNotifier::new());
    let deps = ControllerDependencies {
        store: store.clone(),
        executor: agent.clone(),
        notifier: notifier.clone(),
        alerts: Arc::new(MockAlertService::new()),
        session_log: Arc::new(MemorySessionLog::new()),
    };
    let controller = Controller::new(settings, deps, Utc::now());

    Setup {
        _dir: dir,
        store,
        agent,
        notifier,
        handle: ControllerHandle::spawn(controller),
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

async fn status_of(store: &JsonFileTaskStore, id: &str) -> TaskStatus {
    store.get(id).await.unwrap().unwrap().status
}

#[tokio::test]
async fn test_priority_order_through_the_loop() {
    let tasks = [
        Task::new("b", "Low").with_priority(TaskPriority::Low),
        Task::new("a", "High").with_priority(TaskPriority::High),
    ];
    let s = setup(&tasks, MockAgentExecutor::new(), fast_settings());

    s.handle.activate().await.unwrap();
    wait_until(&s.handle, |st| st.processed_count == 2).await;

    let prompts = s.agent.prompts();
    assert!(prompts[0].contains("High"));
    assert!(prompts[1].contains("Low"));
    assert_eq!(status_of(&s.store, "a").await, TaskStatus::Done);
    assert_eq!(status_of(&s.store, "b").await, TaskStatus::Done);
}

#[tokio::test]
async fn test_retries_exhaust_to_failed() {
    let tasks = [Task::new("c", "Flaky").with_max_retries(2)];
    let settings = ControllerSettings {
        retry: foreman::retry::RetryPolicy {
            base_delay_ms: 1,
            max_delay_ms: 5,
        },
        ..fast_settings()
    };
    let agent = MockAgentExecutor::new().with_default(ExecutionResult::failed("boom"));
    let s = setup(&tasks, agent, settings);

    s.handle.activate().await.unwrap();
    let state = wait_until(&s.handle, |st| st.error_count == 2).await;
    assert_eq!(state.processed_count, 2);

    let task = s.store.get("c").await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.last_error.as_deref(), Some("boom"));
    assert_eq!(s.agent.call_count(), 2);
}

#[tokio::test]
async fn test_budget_winds_down_before_next_task() {
    let tasks = [Task::new("a", "First"), Task::new("b", "Second")];
    let settings = ControllerSettings {
        usage_limits: UsageLimitConfig {
            max_tokens_per_hour: 1000,
            ..UsageLimitConfig::default()
        },
        ..fast_settings()
    };
    let agent = MockAgentExecutor::new()
        .with_default(ExecutionResult::succeeded("Ran cargo test").with_usage(850, 0));
    let s = setup(&tasks, agent, settings);

    s.handle.activate().await.unwrap();
    let state = wait_until(&s.handle, |st| st.status == ControllerStatus::WindingDown).await;
    assert_eq!(state.usage_limit_status, UsageLimitStatus::ApproachingLimit);
    assert!(state.paused_due_to_limit);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(s.agent.call_count(), 1);
    assert_eq!(status_of(&s.store, "b").await, TaskStatus::Todo);
}

#[tokio::test]
async fn test_external_usage_update() {
    let settings = ControllerSettings {
        usage_limits: UsageLimitConfig {
            max_tokens_per_hour: 1000,
            ..UsageLimitConfig::default()
        },
        ..fast_settings()
    };
    let s = setup(&[], MockAgentExecutor::new(), settings);
    s.handle.activate().await.unwrap();

    let state = s.handle.update_token_usage(850, 0, None).await.unwrap();
    assert_eq!(state.status, ControllerStatus::WindingDown);
    assert_eq!(state.token_usage.total(), 850);
}

#[tokio::test]
async fn test_approval_gates_dependents() {
    let tasks = [
        Task::new("e", "Design the storage layer"),
        Task::new("d", "Implement storage")
            .with_status(TaskStatus::Blocked)
            .with_blocked_by(["e"]),
    ];
    let agent = MockAgentExecutor::new()
        .then(ExecutionResult::succeeded("Proposed an architecture"))
        .then(ExecutionResult::succeeded("Added the module"));
    let s = setup(&tasks, agent, fast_settings());

    s.handle.activate().await.unwrap();
    wait_until(&s.handle, |st| st.status == ControllerStatus::WaitingApproval).await;

    let pending = s.handle.pending_approvals().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].action_type, ApprovalActionType::Architecture);
    assert_eq!(status_of(&s.store, "d").await, TaskStatus::Blocked);

    s.handle.approve(&pending[0].id).await.unwrap();
    assert_eq!(status_of(&s.store, "e").await, TaskStatus::Done);

    wait_until(&s.handle, |st| st.processed_count == 2).await;
    assert_eq!(status_of(&s.store, "d").await, TaskStatus::Done);
    assert!(s.notifier.count("approval:resolved") >= 1);
}

#[tokio::test]
async fn test_reject_and_unknown_ids() {
    let agent = MockAgentExecutor::new().then(ExecutionResult::succeeded("git push origin main"));
    let s = setup(&[Task::new("a", "Release")], agent, fast_settings());

    s.handle.activate().await.unwrap();
    wait_until(&s.handle, |st| st.pending_approvals == 1).await;
    let id = s.handle.pending_approvals().await.unwrap()[0].id.clone();

    s.handle.reject(&id, Some("not today".into())).await.unwrap();
    let state = s.handle.state().await.unwrap();
    assert_eq!(state.rejected_count, 1);
    assert_eq!(state.status, ControllerStatus::Running);

    assert!(matches!(
        s.handle.approve(&id).await,
        Err(ForemanError::ApprovalNotFound { .. })
    ));
}

#[tokio::test]
async fn test_pause_stops_dispatch() {
    let s = setup(&[Task::new("a", "One")], MockAgentExecutor::new(), fast_settings());

    s.handle.activate().await.unwrap();
    s.handle.pause().await.unwrap();
    // Drain anything dispatched before the pause landed
    tokio::time::sleep(Duration::from_millis(30)).await;
    let calls = s.agent.call_count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(s.agent.call_count(), calls);

    let state = s.handle.resume().await.unwrap();
    assert_eq!(state.status, ControllerStatus::Running);
    wait_until(&s.handle, |st| st.processed_count == 1).await;
}

#[tokio::test]
async fn test_deactivate_returns_to_idle() {
    let agent = MockAgentExecutor::new().with_delay(Duration::from_secs(60));
    let s = setup(&[Task::new("a", "Slow")], agent, fast_settings());

    s.handle.activate().await.unwrap();
    wait_until(&s.handle, |st| st.current_task_id.is_some()).await;

    let state = s.handle.deactivate().await.unwrap();
    assert_eq!(state.status, ControllerStatus::Idle);
    assert!(state.current_task_id.is_none());
    assert_eq!(status_of(&s.store, "a").await, TaskStatus::Todo);

    assert!(matches!(
        s.handle.cancel_session().await,
        Err(ForemanError::NoActiveSession)
    ));
}
