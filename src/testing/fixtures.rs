//! Test fixtures for creating reproducible test environments.
//!
//! Provides temporary project directories and a fully mocked controller.

use super::mocks::{
    InMemoryTaskStore, MemorySessionLog, MockAgentExecutor, MockAlertService, RecordingNotifier,
    SentAlert,
};
use crate::controller::{
    Controller, ControllerDependencies, ControllerSettings, TickOutcome, TickReport,
};
use crate::operations::TaskFile;
use crate::task::Task;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A temporary project directory with a `.foreman/` folder.
///
/// Automatically cleans up when dropped.
pub struct TestFixture {
    temp_dir: TempDir,
}

impl TestFixture {
    /// Create a project with an empty `.foreman/` directory.
    ///
    /// # Panics
    ///
    /// Panics if temporary directory creation fails.
    #[must_use]
    pub fn empty_project() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        std::fs::create_dir_all(temp_dir.path().join(".foreman"))
            .expect("Failed to create .foreman");
        Self { temp_dir }
    }

    /// Create a project whose task file holds `tasks`.
    ///
    /// # Panics
    ///
    /// Panics if the task file cannot be written.
    #[must_use]
    pub fn with_tasks(tasks: &[Task]) -> Self {
        let fixture = Self::empty_project();
        let file = TaskFile {
            tasks: tasks.to_vec(),
        };
        std::fs::write(
            fixture.tasks_path(),
            serde_json::to_string_pretty(&file).expect("Failed to serialize tasks"),
        )
        .expect("Failed to write tasks.json");
        fixture
    }

    /// Write `.foreman/config.json`.
    ///
    /// # Panics
    ///
    /// Panics if the file cannot be written.
    pub fn write_config(&self, json: &str) {
        std::fs::write(self.foreman_dir().join("config.json"), json)
            .expect("Failed to write config.json");
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    #[must_use]
    pub fn foreman_dir(&self) -> PathBuf {
        self.path().join(".foreman")
    }

    #[must_use]
    pub fn tasks_path(&self) -> PathBuf {
        self.foreman_dir().join("tasks.json")
    }
}

/// A controller wired to mocks, with handles on every mock.
pub struct ControllerHarness {
    pub controller: Controller,
    pub store: Arc<InMemoryTaskStore>,
    pub agent: Arc<MockAgentExecutor>,
    pub notifier: Arc<RecordingNotifier>,
    pub alerts: Arc<MockAlertService>,
    pub log: Arc<MemorySessionLog>,
}

impl ControllerHarness {
    #[must_use]
    pub fn new(tasks: Vec<Task>, agent: MockAgentExecutor, now: DateTime<Utc>) -> Self {
        Self::with_settings(ControllerSettings::default(), tasks, agent, now)
    }

    #[must_use]
    pub fn with_settings(
        settings: ControllerSettings,
        tasks: Vec<Task>,
        agent: MockAgentExecutor,
        now: DateTime<Utc>,
    ) -> Self {
        Self::with_store(settings, InMemoryTaskStore::new(tasks), agent, now)
    }

    /// Harness over a preconfigured store (e.g. one with failing writes).
    #[must_use]
    pub fn with_store(
        settings: ControllerSettings,
        store: InMemoryTaskStore,
        agent: MockAgentExecutor,
        now: DateTime<Utc>,
    ) -> Self {
        let store = Arc::new(store);
        let agent = Arc::new(agent);
        let notifier = Arc::new(RecordingNotifier::new());
        let alerts = Arc::new(MockAlertService::new());
        let log = Arc::new(MemorySessionLog::new());

        let deps = ControllerDependencies {
            store: store.clone(),
            executor: agent.clone(),
            notifier: notifier.clone(),
            alerts: alerts.clone(),
            session_log: log.clone(),
        };

        Self {
            controller: Controller::new(settings, deps, now),
            store,
            agent,
            notifier,
            alerts,
            log,
        }
    }

    /// Tick once and, if a task was dispatched, run it to completion.
    ///
    /// # Panics
    ///
    /// Panics if the tick or the completion returns an error.
    pub async fn run_tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let outcome = self.controller.tick(now).await.expect("tick failed");
        let report = outcome.report();
        if let TickOutcome::Started(dispatch) = outcome {
            let done = dispatch.execute(self.controller.executor()).await;
            self.controller
                .complete_execution(done, now)
                .await
                .expect("completion failed");
        }
        report
    }

    /// Wait for detached alert tasks to deliver at least `count` alerts.
    ///
    /// # Panics
    ///
    /// Panics if they do not arrive within a second.
    pub async fn wait_for_alerts(&self, count: usize) -> Vec<SentAlert> {
        for _ in 0..200 {
            let sent = self.alerts.sent();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "Expected {count} alert(s), got {:?}",
            self.alerts.sent()
        );
    }
}
