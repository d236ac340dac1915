//! Event sinks, alert services and the session log.

use crate::controller::ControllerEvent;
use crate::error::ForemanError;
use crate::testing::{AlertService, LogKind, NotificationChannel, SessionLogStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

// ============================================================================
// Notifiers
// ============================================================================

/// Notifier that writes every event to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl NotificationChannel for TracingNotifier {
    fn publish(&self, event: &ControllerEvent) {
        match event {
            ControllerEvent::Progress(_) | ControllerEvent::Usage { .. } => {
                debug!(event = event.name(), payload = %event.payload(), "controller event");
            }
            _ => info!(event = event.name(), payload = %event.payload(), "controller event"),
        }
    }
}

/// Fan-out notifier over a tokio broadcast channel.
///
/// Slow subscribers lag and lose events; publishing never blocks.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<ControllerEvent>,
    forward_to_tracing: bool,
}

impl BroadcastNotifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            forward_to_tracing: false,
        }
    }

    /// Also log every event through [`TracingNotifier`].
    #[must_use]
    pub fn with_tracing(mut self) -> Self {
        self.forward_to_tracing = true;
        self
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.tx.subscribe()
    }
}

impl NotificationChannel for BroadcastNotifier {
    fn publish(&self, event: &ControllerEvent) {
        if self.forward_to_tracing {
            TracingNotifier.publish(event);
        }
        // No subscribers is fine.
        let _ = self.tx.send(event.clone());
    }
}

// ============================================================================
// Alert Services
// ============================================================================

/// Alert service that drops every alert.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAlertService;

#[async_trait]
impl AlertService for NoopAlertService {
    async fn send(&self, title: &str, _message: &str, _metadata: serde_json::Value) -> Result<()> {
        debug!("Alert not configured, dropping \"{}\"", title);
        Ok(())
    }
}

/// Alert service that runs a shell command per alert.
///
/// The alert is passed in `FOREMAN_ALERT_TITLE`, `FOREMAN_ALERT_MESSAGE` and
/// `FOREMAN_ALERT_METADATA` (JSON).
///
/// # Example
///
/// ```rust,ignore
/// let alerts = CommandAlertService::new(r#"notify-send "$FOREMAN_ALERT_TITLE" "$FOREMAN_ALERT_MESSAGE""#);
/// ```
#[derive(Debug, Clone)]
pub struct CommandAlertService {
    command: String,
}

impl CommandAlertService {
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl AlertService for CommandAlertService {
    async fn send(&self, title: &str, message: &str, metadata: serde_json::Value) -> Result<()> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("FOREMAN_ALERT_TITLE", title)
            .env("FOREMAN_ALERT_MESSAGE", message)
            .env("FOREMAN_ALERT_METADATA", metadata.to_string())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to run alert command")?;

        if !output.status.success() {
            return Err(ForemanError::alert(format!(
                "alert command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// Session Log
// ============================================================================

/// Session log writing one JSONL file per session under a directory.
#[derive(Debug, Clone)]
pub struct JsonlSessionLog {
    dir: PathBuf,
}

impl JsonlSessionLog {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.jsonl"))
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write_line(&self, session_id: &str, kind: LogKind, content: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let line = json!({
            "timestamp": Utc::now(),
            "kind": kind,
            "content": content,
        });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.session_path(session_id))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl SessionLogStore for JsonlSessionLog {
    fn append(&self, session_id: &str, kind: LogKind, content: &str) {
        if let Err(e) = self.write_line(session_id, kind, content) {
            warn!("Failed to write session log for {}: {:#}", session_id, e);
        }
    }
}
