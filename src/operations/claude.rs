//! `claude` CLI agent executor.
//!
//! Each attempt is one non-interactive `claude -p --output-format json` run.
//! The prompt goes in on stdin; the single JSON result object comes back on
//! stdout.

use crate::error::ForemanError;
use crate::testing::{AgentExecutor, ExecutionRequest, ExecutionResult, TokenUsage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Default agent binary.
pub const DEFAULT_AGENT_COMMAND: &str = "claude";

/// Real agent executor backed by the `claude` CLI.
///
/// The child is spawned with `kill_on_drop`, so dropping the `run` future
/// (cancellation, timeout, deactivation) terminates the agent.
#[derive(Debug, Clone)]
pub struct ClaudeCliExecutor {
    command: String,
    project_dir: PathBuf,
    model: Option<String>,
    skip_permissions: bool,
}

impl ClaudeCliExecutor {
    #[must_use]
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: DEFAULT_AGENT_COMMAND.to_string(),
            project_dir: project_dir.into(),
            model: None,
            skip_permissions: false,
        }
    }

    #[must_use]
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    #[must_use]
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    #[must_use]
    pub fn with_skip_permissions(mut self, skip: bool) -> Self {
        self.skip_permissions = skip;
        self
    }

    /// Resolve the agent binary on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns `MissingTool` if the command cannot be found.
    pub fn ensure_available(&self) -> crate::error::Result<PathBuf> {
        which::which(&self.command).map_err(|_| ForemanError::MissingTool {
            tool: self.command.clone(),
        })
    }

    fn args(&self, request: &ExecutionRequest) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(system_prompt) = &request.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(system_prompt.clone());
        }
        if self.skip_permissions {
            args.push("--dangerously-skip-permissions".to_string());
        }
        args
    }
}

#[async_trait]
impl AgentExecutor for ClaudeCliExecutor {
    async fn run(&self, request: ExecutionRequest) -> Result<ExecutionResult> {
        debug!("Running {} in {}", self.command, self.project_dir.display());

        let mut child = Command::new(&self.command)
            .args(self.args(&request))
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(request.prompt.as_bytes()).await?;
            stdin.flush().await?;
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for {}", self.command))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(parse_claude_output(&stdout, output.status.success(), &stderr))
    }
}

// ============================================================================
// Output Parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct CliResult {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    usage: Option<CliUsage>,
    #[serde(default)]
    total_cost_usd: Option<f64>,
    #[serde(default)]
    num_turns: Option<u32>,
    #[serde(default, rename = "modelUsage")]
    model_usage: HashMap<String, CliModelUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliModelUsage {
    #[serde(default)]
    context_window: Option<u64>,
}

/// Turn the CLI's stdout into an [`ExecutionResult`].
///
/// Unparseable output from a failed process becomes a failed result carrying
/// stderr; unparseable output from a successful one is taken as the plain
/// response.
#[must_use]
pub fn parse_claude_output(stdout: &str, exit_success: bool, stderr: &str) -> ExecutionResult {
    let parsed: CliResult = match serde_json::from_str(stdout.trim()) {
        Ok(parsed) => parsed,
        Err(e) => {
            if exit_success {
                warn!("Agent output was not JSON ({}), using it verbatim", e);
                return ExecutionResult::succeeded(stdout.trim());
            }
            let message = if stderr.trim().is_empty() {
                stdout.trim()
            } else {
                stderr.trim()
            };
            return ExecutionResult::failed(format!("agent exited with an error: {message}"));
        }
    };

    let token_usage = parsed.usage.map(|u| TokenUsage {
        input_tokens: u.input_tokens + u.cache_creation_input_tokens + u.cache_read_input_tokens,
        output_tokens: u.output_tokens,
        context_window: parsed
            .model_usage
            .values()
            .filter_map(|m| m.context_window)
            .max(),
    });

    let success = exit_success && !parsed.is_error;
    ExecutionResult {
        success,
        error: (!success).then(|| {
            parsed
                .result
                .clone()
                .filter(|r| !r.trim().is_empty())
                .unwrap_or_else(|| format!("agent reported an error: {}", stderr.trim()))
        }),
        response: parsed.result,
        token_usage,
        cost_usd: parsed.total_cost_usd,
        tool_calls: parsed.num_turns.unwrap_or(0),
    }
}
