use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::AgentError;

/// How an agent unit reaches the `claude` CLI.
#[derive(Debug, Clone)]
pub struct ClaudeCliConfig {
    pub binary: String,
    pub model: String,
    /// Hard cap on one invocation. The scheduler usually cancels first.
    pub timeout: Duration,
}

impl Default for ClaudeCliConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model: "claude-3-5-haiku-latest".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl ClaudeCliConfig {
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }
}

/// Run one prompt through the CLI and return raw stdout.
///
/// The child is spawned with `kill_on_drop`, so a cancelled or timed-out task
/// does not leave a stray process behind.
pub async fn invoke_claude(
    system_prompt: &str,
    user_prompt: &str,
    config: &ClaudeCliConfig,
) -> Result<String, AgentError> {
    debug!(model = %config.model, prompt_len = user_prompt.len(), "Invoking claude CLI");

    let output = tokio::time::timeout(config.timeout, async {
        Command::new(&config.binary)
            .args([
                "-p",
                user_prompt,
                "--system-prompt",
                system_prompt,
                "--model",
                &config.model,
                "--output-format",
                "text",
            ])
            .kill_on_drop(true)
            .output()
            .await
    })
    .await
    .map_err(|_| AgentError::Timeout(config.timeout.as_millis() as u64))?
    .map_err(|e| AgentError::Cli(format!("failed to spawn {}: {e}", config.binary)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(status = %output.status, stderr = %stderr, "Claude CLI failed");
        return Err(AgentError::Cli(format!(
            "{} exited {}: {}",
            config.binary, output.status, stderr
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if stdout.trim().is_empty() {
        return Err(AgentError::Cli("empty response".to_string()));
    }
    Ok(stdout)
}

/// Whether the configured CLI binary runs at all.
pub async fn check_cli_available(config: &ClaudeCliConfig) -> bool {
    match Command::new(&config.binary).arg("--version").output().await {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}
