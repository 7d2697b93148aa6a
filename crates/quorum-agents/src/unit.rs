use async_trait::async_trait;
use quorum_models::{AgentInput, AgentVerdict};

use crate::claude_cli::{invoke_claude, ClaudeCliConfig};
use crate::error::AgentError;
use crate::parser::parse_verdict;
use crate::prompts::prompt_for;

/// An executable analysis unit. Mockable for testing.
///
/// Implementations must be safe to call concurrently for different instruments.
/// The scheduler enforces deadlines by dropping the future, so `execute` should
/// not rely on running to completion.
#[async_trait]
pub trait AgentUnit: Send + Sync {
    fn id(&self) -> &str;

    async fn execute(&self, input: &AgentInput) -> Result<AgentVerdict, AgentError>;
}

/// Agent unit backed by the `claude` CLI.
pub struct ClaudeAgent {
    pub id: String,
    pub cli_config: ClaudeCliConfig,
}

impl ClaudeAgent {
    pub fn new(id: impl Into<String>, cli_config: ClaudeCliConfig) -> Self {
        Self {
            id: id.into(),
            cli_config,
        }
    }
}

#[async_trait]
impl AgentUnit for ClaudeAgent {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, input: &AgentInput) -> Result<AgentVerdict, AgentError> {
        let system_prompt = prompt_for(&input.capability);
        let user_prompt = serde_json::to_string(input)?;
        let raw = invoke_claude(&system_prompt, &user_prompt, &self.cli_config).await?;
        parse_verdict(&raw)
    }
}
