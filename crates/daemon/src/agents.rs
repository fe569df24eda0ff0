use clickup_orchestrator_core::model::{AgentKind, CommandSpec};

use crate::supervisor::SupervisorError;

/// Env var carrying the prompt when a fixed agent command is configured.
pub const PROMPT_ENV: &str = "ORCHESTRATOR_PROMPT";
/// Env var naming the agent the prompt was meant for.
pub const AGENT_ENV: &str = "ORCHESTRATOR_AGENT";

/// Turns (agent, prompt) into the command the supervisor runs.
#[derive(Debug, Clone, Default)]
pub enum AgentLauncher {
    /// Use the agent CLI found on `PATH`.
    #[default]
    Installed,
    /// Run this command for every agent instead; the prompt is passed in
    /// [`PROMPT_ENV`]. Used for local development and tests.
    Fixed(CommandSpec),
}

impl AgentLauncher {
    pub fn command(&self, agent: AgentKind, prompt: &str) -> Result<CommandSpec, SupervisorError> {
        match self {
            AgentLauncher::Installed => {
                which::which(agent.binary())
                    .map_err(|_| SupervisorError::AgentNotFound(agent.binary().to_string()))?;
                Ok(agent.command(prompt))
            }
            AgentLauncher::Fixed(spec) => {
                let mut spec = spec.clone();
                spec.env.insert(PROMPT_ENV.to_string(), prompt.to_string());
                spec.env.insert(AGENT_ENV.to_string(), agent.to_string());
                Ok(spec)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_command_receives_prompt_in_env() {
        let launcher = AgentLauncher::Fixed(CommandSpec::new("sh", ["-c", "echo \"$ORCHESTRATOR_PROMPT\""]));
        let cmd = launcher.command(AgentKind::Codex, "do it").unwrap();
        assert_eq!(cmd.program, "sh");
        assert_eq!(cmd.env.get(PROMPT_ENV).map(String::as_str), Some("do it"));
        assert_eq!(cmd.env.get(AGENT_ENV).map(String::as_str), Some("codex"));
    }
}
