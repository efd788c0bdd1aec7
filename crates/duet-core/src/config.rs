use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::agent::Agent;
use crate::errors::DuetError;

/// Default per-run deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(300_000);
/// Default bound of the chunk hand-off queue.
pub const DEFAULT_STREAM_BUFFER_CAPACITY: usize = 128;

/// Command strings used to launch each agent.
///
/// Commands run through the platform shell, so they may carry flags or
/// shell operators (`claude -p`, `npx gemini`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentCommands {
    pub gemini: String,
    pub claude: String,
}

impl AgentCommands {
    pub fn new(gemini: impl Into<String>, claude: impl Into<String>) -> Self {
        Self {
            gemini: gemini.into(),
            claude: claude.into(),
        }
    }

    /// Returns the configured command for an agent.
    pub fn command_for(&self, agent: Agent) -> &str {
        match agent {
            Agent::Gemini => &self.gemini,
            Agent::Claude => &self.claude,
        }
    }
}

impl Default for AgentCommands {
    fn default() -> Self {
        Self::new("gemini", "claude")
    }
}

/// Runtime configuration for runs and pipelines.
#[derive(Clone, Debug)]
pub struct DuetConfig {
    /// Working directory for every spawned CLI.
    pub workspace_dir: PathBuf,
    pub commands: AgentCommands,
    /// Per-run deadline.
    pub timeout: Duration,
    /// Bounded chunk queue size between producers and the consumer.
    pub stream_buffer_capacity: usize,
}

impl DuetConfig {
    /// Creates a config with defaults rooted at `workspace_dir`.
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            commands: AgentCommands::default(),
            timeout: DEFAULT_TIMEOUT,
            stream_buffer_capacity: DEFAULT_STREAM_BUFFER_CAPACITY,
        }
    }

    /// Builds a config from the environment.
    ///
    /// Environment variables:
    /// - `DUET_WORKSPACE_DIR`: working directory for the CLIs (default: current directory).
    /// - `GEMINI_CLI` / `CLAUDE_CLI`: command strings (default: `gemini` / `claude`).
    /// - `DUET_TIMEOUT_MS`: per-run deadline in milliseconds (default: 300000).
    /// - `DUET_STREAM_BUFFER`: chunk queue capacity (default: 128).
    pub fn from_env() -> Result<Self, DuetError> {
        let workspace_dir = match non_empty_env("DUET_WORKSPACE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().map_err(|e| {
                DuetError::Config(format!("cannot resolve current directory: {e}"))
            })?,
        };
        let mut config = Self::new(workspace_dir);
        if let Some(gemini) = non_empty_env("GEMINI_CLI") {
            config.commands.gemini = gemini;
        }
        if let Some(claude) = non_empty_env("CLAUDE_CLI") {
            config.commands.claude = claude;
        }
        if let Some(ms) = parse_env::<u64>("DUET_TIMEOUT_MS")? {
            config.timeout = Duration::from_millis(ms);
        }
        if let Some(capacity) = parse_env::<usize>("DUET_STREAM_BUFFER")? {
            config.stream_buffer_capacity = capacity;
        }
        config.validate()?;
        Ok(config)
    }

    /// Overrides the agent commands.
    pub fn commands(mut self, commands: AgentCommands) -> Self {
        self.commands = commands;
        self
    }

    /// Overrides the per-run deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the chunk queue capacity.
    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.stream_buffer_capacity = capacity;
        self
    }

    /// Per-run deadline in milliseconds, saturating at `u64::MAX`.
    pub fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    /// Rejects configurations that cannot run.
    pub fn validate(&self) -> Result<(), DuetError> {
        for agent in [Agent::Gemini, Agent::Claude] {
            if self.commands.command_for(agent).trim().is_empty() {
                return Err(DuetError::Config(format!("{agent} command must not be empty")));
            }
        }
        if self.timeout.is_zero() {
            return Err(DuetError::Config("timeout must be greater than 0".into()));
        }
        if self.stream_buffer_capacity == 0 {
            return Err(DuetError::Config(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: FromStr>(key: &str) -> Result<Option<T>, DuetError>
where
    T::Err: std::fmt::Display,
{
    match non_empty_env(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| DuetError::Config(format!("invalid {key}={raw:?}: {e}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli_names_and_five_minute_timeout() {
        let config = DuetConfig::new("/tmp");
        assert_eq!(config.commands.command_for(Agent::Gemini), "gemini");
        assert_eq!(config.commands.command_for(Agent::Claude), "claude");
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.stream_buffer_capacity, 128);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn timeout_ms_saturates_instead_of_truncating() {
        assert_eq!(DuetConfig::new("/tmp").timeout_ms(), 300_000);
        let huge = DuetConfig::new("/tmp").timeout(Duration::MAX);
        assert_eq!(huge.timeout_ms(), u64::MAX);
    }

    #[test]
    fn validate_rejects_blank_command_and_zero_limits() {
        let blank = DuetConfig::new("/tmp").commands(AgentCommands::new(" ", "claude"));
        assert!(matches!(blank.validate(), Err(DuetError::Config(m)) if m.contains("gemini")));

        let zero_timeout = DuetConfig::new("/tmp").timeout(Duration::ZERO);
        assert!(zero_timeout.validate().is_err());

        let zero_buffer = DuetConfig::new("/tmp").stream_buffer_capacity(0);
        assert!(zero_buffer.validate().is_err());
    }
}
