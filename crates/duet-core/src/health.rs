//! Liveness probe: is each configured CLI resolvable on this host?

use std::process::Stdio;
use std::time::Duration;

use tracing::{debug, warn};

use crate::agent::Agent;
use crate::config::AgentCommands;
use crate::runner::shell_command;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Ok,
    Degraded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CliAvailability {
    pub gemini: bool,
    pub claude: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub cli: CliAvailability,
}

/// Checks whether the executable of each configured command can be found.
pub async fn check(commands: &AgentCommands) -> HealthStatus {
    let (gemini, claude) = futures::future::join(
        is_available(commands, Agent::Gemini),
        is_available(commands, Agent::Claude),
    )
    .await;
    let status = if gemini && claude {
        HealthState::Ok
    } else {
        HealthState::Degraded
    };
    HealthStatus {
        status,
        cli: CliAvailability { gemini, claude },
    }
}

async fn is_available(commands: &AgentCommands, agent: Agent) -> bool {
    let Some(program) = commands.command_for(agent).split_whitespace().next() else {
        return false;
    };
    let mut cmd = shell_command("command -v", program);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    let status = match cmd.spawn() {
        Ok(mut child) => tokio::time::timeout(PROBE_TIMEOUT, child.wait()).await,
        Err(err) => {
            warn!(%agent, error = %err, "health probe failed to spawn");
            return false;
        }
    };
    let available = matches!(status, Ok(Ok(status)) if status.success());
    debug!(%agent, program, available, "health probe finished");
    available
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolvable_commands_are_ok() {
        let health = check(&AgentCommands::new("sh -c true", "echo")).await;
        assert_eq!(health.status, HealthState::Ok);
        assert_eq!(
            health.cli,
            CliAvailability {
                gemini: true,
                claude: true
            }
        );
    }

    #[tokio::test]
    async fn missing_executable_degrades_status() {
        let health = check(&AgentCommands::new("echo", "duet-no-such-cli-4242 -p")).await;
        assert_eq!(health.status, HealthState::Degraded);
        assert!(health.cli.gemini);
        assert!(!health.cli.claude);
    }

    #[test]
    fn serializes_lowercase_status() {
        let health = HealthStatus {
            status: HealthState::Degraded,
            cli: CliAvailability {
                gemini: false,
                claude: true,
            },
        };
        assert_eq!(
            serde_json::to_value(health).unwrap(),
            serde_json::json!({"status": "degraded", "cli": {"gemini": false, "claude": true}})
        );
    }
}
