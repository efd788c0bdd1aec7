use crate::agent::Agent;

/// Terminal failure of a single CLI run.
///
/// This is the authoritative value for programmatic handling; the matching
/// human-readable text is also streamed as the last error chunk.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunFailure {
    /// The process exited on its own with a non-zero code.
    #[error("{agent} process failed with exit code {code}")]
    Exit { agent: Agent, code: i32 },
    /// The deadline passed and the process was terminated.
    #[error("{agent} process timed out after {timeout_ms}ms")]
    Timeout { agent: Agent, timeout_ms: u64 },
    /// The process could not be started at all.
    #[error("{agent} process failed to spawn: {reason}")]
    Spawn { agent: Agent, reason: String },
    /// The consumer aborted the run or went away.
    #[error("{agent} run cancelled")]
    Cancelled { agent: Agent },
}

impl RunFailure {
    /// Returns the agent whose run failed.
    pub fn agent(&self) -> Agent {
        match self {
            Self::Exit { agent, .. }
            | Self::Timeout { agent, .. }
            | Self::Spawn { agent, .. }
            | Self::Cancelled { agent } => *agent,
        }
    }
}

/// Top-level error type for the public duet API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DuetError {
    /// Invalid or unreadable configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid caller input.
    #[error("validation error: {0}")]
    Validation(String),
    /// No conversation is stored under the id.
    #[error("conversation {id} not found")]
    ConversationNotFound { id: uuid::Uuid },
    /// A run reached a failed terminal state.
    #[error(transparent)]
    RunFailed(RunFailure),
    /// Internal protocol misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl DuetError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Returns the run failure carried by this error, if any.
    pub fn run_failure(&self) -> Option<&RunFailure> {
        match self {
            Self::RunFailed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<RunFailure> for DuetError {
    fn from(value: RunFailure) -> Self {
        DuetError::RunFailed(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_failure_messages_name_the_agent() {
        let failure = RunFailure::Exit {
            agent: Agent::Gemini,
            code: 2,
        };
        assert_eq!(failure.to_string(), "gemini process failed with exit code 2");
        let err = DuetError::from(RunFailure::Timeout {
            agent: Agent::Claude,
            timeout_ms: 50,
        });
        assert_eq!(err.to_string(), "claude process timed out after 50ms");
        assert_eq!(err.run_failure().map(RunFailure::agent), Some(Agent::Claude));
    }

    #[test]
    fn run_failure_serializes_with_kind_tag() {
        let value = serde_json::to_value(RunFailure::Cancelled {
            agent: Agent::Gemini,
        })
        .unwrap();
        assert_eq!(value, serde_json::json!({"kind": "cancelled", "agent": "gemini"}));
    }
}
