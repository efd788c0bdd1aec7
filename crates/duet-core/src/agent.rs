use std::fmt;

/// External CLI tool taking part in a generation.
///
/// `Gemini` drafts (stage one) and `Claude` reviews (stage two).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agent {
    Gemini,
    Claude,
}

impl Agent {
    /// Returns the wire name of the agent.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::Claude => "claude",
        }
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Author of a message recorded in a conversation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Gemini,
    Claude,
}

impl From<Agent> for Role {
    fn from(value: Agent) -> Self {
        match value {
            Agent::Gemini => Role::Gemini,
            Agent::Claude => Role::Claude,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::User => "user",
            Self::Gemini => "gemini",
            Self::Claude => "claude",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_and_role_share_wire_names() {
        assert_eq!(serde_json::to_string(&Agent::Gemini).unwrap(), "\"gemini\"");
        assert_eq!(
            serde_json::to_string(&Role::from(Agent::Claude)).unwrap(),
            "\"claude\""
        );
        assert_eq!(Role::User.to_string(), "user");
    }
}
