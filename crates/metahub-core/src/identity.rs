use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Participant role on the wire.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Hub,
    Env,
    Agent,
    Human,
}

impl Role {
    /// Every valid role, in wire order.
    pub const ALL: [Role; 4] = [Role::Hub, Role::Env, Role::Agent, Role::Human];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hub => "hub",
            Self::Env => "env",
            Self::Agent => "agent",
            Self::Human => "human",
        }
    }

    /// Agents and humans attach to an environment; nothing else does.
    pub fn is_member(self) -> bool {
        matches!(self, Self::Agent | Self::Human)
    }

    /// Names of every valid role, for diagnostics.
    pub fn valid_names() -> Vec<&'static str> {
        Self::ALL.iter().map(|r| r.as_str()).collect()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hub" => Ok(Self::Hub),
            "env" => Ok(Self::Env),
            "agent" => Ok(Self::Agent),
            "human" => Ok(Self::Human),
            _ => Err(()),
        }
    }
}

/// A `(role, id)` pair naming one participant.
///
/// Equality and hashing cover both parts, so `agent:x` and `human:x` are
/// distinct keys. Only the hub itself goes without an id.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(rename = "type")]
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Identity {
    pub fn new(role: Role, id: impl Into<String>) -> Self {
        Self {
            role,
            id: Some(id.into()),
        }
    }

    pub fn hub() -> Self {
        Self {
            role: Role::Hub,
            id: None,
        }
    }

    pub fn env(id: impl Into<String>) -> Self {
        Self::new(Role::Env, id)
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self::new(Role::Agent, id)
    }

    pub fn human(id: impl Into<String>) -> Self {
        Self::new(Role::Human, id)
    }

    /// The id, or an empty string for the hub.
    pub fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }

    pub fn is_hub(&self) -> bool {
        self.role == Role::Hub
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{id}", self.role),
            None => f.write_str(self.role.as_str()),
        }
    }
}
