use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::Identity;

/// Envelope `type` values understood by the hub.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Ping,
    Pong,
    Join,
    Leave,
    Bind,
    Unbind,
    State,
    Action,
    DirectMessage,
    Status,
    Ack,
    Error,
}

impl MessageType {
    pub const ALL: [MessageType; 12] = [
        MessageType::Ping,
        MessageType::Pong,
        MessageType::Join,
        MessageType::Leave,
        MessageType::Bind,
        MessageType::Unbind,
        MessageType::State,
        MessageType::Action,
        MessageType::DirectMessage,
        MessageType::Status,
        MessageType::Ack,
        MessageType::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Join => "join",
            Self::Leave => "leave",
            Self::Bind => "bind",
            Self::Unbind => "unbind",
            Self::State => "state",
            Self::Action => "action",
            Self::DirectMessage => "direct_message",
            Self::Status => "status",
            Self::Ack => "ack",
            Self::Error => "error",
        }
    }

    pub fn valid_names() -> Vec<&'static str> {
        Self::ALL.iter().map(|t| t.as_str()).collect()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|t| t.as_str() == s).ok_or(())
    }
}

/// The typed wire message unit.
///
/// `timestamp` is kept as the exact string the producer sent so that a
/// decode/encode pass is lossless.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub sender: Identity,
    pub recipient: Identity,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: String,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(msg_type: MessageType, sender: Identity, recipient: Identity, payload: Value) -> Self {
        Self {
            msg_type,
            sender,
            recipient,
            payload,
            timestamp: now_timestamp(),
        }
    }

    /// Build an envelope originating from the hub itself.
    pub fn from_hub(msg_type: MessageType, recipient: Identity, payload: Value) -> Self {
        Self::new(msg_type, Identity::hub(), recipient, payload)
    }
}

/// RFC 3339 UTC timestamp with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
