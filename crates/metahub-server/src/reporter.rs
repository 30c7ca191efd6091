//! Turns any [`HubError`] into an `error` envelope from the hub.

use std::error::Error as _;

use metahub_core::{Envelope, HubError, Identity, MessageType};
use serde_json::{json, Map, Value};

/// Marker sent in place of a trace when diagnostics are withheld.
pub const DEBUG_INFO_UNAVAILABLE: &str = "unavailable";

#[derive(Clone, Copy, Debug, Default)]
pub struct ErrorReporter {
    include_debug_info: bool,
}

impl ErrorReporter {
    pub fn new(include_debug_info: bool) -> Self {
        Self { include_debug_info }
    }

    /// Build the reply for `origin`.
    ///
    /// Payload: `{error, code, details?, debug_info}`. `debug_info` carries
    /// the full error chain only when enabled in configuration.
    pub fn build(&self, origin: &Identity, error: &HubError) -> Envelope {
        let mut payload = Map::new();
        payload.insert("error".into(), Value::String(error.to_string()));
        payload.insert("code".into(), Value::String(error.code().into()));
        if let Some(details) = error.details() {
            payload.insert("details".into(), details);
        }
        let debug_info = if self.include_debug_info {
            Value::String(trace(error))
        } else {
            Value::String(DEBUG_INFO_UNAVAILABLE.into())
        };
        payload.insert("debug_info".into(), debug_info);

        Envelope::from_hub(MessageType::Error, origin.clone(), Value::Object(payload))
    }

    /// Reply for a frame that never produced a usable sender.
    pub fn build_anonymous(&self, error: &HubError) -> Envelope {
        self.build(&Identity::hub(), error)
    }
}

fn trace(error: &HubError) -> String {
    let mut out = format!("{error:?}");
    let mut source = error.source();
    while let Some(cause) = source {
        out.push_str(&format!("\ncaused by: {cause}"));
        source = cause.source();
    }
    out
}

/// `{status, ...}` payload used by `ack` replies.
pub fn ack_payload(status: &str, extra: Value) -> Value {
    let mut payload = json!({ "status": status });
    if let (Value::Object(target), Value::Object(extra)) = (&mut payload, extra) {
        target.extend(extra);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use metahub_core::{RoutingError, ValidationError};

    fn not_bound() -> HubError {
        ValidationError::NotBound {
            identity: Identity::agent("a1"),
        }
        .into()
    }

    #[test]
    fn reply_comes_from_hub_to_origin() {
        let env = ErrorReporter::default().build(&Identity::agent("a1"), &not_bound());
        assert_eq!(env.msg_type, MessageType::Error);
        assert!(env.sender.is_hub());
        assert_eq!(env.recipient, Identity::agent("a1"));
        assert!(env.payload["error"].as_str().unwrap().contains("not bound"));
        assert_eq!(env.payload["code"], "VALIDATION_ERROR");
    }

    #[test]
    fn debug_info_withheld_by_default() {
        let env = ErrorReporter::default().build(&Identity::agent("a1"), &not_bound());
        assert_eq!(env.payload["debug_info"], DEBUG_INFO_UNAVAILABLE);
    }

    #[test]
    fn debug_info_included_when_enabled() {
        let env = ErrorReporter::new(true).build(&Identity::agent("a1"), &not_bound());
        let trace = env.payload["debug_info"].as_str().unwrap();
        assert!(trace.contains("NotBound"));
    }

    #[test]
    fn details_are_attached() {
        let err: HubError = RoutingError::RecipientNotFound {
            recipient: Identity::human("h9"),
            available: vec!["h1".into()],
        }
        .into();
        let env = ErrorReporter::default().build(&Identity::agent("a1"), &err);
        assert_eq!(env.payload["details"]["available"], json!(["h1"]));
        assert_eq!(env.payload["code"], "ROUTING_ERROR");
    }

    #[test]
    fn anonymous_reply_targets_hub() {
        let err: HubError = ValidationError::InvalidJson { reason: "eof".into() }.into();
        let env = ErrorReporter::default().build_anonymous(&err);
        assert!(env.recipient.is_hub());
        assert!(env.payload.get("details").is_none());
    }

    #[test]
    fn ack_payload_merges_fields() {
        let payload = ack_payload("bound", json!({"env_id": "e1"}));
        assert_eq!(payload, json!({"status": "bound", "env_id": "e1"}));
    }
}
