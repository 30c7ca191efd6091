//! Wire codec for [`Envelope`].
//!
//! Decoding is done against a raw [`serde_json::Value`] rather than by
//! deriving straight into the struct, so that every rejection names the field
//! at fault and what was actually received. Rules are checked in a fixed order
//! and the first violation wins:
//!
//! 1. the frame is a JSON object
//! 2. `type` is a known message type
//! 3. `sender` and `recipient` are objects
//! 4. each carries a valid role under `type`
//! 5. each non-hub identity carries a non-empty string `id`

use serde_json::{Map, Value};

use crate::errors::{HubError, ValidationError};
use crate::identity::{Identity, Role};
use crate::message::{now_timestamp, Envelope, MessageType};

const MAX_RENDERED_VALUE: usize = 80;

/// Decode and validate one text frame.
pub fn parse(raw: &str) -> Result<Envelope, ValidationError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ValidationError::InvalidJson {
        reason: e.to_string(),
    })?;
    parse_value(value)
}

/// Validate an already-decoded JSON value.
pub fn parse_value(value: Value) -> Result<Envelope, ValidationError> {
    let mut obj = match value {
        Value::Object(obj) => obj,
        other => {
            return Err(ValidationError::NotAnObject {
                actual: json_type_name(&other),
            })
        }
    };

    let msg_type = message_type(&obj)?;

    let sender = identity_object(&obj, "sender")?;
    let recipient = identity_object(&obj, "recipient")?;

    let sender_role = role("sender", sender)?;
    let recipient_role = role("recipient", recipient)?;

    let sender = identity("sender", sender_role, sender)?;
    let recipient = identity("recipient", recipient_role, recipient)?;

    let timestamp = match obj.remove("timestamp") {
        None | Some(Value::Null) => now_timestamp(),
        Some(Value::String(ts)) => ts,
        Some(other) => return Err(field_kind("timestamp", "a string", &other)),
    };
    let payload = obj.remove("payload").unwrap_or(Value::Null);

    Ok(Envelope {
        msg_type,
        sender,
        recipient,
        payload,
        timestamp,
    })
}

/// Serialize an envelope to its wire text.
pub fn encode(envelope: &Envelope) -> Result<String, HubError> {
    serde_json::to_string(envelope)
        .map_err(|e| HubError::internal(format!("failed to encode envelope: {e}")))
}

/// JSON type name as a client would recognise it.
pub fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn message_type(obj: &Map<String, Value>) -> Result<MessageType, ValidationError> {
    match obj.get("type") {
        None | Some(Value::Null) => Err(ValidationError::MissingType {
            valid: MessageType::valid_names(),
        }),
        Some(Value::String(name)) => {
            name.parse()
                .map_err(|()| ValidationError::UnknownMessageType {
                    received: name.clone(),
                    valid: MessageType::valid_names(),
                })
        }
        Some(other) => Err(ValidationError::UnknownMessageType {
            received: render(other),
            valid: MessageType::valid_names(),
        }),
    }
}

fn identity_object<'a>(
    obj: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a Map<String, Value>, ValidationError> {
    match obj.get(field) {
        Some(Value::Object(inner)) => Ok(inner),
        None => Err(ValidationError::MissingField {
            field: field.to_string(),
            expected: "an object",
        }),
        Some(other) => Err(field_kind(field, "an object", other)),
    }
}

fn role(field: &str, obj: &Map<String, Value>) -> Result<Role, ValidationError> {
    let invalid = |received: String| ValidationError::InvalidRole {
        field: format!("{field}.type"),
        received,
        valid: Role::valid_names(),
    };
    match obj.get("type") {
        Some(Value::String(name)) => name.parse().map_err(|()| invalid(name.clone())),
        Some(other) => Err(invalid(render(other))),
        None => Err(invalid("<missing>".to_string())),
    }
}

fn identity(field: &str, role: Role, obj: &Map<String, Value>) -> Result<Identity, ValidationError> {
    match obj.get("id") {
        Some(Value::String(id)) if !id.is_empty() => Ok(Identity::new(role, id.clone())),
        Some(Value::Null) | None if role == Role::Hub => Ok(Identity::hub()),
        Some(Value::String(_)) if role == Role::Hub => Ok(Identity::hub()),
        Some(Value::String(_)) | Some(Value::Null) | None => Err(ValidationError::MissingId {
            field: format!("{field}.id"),
            role,
        }),
        Some(other) => Err(field_kind(&format!("{field}.id"), "a non-empty string", other)),
    }
}

fn field_kind(field: &str, expected: &'static str, actual: &Value) -> ValidationError {
    ValidationError::FieldKind {
        field: field.to_string(),
        expected,
        actual_type: json_type_name(actual),
        actual_value: render(actual),
    }
}

fn render(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() <= MAX_RENDERED_VALUE {
        return text;
    }
    let mut cut: String = text.chars().take(MAX_RENDERED_VALUE).collect();
    cut.push_str("...");
    cut
}
