//! Error taxonomy for the hub.
//!
//! Every failure a client can cause ends up as one [`HubError`], which the
//! outer session boundary turns into an `error` envelope. The variants map to
//! stable wire codes via [`HubError::code`].

use serde_json::{json, Value};

use crate::identity::{Identity, Role};
use crate::message::MessageType;

/// A malformed, ill-typed or out-of-state envelope. Always answered in-band;
/// the connection stays open.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid JSON: {reason}")]
    InvalidJson { reason: String },

    #[error("message must be a JSON object, got {actual}")]
    NotAnObject { actual: &'static str },

    #[error("message is missing the 'type' field; valid types are: {}", valid.join(", "))]
    MissingType { valid: Vec<&'static str> },

    #[error("unknown message type '{received}'; valid types are: {}", valid.join(", "))]
    UnknownMessageType {
        received: String,
        valid: Vec<&'static str>,
    },

    #[error("field '{field}' is required and must be {expected}")]
    MissingField { field: String, expected: &'static str },

    #[error("field '{field}' must be {expected}, got {actual_type} ({actual_value})")]
    FieldKind {
        field: String,
        expected: &'static str,
        actual_type: &'static str,
        actual_value: String,
    },

    #[error("field '{field}' has invalid role '{received}'; valid roles are: {}", valid.join(", "))]
    InvalidRole {
        field: String,
        received: String,
        valid: Vec<&'static str>,
    },

    #[error("field '{field}' is required for role '{role}' and must be a non-empty string")]
    MissingId { field: String, role: Role },

    #[error("must join before sending '{msg_type}'")]
    NotJoined { msg_type: MessageType },

    #[error("connection already joined as {identity}")]
    AlreadyJoined { identity: Identity },

    #[error("clients cannot join as 'hub'")]
    CannotJoinAsHub,

    #[error("sender {claimed} does not match connection identity {registered}")]
    SenderMismatch { claimed: Identity, registered: Identity },

    #[error("{identity} is not bound to an environment; send 'bind' first")]
    NotBound { identity: Identity },

    #[error("role '{role}' may not send '{msg_type}'")]
    RoleNotPermitted { msg_type: MessageType, role: Role },

    #[error("'{msg_type}' must be addressed to role '{expected}', got '{actual}'")]
    Misaddressed {
        msg_type: MessageType,
        expected: Role,
        actual: Role,
    },
}

/// A bind/unbind precondition was violated.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum BindingError {
    #[error("cannot bind to env '{env_id}': no environment with that id is connected")]
    EnvNotRegistered { env_id: String },

    #[error("{member} is already bound to env '{current}'; unbind before binding to '{requested}'")]
    AlreadyBound {
        member: Identity,
        current: String,
        requested: String,
    },

    #[error("{identity} cannot be bound; only agent and human clients attach to an environment")]
    NotAMember { identity: Identity },

    #[error("{identity} is not connected")]
    MemberNotRegistered { identity: Identity },
}

/// The recipient could not be resolved, or resolving it would cross an
/// environment boundary.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RoutingError {
    #[error("recipient {recipient} is not connected; connected {} ids: [{}]", recipient.role, available.join(", "))]
    RecipientNotFound {
        recipient: Identity,
        available: Vec<String>,
    },

    #[error("cannot address env '{requested}': sender is bound to env '{bound}'")]
    EnvMismatch { requested: String, bound: String },

    #[error("bound env '{env_id}' is not connected")]
    EnvNotConnected { env_id: String },

    #[error("{member} is not bound to env '{env_id}'")]
    NotInEnvironment { member: Identity, env_id: String },

    #[error("'{msg_type}' cannot be addressed to the hub")]
    HubNotAddressable { msg_type: MessageType },
}

/// A send to a live-looking connection failed at the transport. The
/// connection has already been unregistered by the time this surfaces.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("failed to deliver to {recipient}: {reason}")]
pub struct DeliveryError {
    pub recipient: Identity,
    pub reason: String,
}

/// Umbrella error raised anywhere below the session boundary.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error("state from env '{env_id}' reached {delivered} of {} members", delivered + failures.len())]
    PartialBroadcast {
        env_id: String,
        delivered: usize,
        failures: Vec<DeliveryError>,
    },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl HubError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stable wire code for the `error` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Binding(_) => "BINDING_ERROR",
            Self::Routing(_) => "ROUTING_ERROR",
            Self::Delivery(_) => "DELIVERY_ERROR",
            Self::PartialBroadcast { .. } => "PARTIAL_DELIVERY",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Structured context for the client, when the error carries any.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::Validation(ValidationError::MissingType { valid })
            | Self::Validation(ValidationError::UnknownMessageType { valid, .. }) => {
                Some(json!({ "valid_types": valid }))
            }
            Self::Validation(ValidationError::InvalidRole { field, valid, .. }) => {
                Some(json!({ "field": field, "valid_roles": valid }))
            }
            Self::Validation(ValidationError::FieldKind {
                field,
                expected,
                actual_type,
                actual_value,
            }) => Some(json!({
                "field": field,
                "expected": expected,
                "actual_type": actual_type,
                "actual_value": actual_value,
            })),
            Self::Routing(RoutingError::RecipientNotFound {
                recipient,
                available,
            }) => Some(json!({
                "recipient": recipient,
                "role": recipient.role,
                "available": available,
            })),
            Self::Routing(RoutingError::EnvMismatch { requested, bound }) => {
                Some(json!({ "requested": requested, "bound": bound }))
            }
            Self::Delivery(DeliveryError { recipient, reason }) => {
                Some(json!({ "recipient": recipient, "reason": reason }))
            }
            Self::PartialBroadcast {
                delivered,
                failures,
                ..
            } => Some(json!({
                "delivered": delivered,
                "failures": failures
                    .iter()
                    .map(|f| json!({ "recipient": f.recipient, "reason": f.reason }))
                    .collect::<Vec<_>>(),
            })),
            _ => None,
        }
    }
}
