//! Per-connection state machine and message dispatch.
//!
//! ```text
//! Unauthenticated --join--> Registered --bind--> (bound) --leave/close--> Closed
//! ```
//!
//! "Bound" is not stored here: the binding table is the single source of
//! truth, so a cascade from an env disconnect is seen immediately.

use std::sync::Arc;

use metahub_core::{
    codec, DeliveryError, Envelope, HubError, Identity, MessageType, Role, RoutingError,
    ValidationError,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::connection::ClientConnection;
use crate::hub::Hub;
use crate::reporter::{ack_payload, ErrorReporter};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Registered(Identity),
    Closed,
}

/// What the session loop should do after a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Handles the frames of one connection against the shared hub.
pub struct ConnectionHandler {
    hub: Arc<Hub>,
    conn: Arc<ClientConnection>,
    reporter: ErrorReporter,
    state: SessionState,
}

impl ConnectionHandler {
    pub fn new(hub: Arc<Hub>, conn: Arc<ClientConnection>) -> Self {
        let reporter = ErrorReporter::new(hub.routing().include_debug_info);
        Self {
            hub,
            conn,
            reporter,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        match &self.state {
            SessionState::Registered(identity) => Some(identity),
            _ => None,
        }
    }

    /// Handle one text frame. Every failure is answered in-band.
    pub async fn handle_frame(&mut self, raw: &str) -> Flow {
        self.hub.metrics().counter_inc("messages_received_total", &[], 1);

        let envelope = match codec::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.report(None, &e.into()).await;
                return Flow::Continue;
            }
        };
        let claimed = envelope.sender.clone();
        let msg_type = envelope.msg_type;

        match self.dispatch(envelope).await {
            Ok(flow) => flow,
            Err(err) => {
                debug!(%claimed, %msg_type, error = %err, "message rejected");
                self.report(Some(&claimed), &err).await;
                Flow::Continue
            }
        }
    }

    /// Send an `error` envelope for `err` over this connection.
    ///
    /// Addressed to the registered identity, else the claimed sender, else
    /// the hub. If the connection is gone the error is only logged.
    pub async fn report(&self, claimed: Option<&Identity>, err: &HubError) {
        self.hub
            .metrics()
            .counter_inc("errors_total", &[("code", err.code())], 1);

        let envelope = match self.identity().or(claimed) {
            Some(origin) => self.reporter.build(origin, err),
            None => self.reporter.build_anonymous(err),
        };
        if let Err(e) = self.reply(&envelope).await {
            let origin = &envelope.recipient;
            warn!(%origin, code = err.code(), error = %err, send_error = %e, "error reply not delivered");
        }
    }

    /// Unregister on transport close. Ignored if this connection was replaced.
    pub async fn on_close(&mut self, reason: &str) {
        let state = std::mem::replace(&mut self.state, SessionState::Closed);
        if let SessionState::Registered(identity) = state {
            self.hub.disconnect(&identity, Some(&self.conn.id), reason).await;
        }
    }

    async fn dispatch(&mut self, envelope: Envelope) -> Result<Flow, HubError> {
        let identity = match &self.state {
            SessionState::Closed => return Ok(Flow::Close),
            SessionState::Unauthenticated => {
                return match envelope.msg_type {
                    MessageType::Ping => self.pong(&envelope).await,
                    MessageType::Join => self.join(&envelope).await,
                    msg_type => Err(ValidationError::NotJoined { msg_type }.into()),
                };
            }
            SessionState::Registered(identity) => identity.clone(),
        };

        if envelope.sender != identity {
            return Err(ValidationError::SenderMismatch {
                claimed: envelope.sender,
                registered: identity,
            }
            .into());
        }

        match envelope.msg_type {
            MessageType::Ping => self.pong(&envelope).await,
            MessageType::Pong | MessageType::Ack => Ok(Flow::Continue),
            MessageType::Join => Err(ValidationError::AlreadyJoined { identity }.into()),
            MessageType::Leave => self.leave(&identity).await,
            MessageType::Bind => self.bind(&identity, &envelope).await,
            MessageType::Unbind => self.unbind(&identity, &envelope).await,
            MessageType::Action => self.action(&identity, &envelope).await,
            MessageType::State => self.state_update(&identity, &envelope).await,
            MessageType::DirectMessage | MessageType::Error => {
                self.hub.route(&envelope).await?;
                Ok(Flow::Continue)
            }
            MessageType::Status => {
                let report = Envelope::from_hub(MessageType::Status, identity, self.hub.status_report());
                self.reply(&report).await?;
                Ok(Flow::Continue)
            }
        }
    }

    async fn pong(&self, ping: &Envelope) -> Result<Flow, HubError> {
        let pong = Envelope::from_hub(
            MessageType::Pong,
            ping.sender.clone(),
            json!({ "timestamp": ping.timestamp }),
        );
        self.reply(&pong).await?;
        Ok(Flow::Continue)
    }

    async fn join(&mut self, envelope: &Envelope) -> Result<Flow, HubError> {
        let identity = envelope.sender.clone();
        if identity.is_hub() {
            return Err(ValidationError::CannotJoinAsHub.into());
        }
        let replaced = self.hub.register(&identity, Arc::clone(&self.conn));
        self.state = SessionState::Registered(identity.clone());

        let ack = Envelope::from_hub(
            MessageType::Ack,
            identity.clone(),
            ack_payload(
                "registered",
                json!({ "identity": identity, "replaced": replaced, "conn_id": self.conn.id }),
            ),
        );
        self.reply(&ack).await?;
        Ok(Flow::Continue)
    }

    async fn leave(&mut self, identity: &Identity) -> Result<Flow, HubError> {
        let ack = Envelope::from_hub(MessageType::Ack, identity.clone(), ack_payload("left", json!({})));
        if let Err(e) = self.reply(&ack).await {
            debug!(%identity, error = %e, "leave ack not delivered");
        }
        self.state = SessionState::Closed;
        self.hub.disconnect(identity, Some(&self.conn.id), "client left").await;
        info!(%identity, "client left");
        Ok(Flow::Close)
    }

    async fn bind(&self, identity: &Identity, envelope: &Envelope) -> Result<Flow, HubError> {
        require_member(identity, MessageType::Bind)?;
        require_recipient(envelope, Role::Env)?;
        let env_id = envelope.recipient.id_str();

        self.hub.bind(env_id, identity)?;

        let ack = Envelope::from_hub(MessageType::Ack, identity.clone(), ack_payload("bound", json!({ "env_id": env_id })));
        self.reply(&ack).await?;
        self.hub.notify(&Identity::env(env_id), envelope).await;
        Ok(Flow::Continue)
    }

    async fn unbind(&self, identity: &Identity, envelope: &Envelope) -> Result<Flow, HubError> {
        require_member(identity, MessageType::Unbind)?;
        let previous = self.hub.unbind(identity);

        let ack = Envelope::from_hub(
            MessageType::Ack,
            identity.clone(),
            ack_payload("unbound", json!({ "env_id": previous })),
        );
        self.reply(&ack).await?;
        if let Some(env_id) = previous {
            self.hub.notify(&Identity::env(env_id), envelope).await;
        }
        Ok(Flow::Continue)
    }

    async fn action(&self, identity: &Identity, envelope: &Envelope) -> Result<Flow, HubError> {
        require_member(identity, MessageType::Action)?;
        if self.hub.env_of(identity).is_none() {
            return Err(ValidationError::NotBound {
                identity: identity.clone(),
            }
            .into());
        }
        require_recipient(envelope, Role::Env)?;
        self.hub.route(envelope).await?;
        Ok(Flow::Continue)
    }

    /// `state` from an env: addressed to the hub or itself it fans out to
    /// all bound members; addressed to one member it is a unicast.
    async fn state_update(&self, identity: &Identity, envelope: &Envelope) -> Result<Flow, HubError> {
        if identity.role != Role::Env {
            return Err(ValidationError::RoleNotPermitted {
                msg_type: MessageType::State,
                role: identity.role,
            }
            .into());
        }
        let own = identity.id_str();
        let recipient = &envelope.recipient;

        match recipient.role {
            Role::Hub | Role::Env => {
                if recipient.role == Role::Env && recipient.id_str() != own {
                    return Err(RoutingError::EnvMismatch {
                        requested: recipient.id_str().to_string(),
                        bound: own.to_string(),
                    }
                    .into());
                }
                self.hub.broadcast_state(own, envelope).await?;
            }
            Role::Agent | Role::Human => {
                let bound_here = self.hub.env_of(recipient).as_deref() == Some(own);
                if !bound_here && self.hub.lookup(recipient).is_some() {
                    return Err(RoutingError::NotInEnvironment {
                        member: recipient.clone(),
                        env_id: own.to_string(),
                    }
                    .into());
                }
                self.hub.route(envelope).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn reply(&self, envelope: &Envelope) -> Result<(), HubError> {
        let text = Arc::new(codec::encode(envelope)?);
        self.conn
            .deliver(text, self.hub.routing().send_timeout)
            .await
            .map_err(|e| {
                DeliveryError {
                    recipient: envelope.recipient.clone(),
                    reason: e.to_string(),
                }
                .into()
            })
    }
}

fn require_member(identity: &Identity, msg_type: MessageType) -> Result<(), ValidationError> {
    if identity.role.is_member() {
        Ok(())
    } else {
        Err(ValidationError::RoleNotPermitted {
            msg_type,
            role: identity.role,
        })
    }
}

fn require_recipient(envelope: &Envelope, expected: Role) -> Result<(), ValidationError> {
    if envelope.recipient.role == expected {
        Ok(())
    } else {
        Err(ValidationError::Misaddressed {
            msg_type: envelope.msg_type,
            expected,
            actual: envelope.recipient.role,
        })
    }
}
