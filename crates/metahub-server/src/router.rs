//! Destination resolution and forwarding.
//!
//! The router raises errors and never replies to clients itself; the
//! session boundary turns whatever comes back into an `error` envelope.

use std::sync::Arc;

use futures::future::join_all;
use metahub_core::{
    codec, DeliveryError, Envelope, HubError, Identity, MessageType, Role, RoutingError,
    ValidationError,
};
use tracing::{debug, warn};

use crate::connection::ClientConnection;
use crate::hub::Hub;

impl Hub {
    /// Forward `envelope` to its resolved destination.
    ///
    /// * env recipient: the sender's bound env (members) or the named env
    ///   (env senders). A mismatching id is a routing error.
    /// * agent/human recipient: looked up directly; a miss lists the ids
    ///   that are connected under that role.
    pub async fn route(&self, envelope: &Envelope) -> Result<(), HubError> {
        let target = self.resolve(envelope)?;
        let conn = self.lookup(&target).ok_or_else(|| match target.role {
            Role::Env => RoutingError::EnvNotConnected {
                env_id: target.id_str().to_string(),
            },
            role => RoutingError::RecipientNotFound {
                recipient: target.clone(),
                available: self.list(role),
            },
        })?;

        let text = Arc::new(codec::encode(envelope)?);
        self.deliver(&target, &conn, Arc::clone(&text)).await?;

        if envelope.msg_type == MessageType::DirectMessage && target.role.is_member() {
            self.carbon_copy(&envelope.sender, text).await;
        }
        Ok(())
    }

    fn resolve(&self, envelope: &Envelope) -> Result<Identity, HubError> {
        let recipient = &envelope.recipient;
        match recipient.role {
            Role::Hub => Err(RoutingError::HubNotAddressable {
                msg_type: envelope.msg_type,
            }
            .into()),
            Role::Agent | Role::Human => Ok(recipient.clone()),
            Role::Env if envelope.sender.role == Role::Env => Ok(recipient.clone()),
            Role::Env => {
                let bound = self.env_of(&envelope.sender).ok_or_else(|| ValidationError::NotBound {
                    identity: envelope.sender.clone(),
                })?;
                match recipient.id.as_deref() {
                    Some(requested) if requested != bound => Err(RoutingError::EnvMismatch {
                        requested: requested.to_string(),
                        bound,
                    }
                    .into()),
                    _ => Ok(Identity::env(bound)),
                }
            }
        }
    }

    /// Send `envelope` to every member bound to `env_id`.
    ///
    /// Membership is snapshotted under the lock, then each member is sent to
    /// independently. One failing member never stops the others; failures
    /// come back together as [`HubError::PartialBroadcast`]. Returns the
    /// number of members reached.
    pub async fn broadcast_state(&self, env_id: &str, envelope: &Envelope) -> Result<usize, HubError> {
        let targets = self.member_connections(env_id);
        self.metrics()
            .histogram_observe("broadcast_fanout", &[], targets.len() as f64);
        if targets.is_empty() {
            debug!(env_id, "state broadcast with no bound members");
            return Ok(0);
        }

        let text = Arc::new(codec::encode(envelope)?);
        let sends = targets.iter().map(|(member, conn)| {
            let text = Arc::clone(&text);
            async move {
                match conn {
                    Some(conn) => self.deliver(member, conn, text).await,
                    None => Err(DeliveryError {
                        recipient: member.clone(),
                        reason: "not connected".into(),
                    }),
                }
            }
        });
        let results = join_all(sends).await;

        let total = results.len();
        let failures: Vec<DeliveryError> = results.into_iter().filter_map(Result::err).collect();
        let delivered = total - failures.len();
        debug!(env_id, delivered, failed = failures.len(), "state broadcast");

        if failures.is_empty() {
            Ok(delivered)
        } else {
            Err(HubError::PartialBroadcast {
                env_id: env_id.to_string(),
                delivered,
                failures,
            })
        }
    }

    /// Push one encoded frame to `target`.
    ///
    /// A failed send means the transport is dead: the connection is
    /// unregistered (with its cascade) before the error is returned.
    pub async fn deliver(
        &self,
        target: &Identity,
        conn: &Arc<ClientConnection>,
        text: Arc<String>,
    ) -> Result<(), DeliveryError> {
        match conn.deliver(text, self.routing().send_timeout).await {
            Ok(()) => {
                self.metrics().counter_inc("messages_routed_total", &[], 1);
                Ok(())
            }
            Err(failure) => {
                warn!(recipient = %target, conn_id = %conn.id, error = %failure, "delivery failed, dropping connection");
                self.metrics().counter_inc("delivery_failures_total", &[], 1);
                self.disconnect(target, Some(&conn.id), "delivery failed").await;
                Err(DeliveryError {
                    recipient: target.clone(),
                    reason: failure.to_string(),
                })
            }
        }
    }

    /// Best-effort forward that only logs on failure.
    pub async fn notify(&self, target: &Identity, envelope: &Envelope) {
        let Some(conn) = self.lookup(target) else {
            debug!(recipient = %target, msg_type = %envelope.msg_type, "notify target not connected");
            return;
        };
        match codec::encode(envelope) {
            Ok(text) => {
                let _ = self.deliver(target, &conn, Arc::new(text)).await;
            }
            Err(e) => warn!(recipient = %target, error = %e, "failed to encode notification"),
        }
    }

    async fn carbon_copy(&self, sender: &Identity, text: Arc<String>) {
        if !self.routing().carbon_copy_env || !sender.role.is_member() {
            return;
        }
        let Some(env_id) = self.env_of(sender) else { return };
        let env = Identity::env(env_id);
        let Some(conn) = self.lookup(&env) else { return };
        if let Err(e) = self.deliver(&env, &conn, text).await {
            debug!(%sender, error = %e, "carbon copy to env failed");
        }
    }
}
