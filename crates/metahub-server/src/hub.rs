//! Shared hub state: registry and binding table behind one lock.
//!
//! Every mutation that touches both structures (register, unregister with
//! its cascade, bind) happens inside a single critical section. Connection
//! handles are cloned out before the lock is released; nothing here awaits
//! while holding it.

use std::collections::BTreeMap;
use std::sync::Arc;

use metahub_core::{codec, BindingError, Envelope, Identity, MessageType, Role};
use metahub_telemetry::MetricsRecorder;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::binding::BindingTable;
use crate::config::RoutingConfig;
use crate::connection::ClientConnection;
use crate::registry::ClientRegistry;

#[derive(Debug, Default)]
struct HubState {
    registry: ClientRegistry,
    bindings: BindingTable,
}

/// What an unregister removed, captured under the lock so notices can be
/// sent after it is released.
#[derive(Debug)]
pub struct Departure {
    pub identity: Identity,
    pub conn: Arc<ClientConnection>,
    /// Env the departing member was bound to.
    pub left_env: Option<String>,
    /// Members force-unbound because the departing client was their env.
    pub orphans: Vec<(Identity, Option<Arc<ClientConnection>>)>,
}

/// The hub. Constructed once per server and shared by `Arc`.
pub struct Hub {
    state: Mutex<HubState>,
    routing: RoutingConfig,
    metrics: Arc<MetricsRecorder>,
}

impl Hub {
    pub fn new(routing: RoutingConfig, metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            routing,
            metrics,
        }
    }

    pub fn routing(&self) -> &RoutingConfig {
        &self.routing
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    /// Register `conn` as `identity`, closing any connection it replaces.
    ///
    /// Existing bindings survive a replacement. Returns whether a prior
    /// connection was replaced.
    pub fn register(&self, identity: &Identity, conn: Arc<ClientConnection>) -> bool {
        let conn_id = conn.id.clone();
        let prior = self.state.lock().registry.register(identity.clone(), conn);
        match prior {
            Some(prior) => {
                info!(%identity, conn_id, replaced = %prior.id, "client re-registered, closing prior connection");
                prior.close();
                true
            }
            None => {
                info!(%identity, conn_id, "client registered");
                false
            }
        }
    }

    /// Remove `identity` and cascade its bindings.
    pub fn unregister(&self, identity: &Identity) -> Option<Departure> {
        let mut state = self.state.lock();
        let conn = state.registry.unregister(identity)?;
        Some(cascade(&mut state, identity, conn))
    }

    /// Like [`Hub::unregister`], but only while `identity` still maps to `conn_id`.
    pub fn unregister_if_current(&self, identity: &Identity, conn_id: &str) -> Option<Departure> {
        let mut state = self.state.lock();
        let conn = state.registry.unregister_if(identity, conn_id)?;
        Some(cascade(&mut state, identity, conn))
    }

    /// Unregister, close the transport and notify orphaned members.
    ///
    /// With `conn_id`, a close event from a connection that has already been
    /// replaced is ignored.
    pub async fn disconnect(&self, identity: &Identity, conn_id: Option<&str>, reason: &str) -> bool {
        let departure = match conn_id {
            Some(conn_id) => self.unregister_if_current(identity, conn_id),
            None => self.unregister(identity),
        };
        let Some(departure) = departure else {
            debug!(%identity, ?conn_id, "disconnect ignored, not the current connection");
            return false;
        };
        departure.conn.close();
        info!(
            %identity,
            conn_id = %departure.conn.id,
            reason,
            left_env = ?departure.left_env,
            orphans = departure.orphans.len(),
            "client unregistered"
        );
        self.notify_orphans(&departure, reason).await;
        true
    }

    async fn notify_orphans(&self, departure: &Departure, reason: &str) {
        let env_id = departure.identity.id_str();
        for (member, conn) in &departure.orphans {
            let Some(conn) = conn else { continue };
            let notice = Envelope::from_hub(
                MessageType::Leave,
                member.clone(),
                json!({ "env_id": env_id, "reason": format!("environment disconnected: {reason}") }),
            );
            let text = match codec::encode(&notice) {
                Ok(text) => Arc::new(text),
                Err(e) => {
                    warn!(%member, error = %e, "failed to encode leave notice");
                    continue;
                }
            };
            if let Err(e) = conn.deliver(text, self.routing.send_timeout).await {
                warn!(%member, env_id, error = %e, "leave notice not delivered");
            }
        }
    }

    /// Attach `member` to the connected env `env_id`.
    pub fn bind(&self, env_id: &str, member: &Identity) -> Result<bool, BindingError> {
        let mut state = self.state.lock();
        if !state.registry.contains(&Identity::env(env_id)) {
            return Err(BindingError::EnvNotRegistered {
                env_id: env_id.to_string(),
            });
        }
        if !state.registry.contains(member) {
            return Err(BindingError::MemberNotRegistered {
                identity: member.clone(),
            });
        }
        let created = state.bindings.bind(env_id, member)?;
        if created {
            info!(%member, env_id, "member bound");
        }
        Ok(created)
    }

    /// Idempotent; returns the env the member was bound to, if any.
    pub fn unbind(&self, member: &Identity) -> Option<String> {
        let previous = self.state.lock().bindings.unbind(member);
        if let Some(env_id) = &previous {
            info!(%member, env_id, "member unbound");
        }
        previous
    }

    pub fn env_of(&self, member: &Identity) -> Option<String> {
        self.state.lock().bindings.env_of(member).map(str::to_string)
    }

    pub fn members_of(&self, env_id: &str) -> Vec<Identity> {
        self.state.lock().bindings.members_of(env_id)
    }

    pub fn lookup(&self, identity: &Identity) -> Option<Arc<ClientConnection>> {
        self.state.lock().registry.lookup(identity)
    }

    /// Sorted ids currently connected under `role`.
    pub fn list(&self, role: Role) -> Vec<String> {
        self.state.lock().registry.list(role)
    }

    /// Live connections for every bound member of `env_id`, taken in one
    /// critical section.
    pub(crate) fn member_connections(&self, env_id: &str) -> Vec<(Identity, Option<Arc<ClientConnection>>)> {
        let state = self.state.lock();
        state
            .bindings
            .members_of(env_id)
            .into_iter()
            .map(|member| {
                let conn = state.registry.lookup(&member);
                (member, conn)
            })
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().registry.len()
    }

    pub fn bindings_snapshot(&self) -> BTreeMap<String, Vec<Identity>> {
        self.state.lock().bindings.snapshot()
    }

    /// Connected ids per role plus, per env, its bound agents and humans.
    pub fn status_report(&self) -> Value {
        let state = self.state.lock();
        let envs = state.registry.list(Role::Env);
        let environments: Vec<Value> = envs
            .iter()
            .map(|env_id| {
                let members = state.bindings.members_of(env_id);
                let ids = |role: Role| -> Vec<String> {
                    members
                        .iter()
                        .filter(|m| m.role == role)
                        .map(|m| m.id_str().to_string())
                        .collect()
                };
                let agents = ids(Role::Agent);
                let humans = ids(Role::Human);
                json!({
                    "env_id": env_id,
                    "agent_count": agents.len(),
                    "human_count": humans.len(),
                    "agents": agents,
                    "humans": humans,
                })
            })
            .collect();
        json!({
            "connections": state.registry.len(),
            "clients": {
                "env": envs,
                "agent": state.registry.list(Role::Agent),
                "human": state.registry.list(Role::Human),
            },
            "environments": environments,
        })
    }
}

fn cascade(state: &mut HubState, identity: &Identity, conn: Arc<ClientConnection>) -> Departure {
    let mut departure = Departure {
        identity: identity.clone(),
        conn,
        left_env: None,
        orphans: Vec::new(),
    };
    match identity.role {
        Role::Env => {
            departure.orphans = state
                .bindings
                .remove_env(identity.id_str())
                .into_iter()
                .map(|member| {
                    let conn = state.registry.lookup(&member);
                    (member, conn)
                })
                .collect();
        }
        Role::Agent | Role::Human => {
            departure.left_env = state.bindings.unbind(identity);
        }
        Role::Hub => {}
    }
    departure
}
