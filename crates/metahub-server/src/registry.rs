//! Live connection directory keyed by [`Identity`].
//!
//! Not synchronized on its own: the [`Hub`](crate::hub::Hub) keeps it behind
//! the same lock as the binding table so that cascades are atomic.

use std::collections::HashMap;
use std::sync::Arc;

use metahub_core::{Identity, Role};

use crate::connection::ClientConnection;

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<Identity, Arc<ClientConnection>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `conn` under `identity`, returning the connection it displaced.
    ///
    /// Re-registering the same connection is a no-op and returns `None`.
    pub fn register(
        &mut self,
        identity: Identity,
        conn: Arc<ClientConnection>,
    ) -> Option<Arc<ClientConnection>> {
        let prior = self.clients.insert(identity, Arc::clone(&conn))?;
        (prior.id != conn.id).then_some(prior)
    }

    pub fn unregister(&mut self, identity: &Identity) -> Option<Arc<ClientConnection>> {
        self.clients.remove(identity)
    }

    /// Remove `identity` only while it still maps to connection `conn_id`.
    pub fn unregister_if(&mut self, identity: &Identity, conn_id: &str) -> Option<Arc<ClientConnection>> {
        match self.clients.get(identity) {
            Some(current) if current.id == conn_id => self.clients.remove(identity),
            _ => None,
        }
    }

    pub fn lookup(&self, identity: &Identity) -> Option<Arc<ClientConnection>> {
        self.clients.get(identity).cloned()
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.clients.contains_key(identity)
    }

    /// Sorted ids of every connected client with `role`.
    pub fn list(&self, role: Role) -> Vec<String> {
        let mut ids: Vec<String> = self
            .clients
            .keys()
            .filter(|identity| identity.role == role)
            .map(|identity| identity.id_str().to_string())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn conn(id: &str) -> Arc<ClientConnection> {
        let (tx, _rx) = mpsc::channel(1);
        Arc::new(ClientConnection::with_id(id, tx))
    }

    #[test]
    fn register_and_lookup() {
        let mut reg = ClientRegistry::new();
        assert!(reg.register(Identity::agent("a1"), conn("c1")).is_none());
        assert_eq!(reg.lookup(&Identity::agent("a1")).unwrap().id, "c1");
        assert!(reg.lookup(&Identity::human("a1")).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn register_replaces_prior_connection() {
        let mut reg = ClientRegistry::new();
        reg.register(Identity::agent("a1"), conn("c1"));
        let prior = reg.register(Identity::agent("a1"), conn("c2")).unwrap();
        assert_eq!(prior.id, "c1");
        assert_eq!(reg.lookup(&Identity::agent("a1")).unwrap().id, "c2");
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn reregistering_same_connection_is_not_a_replacement() {
        let mut reg = ClientRegistry::new();
        let c = conn("c1");
        reg.register(Identity::env("e1"), Arc::clone(&c));
        assert!(reg.register(Identity::env("e1"), c).is_none());
    }

    #[test]
    fn unregister_if_ignores_stale_connection() {
        let mut reg = ClientRegistry::new();
        reg.register(Identity::agent("a1"), conn("c1"));
        reg.register(Identity::agent("a1"), conn("c2"));

        assert!(reg.unregister_if(&Identity::agent("a1"), "c1").is_none());
        assert!(reg.contains(&Identity::agent("a1")));
        assert!(reg.unregister_if(&Identity::agent("a1"), "c2").is_some());
        assert!(reg.is_empty());
    }

    #[test]
    fn list_filters_by_role_and_sorts() {
        let mut reg = ClientRegistry::new();
        reg.register(Identity::agent("b"), conn("c1"));
        reg.register(Identity::agent("a"), conn("c2"));
        reg.register(Identity::human("a"), conn("c3"));
        reg.register(Identity::env("e1"), conn("c4"));

        assert_eq!(reg.list(Role::Agent), vec!["a", "b"]);
        assert_eq!(reg.list(Role::Human), vec!["a"]);
        assert_eq!(reg.list(Role::Env), vec!["e1"]);
        assert!(reg.list(Role::Hub).is_empty());
    }
}
