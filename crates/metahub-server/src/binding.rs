//! Member ↔ environment attachments.
//!
//! Two maps kept in lockstep: `env_of` answers "which env is this member
//! bound to" in O(1), `members` answers "who gets this env's state".
//! Whether the env is actually connected is checked by the hub, which holds
//! the registry under the same lock.

use std::collections::{BTreeMap, HashMap, HashSet};

use metahub_core::{BindingError, Identity};

#[derive(Debug, Default)]
pub struct BindingTable {
    env_of: HashMap<Identity, String>,
    members: HashMap<String, HashSet<Identity>>,
}

impl BindingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `member` to `env_id`.
    ///
    /// Returns `false` when the member was already bound to that same env.
    pub fn bind(&mut self, env_id: &str, member: &Identity) -> Result<bool, BindingError> {
        if !member.role.is_member() {
            return Err(BindingError::NotAMember {
                identity: member.clone(),
            });
        }
        match self.env_of.get(member) {
            Some(current) if current == env_id => return Ok(false),
            Some(current) => {
                return Err(BindingError::AlreadyBound {
                    member: member.clone(),
                    current: current.clone(),
                    requested: env_id.to_string(),
                })
            }
            None => {}
        }
        self.env_of.insert(member.clone(), env_id.to_string());
        self.members
            .entry(env_id.to_string())
            .or_default()
            .insert(member.clone());
        Ok(true)
    }

    /// Detach `member`, returning the env it was bound to. No-op if unbound.
    pub fn unbind(&mut self, member: &Identity) -> Option<String> {
        let env_id = self.env_of.remove(member)?;
        if let Some(set) = self.members.get_mut(&env_id) {
            set.remove(member);
            if set.is_empty() {
                self.members.remove(&env_id);
            }
        }
        Some(env_id)
    }

    /// Force-unbind every member of `env_id`, returning them.
    pub fn remove_env(&mut self, env_id: &str) -> Vec<Identity> {
        let mut orphans: Vec<Identity> = self
            .members
            .remove(env_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for member in &orphans {
            self.env_of.remove(member);
        }
        sort_identities(&mut orphans);
        orphans
    }

    /// Bound members of `env_id`, ordered by role then id.
    pub fn members_of(&self, env_id: &str) -> Vec<Identity> {
        let mut out: Vec<Identity> = self
            .members
            .get(env_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        sort_identities(&mut out);
        out
    }

    pub fn env_of(&self, member: &Identity) -> Option<&str> {
        self.env_of.get(member).map(String::as_str)
    }

    /// Every env with at least one member.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<Identity>> {
        self.members
            .keys()
            .map(|env_id| (env_id.clone(), self.members_of(env_id)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.env_of.len()
    }

    pub fn is_empty(&self) -> bool {
        self.env_of.is_empty()
    }
}

fn sort_identities(ids: &mut [Identity]) {
    ids.sort_by(|a, b| (a.role, a.id_str()).cmp(&(b.role, b.id_str())));
}
