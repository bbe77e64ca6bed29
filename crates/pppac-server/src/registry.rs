//! Session registry: the sole owner of session objects.
//!
//! Besides the id map it keeps a username index, maintained only while a
//! session's address is enabled, so per-user concurrency checks and
//! `disconnect-user` see exactly the sessions that hold live addresses.

use crate::session::{Session, SessionId, TunnelMeta};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct SessionRegistry {
    next_id: u64,
    by_id: HashMap<SessionId, Session>,
    by_user: HashMap<String, Vec<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn create(&mut self, username: &str, tunnel: TunnelMeta) -> SessionId {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        self.by_id.insert(id, Session::new(id, username, tunnel));
        id
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.by_id.get_mut(&id)
    }

    /// Remove the session object. The caller must already have torn down
    /// its bindings; removing twice is a no-op.
    pub fn remove(&mut self, id: SessionId) -> Option<Session> {
        let session = self.by_id.remove(&id)?;
        self.deindex_user(id, &session.username);
        Some(session)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.by_id.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.by_id.values()
    }

    /// Put the session under its username in the user index. Idempotent.
    pub fn index_user(&mut self, id: SessionId) {
        let username = match self.by_id.get(&id) {
            Some(s) if !s.username.is_empty() => s.username.clone(),
            _ => return,
        };
        let ids = self.by_user.entry(username).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    /// Drop the session from the user index.
    pub fn deindex_user(&mut self, id: SessionId, username: &str) {
        if username.is_empty() {
            return;
        }
        if let Some(ids) = self.by_user.get_mut(username) {
            ids.retain(|other| *other != id);
            if ids.is_empty() {
                self.by_user.remove(username);
            }
        }
    }

    pub fn sessions_for_user(&self, username: &str) -> Vec<SessionId> {
        self.by_user.get(username).cloned().unwrap_or_default()
    }

    /// Number of the user's indexed sessions bound to `iface`
    /// (`user_max_session` counts per interface).
    pub fn count_user_on_iface(&self, username: &str, iface: &str) -> usize {
        self.sessions_for_user(username)
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .filter(|s| s.iface.as_deref() == Some(iface))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{test_meta, AuthMethod};

    fn registry_with(n: usize) -> (SessionRegistry, Vec<SessionId>) {
        let mut reg = SessionRegistry::new();
        let ids = (0..n)
            .map(|_| reg.create("frank", test_meta(AuthMethod::Eap)))
            .collect();
        (reg, ids)
    }

    #[test]
    fn ids_are_monotonic_and_unique() {
        let (_, ids) = registry_with(3);
        assert!(ids[0] < ids[1] && ids[1] < ids[2]);
    }

    #[test]
    fn user_index_follows_enable_disable() {
        let (mut reg, ids) = registry_with(2);
        assert!(reg.sessions_for_user("frank").is_empty());

        reg.index_user(ids[0]);
        reg.index_user(ids[0]); // idempotent
        reg.index_user(ids[1]);
        assert_eq!(reg.sessions_for_user("frank"), ids);

        reg.deindex_user(ids[0], "frank");
        assert_eq!(reg.sessions_for_user("frank"), vec![ids[1]]);
    }

    #[test]
    fn per_iface_user_count() {
        let (mut reg, ids) = registry_with(3);
        for (i, id) in ids.iter().enumerate() {
            reg.get_mut(*id).unwrap().iface =
                Some(if i < 2 { "tun0" } else { "tun1" }.to_string());
            reg.index_user(*id);
        }
        assert_eq!(reg.count_user_on_iface("frank", "tun0"), 2);
        assert_eq!(reg.count_user_on_iface("frank", "tun1"), 1);
        assert_eq!(reg.count_user_on_iface("grace", "tun0"), 0);
    }

    #[test]
    fn remove_cleans_user_index_and_is_idempotent() {
        let (mut reg, ids) = registry_with(1);
        reg.index_user(ids[0]);
        assert!(reg.remove(ids[0]).is_some());
        assert!(reg.remove(ids[0]).is_none());
        assert!(reg.sessions_for_user("frank").is_empty());
    }

    #[test]
    fn anonymous_sessions_never_indexed() {
        let mut reg = SessionRegistry::new();
        let id = reg.create("", test_meta(AuthMethod::None));
        reg.index_user(id);
        assert!(reg.sessions_for_user("").is_empty());
    }
}
