//! Authentication realms and the realm binder.
//!
//! A realm is an authentication domain a session binds to by username
//! matching: local realms verify passwords against a users table loaded
//! from a JSON file, RADIUS realms carry the server coordinates the EAP
//! bridge relays to. Realms are replaced on reload; an old realm is never
//! freed synchronously, it is marked `disposing` (blocking new bindings)
//! and reaped by the periodic sweep once no session points at it.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Default RADIUS request timeout when the realm does not set one.
pub const DEFAULT_RADIUS_TIMEOUT: Duration = Duration::from_secs(9);

#[derive(Debug, Error)]
pub enum RealmError {
    #[error("users file: {0}")]
    UsersIo(#[from] std::io::Error),

    #[error("users file: {0}")]
    UsersFormat(#[from] serde_json::Error),

    #[error("realm '{label}': invalid server address '{server}'")]
    ServerAddress { label: String, server: String },
}

/// One entry of a local realm's users file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LocalUser {
    pub username: String,
    pub password: String,
    /// Fixed address handed to the session when the interface allows
    /// fixed assignment.
    #[serde(default)]
    pub framed_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub framed_prefix: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct UsersFile {
    users: Vec<LocalUser>,
}

/// What backs a realm.
#[derive(Debug, Clone, PartialEq)]
pub enum RealmKind {
    Local {
        users: HashMap<String, LocalUser>,
    },
    Radius {
        server: SocketAddr,
        secret: String,
        timeout: Duration,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Realm {
    label: String,
    /// Username suffix the realm claims; empty matches every user.
    suffix: String,
    /// Optional additional prefix the username must carry.
    prefix: String,
    kind: RealmKind,
    ready: bool,
    disposing: bool,
}

impl Realm {
    pub fn local(label: &str, suffix: &str, prefix: &str, users: Vec<LocalUser>) -> Self {
        let users = users
            .into_iter()
            .map(|u| (u.username.clone(), u))
            .collect();
        Realm {
            label: label.to_string(),
            suffix: suffix.to_string(),
            prefix: prefix.to_string(),
            kind: RealmKind::Local { users },
            ready: true,
            disposing: false,
        }
    }

    pub fn local_from_file(
        label: &str,
        suffix: &str,
        prefix: &str,
        path: &Path,
    ) -> Result<Self, RealmError> {
        let raw = std::fs::read_to_string(path)?;
        let file: UsersFile = serde_json::from_str(&raw)?;
        debug!("realm '{label}': loaded {} users from {}", file.users.len(), path.display());
        Ok(Realm::local(label, suffix, prefix, file.users))
    }

    pub fn radius(
        label: &str,
        suffix: &str,
        prefix: &str,
        server: &str,
        secret: &str,
        timeout: Option<Duration>,
    ) -> Result<Self, RealmError> {
        let server: SocketAddr = server.parse().map_err(|_| RealmError::ServerAddress {
            label: label.to_string(),
            server: server.to_string(),
        })?;
        Ok(Realm {
            label: label.to_string(),
            suffix: suffix.to_string(),
            prefix: prefix.to_string(),
            kind: RealmKind::Radius {
                server,
                secret: secret.to_string(),
                timeout: timeout.unwrap_or(DEFAULT_RADIUS_TIMEOUT),
            },
            ready: true,
            disposing: false,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn kind(&self) -> &RealmKind {
        &self.kind
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, RealmKind::Local { .. })
    }

    pub fn is_radius(&self) -> bool {
        matches!(self.kind, RealmKind::Radius { .. })
    }

    /// Only RADIUS realms can terminate an EAP pass-through exchange.
    pub fn is_eap_capable(&self) -> bool {
        self.is_radius()
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing
    }

    /// Usable for new bindings.
    pub fn is_usable(&self) -> bool {
        self.ready && !self.disposing
    }

    /// Suffix and prefix both claim the username. An empty suffix
    /// matches everyone; a non-empty suffix must be a proper suffix,
    /// shorter than the username itself.
    pub fn matches(&self, username: &str) -> bool {
        if !self.suffix.is_empty()
            && (self.suffix.len() >= username.len() || !username.ends_with(&self.suffix))
        {
            return false;
        }
        if !self.prefix.is_empty() && !username.starts_with(&self.prefix) {
            return false;
        }
        true
    }

    pub fn has_user(&self, username: &str) -> bool {
        match &self.kind {
            RealmKind::Local { users } => users.contains_key(username),
            RealmKind::Radius { .. } => false,
        }
    }

    /// Verify a password against the local users table. Always false for
    /// RADIUS realms, which never see cleartext passwords here.
    pub fn verify_password(&self, username: &str, password: &str) -> bool {
        match &self.kind {
            RealmKind::Local { users } => users
                .get(username)
                .is_some_and(|u| u.password == password),
            RealmKind::Radius { .. } => false,
        }
    }

    /// Fixed address the realm configures for the user, if any.
    pub fn framed_ip(&self, username: &str) -> Option<(Ipv4Addr, u8)> {
        match &self.kind {
            RealmKind::Local { users } => users
                .get(username)
                .and_then(|u| u.framed_ip.map(|ip| (ip, u.framed_prefix.unwrap_or(32)))),
            RealmKind::Radius { .. } => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BindError {
    #[error("user '{0}' could not bind any realm")]
    RealmNotFound(String),
}

/// All realms of the running configuration, in configuration order.
#[derive(Debug, Default)]
pub struct RealmSet {
    realms: Vec<Realm>,
}

impl RealmSet {
    pub fn new(realms: Vec<Realm>) -> Self {
        RealmSet { realms }
    }

    pub fn get(&self, label: &str) -> Option<&Realm> {
        self.realms.iter().find(|r| r.label == label)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.realms.iter().map(|r| r.label.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Realm> {
        self.realms.iter()
    }

    /// Pick the realm for `username`.
    ///
    /// With an explicit ordered `realm_list` the longest matching suffix
    /// wins; among equal suffix lengths the earlier list entry sticks.
    /// Realms that are not usable, or not EAP-capable when the session
    /// needs EAP, are skipped. Without a list the legacy order applies:
    /// the first local realm that knows the user, else the first RADIUS
    /// realm.
    pub fn bind(
        &self,
        username: &str,
        eap_required: bool,
        realm_list: Option<&[String]>,
    ) -> Result<&Realm, BindError> {
        let list = match realm_list {
            Some(list) => list,
            None => {
                for realm in self.realms.iter().filter(|r| r.is_usable()) {
                    match &realm.kind {
                        RealmKind::Local { .. } if realm.has_user(username) => {
                            debug!("user '{username}' bound realm '{}' (legacy order)", realm.label);
                            return Ok(realm);
                        }
                        RealmKind::Radius { .. } => {
                            debug!("user '{username}' bound realm '{}' (legacy order)", realm.label);
                            return Ok(realm);
                        }
                        _ => {}
                    }
                }
                info!("user '{username}' could not bind any realm");
                return Err(BindError::RealmNotFound(username.to_string()));
            }
        };

        let mut best: Option<&Realm> = None;
        let mut best_suffix: Option<usize> = None;
        for label in list {
            let realm = match self.realms.iter().find(|r| {
                r.is_usable() && (!eap_required || r.is_eap_capable()) && r.label == *label
            }) {
                Some(realm) => realm,
                None => continue,
            };
            if best_suffix.is_some_and(|len| realm.suffix.len() <= len) {
                continue;
            }
            if realm.matches(username) {
                best_suffix = Some(realm.suffix.len());
                best = Some(realm);
            }
        }
        match best {
            Some(realm) => {
                debug!("user '{username}' bound realm '{}'", realm.label);
                Ok(realm)
            }
            None => {
                info!("user '{username}' could not bind any realm");
                Err(BindError::RealmNotFound(username.to_string()))
            }
        }
    }

    /// Block new bindings to `label`; the sweep reaps it later.
    pub fn mark_disposing(&mut self, label: &str) {
        if let Some(realm) = self.realms.iter_mut().find(|r| r.label == label) {
            realm.disposing = true;
        }
    }

    pub fn disposing_labels(&self) -> Vec<String> {
        self.realms
            .iter()
            .filter(|r| r.disposing)
            .map(|r| r.label.clone())
            .collect()
    }

    /// Drop disposing realms for which `is_bound` reports no remaining
    /// session. Returns the labels freed.
    pub fn reap_disposing(&mut self, is_bound: impl Fn(&str) -> bool) -> Vec<String> {
        let mut freed = Vec::new();
        self.realms.retain(|r| {
            if r.disposing && !is_bound(&r.label) {
                freed.push(r.label.clone());
                false
            } else {
                true
            }
        });
        for label in &freed {
            info!("realm '{label}' disposed");
        }
        freed
    }

    /// Install the realms of a new configuration generation. Existing
    /// realms missing from the new set are marked disposing and kept
    /// until the sweep frees them.
    pub fn replace(&mut self, new_realms: Vec<Realm>) {
        let kept: Vec<String> = new_realms.iter().map(|r| r.label.clone()).collect();
        for old in self.realms.iter_mut() {
            if !kept.contains(&old.label) {
                info!("realm '{}' removed from configuration, disposing", old.label);
                old.disposing = true;
            }
        }
        // Replaced realms swap their definition in place; disposing
        // leftovers stay at the tail.
        let mut merged = new_realms;
        for old in self.realms.drain(..) {
            if old.disposing {
                merged.push(old);
            }
        }
        self.realms = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> Vec<LocalUser> {
        vec![
            LocalUser {
                username: "alice".to_string(),
                password: "pw-a".to_string(),
                framed_ip: Some(Ipv4Addr::new(10, 0, 0, 2)),
                framed_prefix: None,
            },
            LocalUser {
                username: "bob".to_string(),
                password: "pw-b".to_string(),
                framed_ip: None,
                framed_prefix: None,
            },
        ]
    }

    fn set() -> RealmSet {
        RealmSet::new(vec![
            Realm::local("local", "", "", users()),
            Realm::radius("radius", "@example.com", "", "127.0.0.1:1812", "secret", None)
                .unwrap(),
        ])
    }

    #[test]
    fn longest_suffix_wins() {
        let set = set();
        let list = vec!["local".to_string(), "radius".to_string()];
        let realm = set.bind("alice@example.com", false, Some(&list)).unwrap();
        assert_eq!(realm.label(), "radius");

        // Plain user only matches the empty suffix.
        let realm = set.bind("alice", false, Some(&list)).unwrap();
        assert_eq!(realm.label(), "local");
    }

    #[test]
    fn equal_suffix_first_listed_wins() {
        let set = RealmSet::new(vec![
            Realm::local("a", "", "", users()),
            Realm::local("b", "", "", users()),
        ]);
        let list = vec!["b".to_string(), "a".to_string()];
        assert_eq!(set.bind("bob", false, Some(&list)).unwrap().label(), "b");
    }

    #[test]
    fn suffix_must_be_proper() {
        // A username that IS the suffix does not match it.
        let set = set();
        let list = vec!["radius".to_string()];
        assert_eq!(
            set.bind("@example.com", false, Some(&list)),
            Err(BindError::RealmNotFound("@example.com".to_string()))
        );
    }

    #[test]
    fn prefix_constrains_match() {
        let set = RealmSet::new(vec![Realm::local("corp", "", "CORP\\", users())]);
        let list = vec!["corp".to_string()];
        assert!(set.bind("CORP\\alice", false, Some(&list)).is_ok());
        assert!(set.bind("alice", false, Some(&list)).is_err());
    }

    #[test]
    fn eap_required_skips_local_realms() {
        let set = set();
        let list = vec!["local".to_string(), "radius".to_string()];
        let realm = set.bind("alice@example.com", true, Some(&list)).unwrap();
        assert_eq!(realm.label(), "radius");
        // Plain user matches only the local realm, which cannot do EAP.
        assert!(set.bind("alice", true, Some(&list)).is_err());
    }

    #[test]
    fn legacy_order_prefers_local_user_then_radius() {
        let set = set();
        assert_eq!(set.bind("alice", false, None).unwrap().label(), "local");
        // Unknown locally: falls through to the RADIUS realm.
        assert_eq!(set.bind("mallory", false, None).unwrap().label(), "radius");
    }

    #[test]
    fn disposing_blocks_new_bindings() {
        let mut set = set();
        set.mark_disposing("local");
        assert_eq!(set.bind("alice", false, None).unwrap().label(), "radius");
        let list = vec!["local".to_string()];
        assert!(set.bind("alice", false, Some(&list)).is_err());
    }

    #[test]
    fn reap_waits_for_bound_sessions() {
        let mut set = set();
        set.mark_disposing("local");
        assert!(set.reap_disposing(|label| label == "local").is_empty());
        assert_eq!(set.reap_disposing(|_| false), vec!["local".to_string()]);
        assert!(set.get("local").is_none());
        assert!(set.get("radius").is_some());
    }

    #[test]
    fn replace_disposes_removed_realms() {
        let mut set = set();
        set.replace(vec![Realm::local("local", "", "", users())]);
        assert!(set.get("radius").unwrap().is_disposing());
        assert!(set.get("local").unwrap().is_usable());
    }

    #[test]
    fn password_and_framed_ip_lookup() {
        let set = set();
        let local = set.get("local").unwrap();
        assert!(local.verify_password("alice", "pw-a"));
        assert!(!local.verify_password("alice", "wrong"));
        assert!(!local.verify_password("mallory", "pw-a"));
        assert_eq!(
            local.framed_ip("alice"),
            Some((Ipv4Addr::new(10, 0, 0, 2), 32))
        );
        assert_eq!(local.framed_ip("bob"), None);

        let radius = set.get("radius").unwrap();
        assert!(!radius.verify_password("alice", "pw-a"));
        assert!(radius.is_eap_capable());
    }

    #[test]
    fn bad_server_address_rejected() {
        assert!(matches!(
            Realm::radius("r", "", "", "not-an-addr", "s", None),
            Err(RealmError::ServerAddress { .. })
        ));
    }
}
