//! Per-connection session state.
//!
//! A session is created when a tunnel layer hands a negotiated connection
//! to the daemon and lives until disconnect, administrative stop, a
//! kernel-reported closure or disposal of its realm. The registry is the
//! only owner; everything else (radix table, pools, realms, interfaces)
//! refers to a session by id and is referred back to by label, never by
//! reference, so tearing either side down cannot dangle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::Ipv4Addr;

/// Unique, monotonically assigned session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle phases. `Released` is reachable from every other phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionPhase {
    Created,
    RealmBound,
    InterfaceBound,
    Authenticating,
    IpAssigned,
    Active,
    Released,
}

/// How the tunnel layer authenticated (or wants us to authenticate) the
/// peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// No peer authentication; the session binds through the
    /// `no_auth.concentrate` interface mapping.
    None,
    /// Password handed over by the tunnel layer, verified against a
    /// local realm.
    Password(String),
    /// EAP pass-through towards a RADIUS realm.
    Eap,
}

/// Facts the tunnel layer knows about the connection.
#[derive(Debug, Clone)]
pub struct TunnelMeta {
    /// Tunnel protocol name as reported by the codec (pppoe, pptp, l2tp).
    pub protocol: String,
    /// Peer endpoint in display form.
    pub peer: String,
    /// Address the peer asked for during IPCP, if any.
    pub requested_ip: Option<Ipv4Addr>,
    pub auth: AuthMethod,
}

/// Traffic counters, updated by the I/O paths and the offload poll.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionStats {
    pub input_packets: u64,
    pub output_packets: u64,
    pub input_octets: u64,
    pub output_octets: u64,
}

impl SessionStats {
    pub fn add_input(&mut self, octets: u64) {
        self.input_packets += 1;
        self.input_octets += octets;
    }

    pub fn add_output(&mut self, octets: u64) {
        self.output_packets += 1;
        self.output_octets += octets;
    }
}

/// Keys delivered by the RADIUS server at the end of an EAP exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkKeys {
    pub send_key: Option<Vec<u8>>,
    pub recv_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub username: String,
    pub phase: SessionPhase,
    /// Label of the bound realm; cleared on teardown and on realm
    /// disposal.
    pub realm: Option<String>,
    /// Name of the bound concentrator interface.
    pub iface: Option<String>,
    pub framed_ip: Option<Ipv4Addr>,
    pub framed_prefix: u8,
    /// Label of the pool the address was taken from. Reload clears this;
    /// a later dynamic allocation scan re-associates the session with
    /// the pool of the current generation.
    pub pool: Option<String>,
    /// The lease came off a dynamic free-list and goes back on release.
    pub dynamic_lease: bool,
    /// Whether the session's address is live (indexed under the user and
    /// visible to forwarding).
    pub ip_enabled: bool,
    pub peer_auth: bool,
    pub keys: LinkKeys,
    /// Maximum session lifetime, from RADIUS Session-Timeout (capped).
    pub session_timeout: Option<std::time::Duration>,
    pub started_at: DateTime<Utc>,
    pub stats: SessionStats,
    pub tunnel: TunnelMeta,
}

impl Session {
    pub fn new(id: SessionId, username: &str, tunnel: TunnelMeta) -> Self {
        Session {
            id,
            username: username.to_string(),
            phase: SessionPhase::Created,
            realm: None,
            iface: None,
            framed_ip: None,
            framed_prefix: 32,
            pool: None,
            dynamic_lease: false,
            ip_enabled: false,
            peer_auth: !matches!(tunnel.auth, AuthMethod::None),
            keys: LinkKeys::default(),
            session_timeout: None,
            started_at: Utc::now(),
            stats: SessionStats::default(),
            tunnel,
        }
    }

    pub fn ip_assigned(&self) -> bool {
        self.framed_ip.is_some()
    }
}

/// One row of `who` output on the control socket.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub username: String,
    pub phase: SessionPhase,
    pub realm: Option<String>,
    pub iface: Option<String>,
    pub address: Option<Ipv4Addr>,
    pub protocol: String,
    pub peer: String,
    pub started_at: DateTime<Utc>,
    pub stats: SessionStats,
}

impl SessionRecord {
    pub fn from_session(s: &Session) -> Self {
        SessionRecord {
            id: s.id,
            username: s.username.clone(),
            phase: s.phase,
            realm: s.realm.clone(),
            iface: s.iface.clone(),
            address: s.framed_ip,
            protocol: s.tunnel.protocol.clone(),
            peer: s.tunnel.peer.clone(),
            started_at: s.started_at,
            stats: s.stats,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_meta(auth: AuthMethod) -> TunnelMeta {
    TunnelMeta {
        protocol: "pppoe".to_string(),
        peer: "02:00:00:aa:bb:cc".to_string(),
        requested_ip: None,
        auth,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_defaults() {
        let s = Session::new(SessionId(1), "erin", test_meta(AuthMethod::Eap));
        assert_eq!(s.phase, SessionPhase::Created);
        assert!(s.peer_auth);
        assert!(!s.ip_assigned());
        assert_eq!(s.framed_prefix, 32);
    }

    #[test]
    fn no_auth_clears_peer_auth() {
        let s = Session::new(SessionId(2), "", test_meta(AuthMethod::None));
        assert!(!s.peer_auth);
    }

    #[test]
    fn stats_accumulate() {
        let mut stats = SessionStats::default();
        stats.add_input(100);
        stats.add_input(50);
        stats.add_output(9);
        assert_eq!(stats.input_packets, 2);
        assert_eq!(stats.input_octets, 150);
        assert_eq!(stats.output_packets, 1);
        assert_eq!(stats.output_octets, 9);
    }
}
