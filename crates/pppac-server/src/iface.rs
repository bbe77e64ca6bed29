//! Concentrator interfaces.
//!
//! An interface is the egress a session concentrates on: it carries the
//! per-interface session ceiling, the IPCP address-assignment policy and
//! the ordered pool list consulted during address assignment. The actual
//! kernel device is behind the [`PacketIo`] seam; the optional
//! kernel-level forwarding fast path is behind [`ForwardOffload`].

use crate::session::{SessionId, SessionStats};
use thiserror::Error;
use tracing::debug;

/// Ceiling applied when an interface does not configure its own.
pub const DEFAULT_IFACE_MAX_SESSION: usize = 512;

#[derive(Debug, Error)]
pub enum KernelIoError {
    #[error("device write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("device '{0}' is not ready")]
    NotReady(String),
}

/// Write access to the kernel tun device backing an interface.
pub trait PacketIo: Send + Sync {
    fn write(&self, iface: &str, proto: u16, packet: &[u8]) -> Result<(), KernelIoError>;
}

/// Per-session kernel forwarding offload (enable/disable plus a counter
/// poll for sessions whose traffic bypasses the daemon).
pub trait ForwardOffload: Send + Sync {
    fn enable(&self, session: SessionId) -> Result<(), KernelIoError>;
    fn disable(&self, session: SessionId) -> Result<(), KernelIoError>;
    fn poll_stats(&self, session: SessionId) -> Option<SessionStats>;
}

/// No-op implementations for configurations without a kernel fast path
/// and for tests.
#[derive(Debug, Default)]
pub struct NullPacketIo;

impl PacketIo for NullPacketIo {
    fn write(&self, iface: &str, proto: u16, packet: &[u8]) -> Result<(), KernelIoError> {
        debug!("iface {iface}: dropping {}-octet proto {proto:#06x} packet (null io)", packet.len());
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NullOffload;

impl ForwardOffload for NullOffload {
    fn enable(&self, _session: SessionId) -> Result<(), KernelIoError> {
        Ok(())
    }

    fn disable(&self, _session: SessionId) -> Result<(), KernelIoError> {
        Ok(())
    }

    fn poll_stats(&self, _session: SessionId) -> Option<SessionStats> {
        None
    }
}

/// IPCP address-assignment policy flags of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpAssign {
    /// The peer may name its own address during IPCP.
    pub user_select: bool,
    /// The daemon picks from a dynamic pool.
    pub nas_select: bool,
    /// Fixed per-user addresses from the realm's users table apply.
    pub fixed: bool,
    /// A Framed-IP-Address delivered by RADIUS applies.
    pub radius: bool,
}

impl Default for IpAssign {
    fn default() -> Self {
        IpAssign {
            user_select: true,
            nas_select: true,
            fixed: false,
            radius: false,
        }
    }
}

impl IpAssign {
    /// Parse a policy token list (`user_select,fixed,radius`).
    pub fn parse(spec: &str) -> Result<Self, String> {
        let mut flags = IpAssign {
            user_select: false,
            nas_select: false,
            fixed: false,
            radius: false,
        };
        for token in spec.split([',', ' ', '\t']).filter(|t| !t.is_empty()) {
            match token {
                "user_select" => flags.user_select = true,
                "nas_select" => flags.nas_select = true,
                "fixed" => flags.fixed = true,
                "radius" => flags.radius = true,
                other => return Err(format!("unknown ip_assign flag '{other}'")),
            }
        }
        Ok(flags)
    }
}

#[derive(Debug, Clone)]
pub struct Iface {
    name: String,
    max_session: usize,
    user_max_session: usize,
    ip_assign: IpAssign,
    pool_list: Vec<String>,
    nsession: usize,
}

impl Iface {
    pub fn new(
        name: &str,
        max_session: usize,
        user_max_session: usize,
        ip_assign: IpAssign,
        pool_list: Vec<String>,
    ) -> Self {
        Iface {
            name: name.to_string(),
            max_session,
            user_max_session,
            ip_assign,
            pool_list,
            nsession: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_session(&self) -> usize {
        self.max_session
    }

    /// Per-user ceiling on this interface; 0 disables the check.
    pub fn user_max_session(&self) -> usize {
        self.user_max_session
    }

    pub fn ip_assign(&self) -> IpAssign {
        self.ip_assign
    }

    /// Pools consulted for this interface, in configuration order.
    pub fn pool_list(&self) -> &[String] {
        &self.pool_list
    }

    pub fn nsession(&self) -> usize {
        self.nsession
    }
}

/// The configured interfaces of one generation.
#[derive(Debug, Default)]
pub struct IfaceSet {
    ifaces: Vec<Iface>,
}

impl IfaceSet {
    pub fn new(ifaces: Vec<Iface>) -> Self {
        IfaceSet { ifaces }
    }

    pub fn get(&self, name: &str) -> Option<&Iface> {
        self.ifaces.iter().find(|i| i.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ifaces.iter().map(|i| i.name.as_str())
    }

    /// Sessions bound across all interfaces (the global-ceiling count).
    pub fn total_sessions(&self) -> usize {
        self.ifaces.iter().map(|i| i.nsession).sum()
    }

    pub fn bind(&mut self, name: &str) -> bool {
        match self.ifaces.iter_mut().find(|i| i.name == name) {
            Some(iface) => {
                iface.nsession += 1;
                true
            }
            None => false,
        }
    }

    pub fn unbind(&mut self, name: &str) {
        if let Some(iface) = self.ifaces.iter_mut().find(|i| i.name == name) {
            iface.nsession = iface.nsession.saturating_sub(1);
        }
    }

    /// Install a new generation, carrying session counts over for
    /// interfaces that survive.
    pub fn replace(&mut self, mut new_ifaces: Vec<Iface>) {
        for iface in new_ifaces.iter_mut() {
            if let Some(old) = self.ifaces.iter().find(|o| o.name == iface.name) {
                iface.nsession = old.nsession;
            }
        }
        self.ifaces = new_ifaces;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str) -> Iface {
        Iface::new(name, 2, 0, IpAssign::default(), vec!["default".to_string()])
    }

    #[test]
    fn ip_assign_parsing() {
        let flags = IpAssign::parse("user_select, fixed radius").unwrap();
        assert!(flags.user_select && flags.fixed && flags.radius);
        assert!(!flags.nas_select);
        assert!(IpAssign::parse("bogus").is_err());
    }

    #[test]
    fn bind_and_unbind_track_counts() {
        let mut set = IfaceSet::new(vec![iface("tun0"), iface("tun1")]);
        assert!(set.bind("tun0"));
        assert!(set.bind("tun0"));
        assert!(set.bind("tun1"));
        assert!(!set.bind("tun9"));
        assert_eq!(set.get("tun0").unwrap().nsession(), 2);
        assert_eq!(set.total_sessions(), 3);

        set.unbind("tun0");
        set.unbind("tun0");
        set.unbind("tun0"); // saturates at zero
        assert_eq!(set.get("tun0").unwrap().nsession(), 0);
    }

    #[test]
    fn replace_carries_counts_for_surviving_ifaces() {
        let mut set = IfaceSet::new(vec![iface("tun0"), iface("tun1")]);
        set.bind("tun0");
        set.bind("tun1");

        set.replace(vec![iface("tun0"), iface("tun2")]);
        assert_eq!(set.get("tun0").unwrap().nsession(), 1);
        assert_eq!(set.get("tun2").unwrap().nsession(), 0);
        assert!(set.get("tun1").is_none());
    }

    #[test]
    fn null_io_accepts_writes() {
        let io = NullPacketIo;
        assert!(io.write("tun0", 0x0021, &[0u8; 40]).is_ok());
        let offload = NullOffload;
        assert!(offload.enable(SessionId(1)).is_ok());
        assert!(offload.poll_stats(SessionId(1)).is_none());
    }
}
