//! pppacd — PPP access concentrator daemon.
//!
//! This crate terminates tunneled PPP sessions: it leases each session an
//! IPv4 address from configurable pools backed by a longest-prefix-match
//! table, binds sessions to authentication realms and concentrator
//! interfaces under per-user/per-interface/global ceilings, and bridges
//! EAP between the PPP peer and a RADIUS server. Tunnel-protocol codecs
//! and kernel device I/O stay outside, consumed through the
//! [`server::TunnelLayer`] and [`iface::PacketIo`] seams.
//!
//! # Example
//!
//! ```rust,no_run
//! use pppac_server::config::Properties;
//! use pppac_server::daemon::Daemon;
//! use pppac_server::radius::UdpRadiusClient;
//! use pppac_server::server::{NullTunnelLayer, SharedDaemon};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let props = Properties::from_file("pppacd.conf".as_ref())?;
//!     let daemon = Daemon::new(props)?;
//!     let shared = SharedDaemon::new(
//!         daemon,
//!         Arc::new(UdpRadiusClient),
//!         Arc::new(NullTunnelLayer),
//!     );
//!     let timer = shared.run_timer();
//!     timer.await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod daemon;
pub mod eap_auth;
pub mod iface;
pub mod pool;
pub mod radix;
pub mod radius;
pub mod realm;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{ConfigError, DaemonConfig, Properties};
pub use daemon::{AdmissionError, Daemon, Effect};
pub use eap_auth::{AuthError, EapAuthenticator, EapState, EapTimers};
pub use pool::{AddressPool, AddressRange, AddressState, AllocationError, PoolSet};
pub use radix::{Ipv4RouteTable, Prefix, RouteRecord};
pub use realm::{Realm, RealmKind, RealmSet};
pub use registry::SessionRegistry;
pub use server::{NullTunnelLayer, SharedDaemon, TunnelLayer};
pub use session::{Session, SessionId, SessionPhase, SessionRecord, TunnelMeta};
