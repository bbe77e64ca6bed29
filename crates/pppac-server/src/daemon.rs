//! The daemon core: one object owning the property map, the pools and
//! route table, the session registry, the realms and the interfaces.
//!
//! Every operation is synchronous and returns the I/O it wants performed
//! as a list of [`Effect`]s; the async wrapper in `server.rs` maps those
//! onto sockets and tasks. Keeping the core free of I/O gives the
//! "at most one allocate/release in flight" ordering for free (the
//! wrapper serializes entry through one lock) and makes the whole
//! lifecycle drivable from plain tests.

use crate::config::{ConfigError, DaemonConfig, Properties};
use crate::eap_auth::{AuthError, EapAuthenticator, EapEvent};
use crate::iface::{ForwardOffload, IfaceSet, NullOffload, NullPacketIo, PacketIo};
use crate::pool::{AddressState, AllocationError, PoolSet};
use crate::radix::RouteRecord;
use crate::radius::{build_access_request, RadiusReply};
use crate::realm::{BindError, RealmKind, RealmSet};
use crate::registry::SessionRegistry;
use crate::session::{AuthMethod, SessionId, SessionPhase, SessionRecord, TunnelMeta};
use pppac_proto::{EapFrame, Packet};
use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// PPP protocol number of IPv4 datagrams.
const PPP_PROTO_IP: u16 = 0x0021;

/// Why a session could not be admitted (or finished admission). The
/// `class` method names the taxonomy bucket for the one-line failure log.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error(transparent)]
    Realm(#[from] BindError),

    #[error("no concentrator interface configured for '{0}'")]
    NoInterface(String),

    #[error("number of sessions reaches out of the limit={0}")]
    GlobalLimit(usize),

    #[error("number of sessions reaches out of the interface limit={0}")]
    IfaceLimit(usize),

    #[error("number of sessions per user reaches out of the limit={0}")]
    UserLimit(usize),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl AdmissionError {
    pub fn class(&self) -> &'static str {
        match self {
            AdmissionError::Realm(_) | AdmissionError::Auth(_) => "AuthError",
            AdmissionError::NoInterface(_) => "ConfigError",
            AdmissionError::GlobalLimit(_)
            | AdmissionError::IfaceLimit(_)
            | AdmissionError::UserLimit(_) => "ResourceLimitError",
            AdmissionError::Allocation(_) => "AllocationError",
        }
    }
}

/// I/O the caller must perform on the core's behalf, in order.
#[derive(Debug)]
pub enum Effect {
    SendEap {
        session: SessionId,
        frame: EapFrame,
    },
    SendIp {
        session: SessionId,
        packet: Vec<u8>,
    },
    /// Run one Access-Request exchange as a cancellable task keyed by
    /// the session id, feeding the outcome back via `radius_reply`.
    RadiusExchange {
        session: SessionId,
        server: SocketAddr,
        secret: String,
        timeout: Duration,
        request: Packet,
    },
    /// Abort the session's in-flight exchange, if any.
    CancelRadius { session: SessionId },
    /// The session is gone; tell the tunnel layer.
    SessionClosed { session: SessionId, reason: String },
}

/// How the assignment policy resolved before consulting the pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selection {
    /// The peer may name an address; none named means dynamic.
    UserSelect,
    /// Dynamic allocation.
    NasSelect,
    /// A fixed address from the realm or from RADIUS. A fixed address
    /// that turns out OutOfPool/Reserved falls back to dynamic; Busy or
    /// Invalid cancels the fallback.
    Fixed { addr: Ipv4Addr, prefix: u8 },
}

pub struct Daemon {
    props: Properties,
    config: DaemonConfig,
    pools: PoolSet,
    registry: SessionRegistry,
    realms: RealmSet,
    ifaces: IfaceSet,
    eap: HashMap<SessionId, EapAuthenticator>,
    packet_io: Arc<dyn PacketIo>,
    offload: Arc<dyn ForwardOffload>,
    radius_seq: u8,
}

impl Daemon {
    pub fn new(props: Properties) -> Result<Self, ConfigError> {
        Daemon::with_io(props, Arc::new(NullPacketIo), Arc::new(NullOffload))
    }

    pub fn with_io(
        props: Properties,
        packet_io: Arc<dyn PacketIo>,
        offload: Arc<dyn ForwardOffload>,
    ) -> Result<Self, ConfigError> {
        let mut config = DaemonConfig::derive(&props)?;
        let pools = Daemon::build_pools(&config)?;
        let realms = RealmSet::new(std::mem::take(&mut config.realms));
        let ifaces = IfaceSet::new(std::mem::take(&mut config.ifaces));
        Ok(Daemon {
            props,
            config,
            pools,
            registry: SessionRegistry::new(),
            realms,
            ifaces,
            eap: HashMap::new(),
            packet_io,
            offload,
            radius_seq: 0,
        })
    }

    fn build_pools(config: &DaemonConfig) -> Result<PoolSet, ConfigError> {
        let mut pools = PoolSet::new();
        for pool in &config.pools {
            pools.add_pool(
                &pool.label,
                pool.static_ranges.clone(),
                pool.dynamic_ranges.clone(),
            )?;
        }
        pools.set_local_addrs(config.local_addrs.clone());
        Ok(pools)
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn session(&self, id: SessionId) -> Option<&crate::session::Session> {
        self.registry.get(id)
    }

    /// Admit a connection the tunnel layer finished negotiating.
    ///
    /// Realm and interface are bound and the ceilings checked before any
    /// session object exists, so a refused admission leaves no trace.
    pub fn accept_session(
        &mut self,
        username: &str,
        tunnel: TunnelMeta,
        now: Instant,
    ) -> Result<(SessionId, Vec<Effect>), AdmissionError> {
        match self.try_accept(username, tunnel, now) {
            Ok(ok) => Ok(ok),
            Err(e) => {
                warn!(
                    "session admission for user '{username}' failed: class={} reason={e}",
                    e.class()
                );
                Err(e)
            }
        }
    }

    fn try_accept(
        &mut self,
        username: &str,
        tunnel: TunnelMeta,
        now: Instant,
    ) -> Result<(SessionId, Vec<Effect>), AdmissionError> {
        let peer_auth = !matches!(tunnel.auth, AuthMethod::None);
        let eap_required = matches!(tunnel.auth, AuthMethod::Eap);

        let realm_label = if peer_auth {
            let realm =
                self.realms
                    .bind(username, eap_required, self.config.realm_list.as_deref())?;
            Some(realm.label().to_string())
        } else {
            None
        };

        let key = DaemonConfig::concentrate_key(peer_auth, realm_label.as_deref());
        let ifname = self
            .props
            .get(&key)
            .ok_or_else(|| AdmissionError::NoInterface(key.clone()))?
            .to_string();
        let iface = self
            .ifaces
            .get(&ifname)
            .ok_or_else(|| AdmissionError::NoInterface(ifname.clone()))?;

        if self.ifaces.total_sessions() >= self.config.max_session {
            return Err(AdmissionError::GlobalLimit(self.config.max_session));
        }
        if iface.nsession() >= iface.max_session() {
            return Err(AdmissionError::IfaceLimit(iface.max_session()));
        }
        let user_max = iface.user_max_session();
        if user_max > 0 && self.registry.count_user_on_iface(username, &ifname) >= user_max {
            return Err(AdmissionError::UserLimit(user_max));
        }

        let auth = tunnel.auth.clone();
        let id = self.registry.create(username, tunnel);
        if let Some(session) = self.registry.get_mut(id) {
            session.realm = realm_label.clone();
            session.phase = SessionPhase::RealmBound;
        }
        self.ifaces.bind(&ifname);
        if let Some(session) = self.registry.get_mut(id) {
            session.iface = Some(ifname.clone());
            session.phase = SessionPhase::InterfaceBound;
        }

        let result = match auth {
            AuthMethod::None => self.finish_auth(id, None),
            AuthMethod::Password(password) => {
                let verified = realm_label
                    .as_deref()
                    .and_then(|label| self.realms.get(label))
                    .is_some_and(|realm| realm.verify_password(username, &password));
                if verified {
                    self.finish_auth(id, None)
                } else {
                    Err(AuthError::Rejected.into())
                }
            }
            AuthMethod::Eap => {
                if let Some(session) = self.registry.get_mut(id) {
                    session.phase = SessionPhase::Authenticating;
                }
                let mut auth = EapAuthenticator::new(self.config.eap);
                let events = auth.start(now);
                self.eap.insert(id, auth);
                Ok(self.apply_eap_events(id, events))
            }
        };

        match result {
            Ok(effects) => Ok((id, effects)),
            Err(e) => {
                self.release_session(id, &e.to_string());
                Err(e)
            }
        }
    }

    /// EAP frame from the peer.
    pub fn input_eap(&mut self, id: SessionId, frame: &EapFrame) -> Vec<Effect> {
        let events = match self.eap.get_mut(&id) {
            Some(auth) => auth.input(frame),
            None => {
                debug!("EAP frame for session {id} with no authenticator, dropped");
                return Vec::new();
            }
        };
        self.apply_eap_events(id, events)
    }

    /// Outcome of the session's relayed Access-Request.
    pub fn radius_reply(&mut self, id: SessionId, reply: RadiusReply, now: Instant) -> Vec<Effect> {
        let events = match self.eap.get_mut(&id) {
            Some(auth) => auth.radius_reply(now, reply),
            None => return Vec::new(),
        };
        self.apply_eap_events(id, events)
    }

    fn apply_eap_events(&mut self, id: SessionId, events: Vec<EapEvent>) -> Vec<Effect> {
        let mut effects = Vec::new();
        for event in events {
            match event {
                EapEvent::SendToPeer(frame) => {
                    effects.push(Effect::SendEap { session: id, frame });
                }
                EapEvent::RelayToRadius { eap, state } => match self.relay_to_radius(id, eap, state)
                {
                    Ok(effect) => effects.push(effect),
                    Err(reason) => {
                        warn!("session {id}: cannot relay to RADIUS: {reason}");
                        effects.extend(self.release_session(id, &reason));
                    }
                },
                EapEvent::Authenticated(info) => {
                    self.eap.remove(&id);
                    if let Some(session) = self.registry.get_mut(id) {
                        if let Some(identity) = info.identity {
                            session.username = identity;
                        }
                        session.keys = info.keys;
                        session.session_timeout = info.session_timeout;
                    }
                    match self.finish_auth(id, info.framed_ip) {
                        Ok(more) => effects.extend(more),
                        Err(e) => {
                            warn!(
                                "session {id} failed after authentication: class={} reason={e}",
                                e.class()
                            );
                            effects.extend(self.release_session(id, &e.to_string()));
                        }
                    }
                }
                EapEvent::Failed(e) => {
                    warn!("session {id} authentication failed: class=AuthError reason={e}");
                    effects.extend(self.release_session(id, &e.to_string()));
                }
            }
        }
        effects
    }

    fn relay_to_radius(
        &mut self,
        id: SessionId,
        eap: Vec<u8>,
        state: Option<Vec<u8>>,
    ) -> Result<Effect, String> {
        let session = self
            .registry
            .get(id)
            .ok_or_else(|| "session is gone".to_string())?;
        let realm = session
            .realm
            .as_deref()
            .and_then(|label| self.realms.get(label))
            .ok_or_else(|| "bound realm is gone".to_string())?;
        let (server, secret, timeout) = match realm.kind() {
            RealmKind::Radius {
                server,
                secret,
                timeout,
            } => (*server, secret.clone(), *timeout),
            RealmKind::Local { .. } => {
                return Err(format!("realm '{}' cannot terminate EAP", realm.label()))
            }
        };
        let identity = self
            .eap
            .get(&id)
            .and_then(|auth| auth.identity())
            .map(str::to_string);
        self.radius_seq = self.radius_seq.wrapping_add(1);
        let request = build_access_request(
            self.radius_seq,
            identity.as_deref().or(Some(session.username.as_str())),
            &eap,
            state.as_deref(),
            "pppacd",
            &session.tunnel.peer,
        )
        .map_err(|e| format!("cannot build Access-Request: {e}"))?;
        Ok(Effect::RadiusExchange {
            session: id,
            server,
            secret,
            timeout,
            request,
        })
    }

    /// Peer authentication is settled; assign an address and activate.
    fn finish_auth(
        &mut self,
        id: SessionId,
        radius_ip: Option<Ipv4Addr>,
    ) -> Result<Vec<Effect>, AdmissionError> {
        let selection = self.resolve_selection(id, radius_ip);
        self.assign_address(id, selection)?;

        let Some(session) = self.registry.get_mut(id) else {
            return Ok(Vec::new());
        };
        session.phase = SessionPhase::IpAssigned;
        let addr = session.framed_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let username = session.username.clone();
        session.phase = SessionPhase::Active;
        self.set_ip_enabled(id, true);
        if let Err(e) = self.offload.enable(id) {
            // Forwarding falls back to the daemon's own path.
            debug!("session {id}: forwarding offload unavailable: {e}");
        }
        info!("session {id} user '{username}' started, address {addr}");
        Ok(Vec::new())
    }

    /// Port of the legacy policy resolution: a RADIUS-delivered address
    /// is honored only under the `radius` flag, a realm-fixed address
    /// only under `fixed`; with neither, the peer may select when
    /// `user_select` allows, and everything else is NAS-selected.
    fn resolve_selection(&self, id: SessionId, radius_ip: Option<Ipv4Addr>) -> Selection {
        let Some(session) = self.registry.get(id) else {
            return Selection::NasSelect;
        };
        let flags = session
            .iface
            .as_deref()
            .and_then(|name| self.ifaces.get(name))
            .map(|iface| iface.ip_assign())
            .unwrap_or_default();

        if session.peer_auth {
            if let Some(addr) = radius_ip {
                if flags.radius {
                    return Selection::Fixed { addr, prefix: 32 };
                }
            }
            if flags.fixed {
                let fixed = session
                    .realm
                    .as_deref()
                    .and_then(|label| self.realms.get(label))
                    .and_then(|realm| realm.framed_ip(&session.username));
                if let Some((addr, prefix)) = fixed {
                    return Selection::Fixed { addr, prefix };
                }
            }
        }
        if flags.user_select {
            Selection::UserSelect
        } else {
            Selection::NasSelect
        }
    }

    fn assign_address(&mut self, id: SessionId, selection: Selection) -> Result<(), AdmissionError> {
        let Some(session) = self.registry.get(id) else {
            return Ok(());
        };
        let requested = session.tunnel.requested_ip;
        let pool_list: Vec<String> = session
            .iface
            .as_deref()
            .and_then(|name| self.ifaces.get(name))
            .map(|iface| iface.pool_list().to_vec())
            .unwrap_or_default();

        let (request, fallback_dyna) = match selection {
            Selection::UserSelect => match requested {
                None => (None, false),
                Some(addr) => (Some((addr, 32u8)), false),
            },
            Selection::NasSelect => (None, false),
            Selection::Fixed { addr, prefix } => (Some((addr, prefix)), true),
        };

        let chosen = match request {
            Some((addr, prefix)) => {
                match self.classify_across_pools(id, selection, addr, prefix, &pool_list) {
                    Ok(chosen) => chosen,
                    Err(e) => {
                        if fallback_dyna
                            && matches!(
                                e,
                                AllocationError::OutOfPool(_) | AllocationError::Reserved(_)
                            )
                        {
                            // A fixed address that is not poolable falls
                            // back to dynamic assignment.
                            debug!("session {id}: fixed address {addr} unusable ({e}), falling back to dynamic");
                            self.allocate_across_pools(id, &pool_list)?
                        } else {
                            return Err(e.into());
                        }
                    }
                }
            }
            None => self.allocate_across_pools(id, &pool_list)?,
        };

        let (addr, prefix, pool, dynamic) = chosen;
        self.pools.assign(id, addr, prefix)?;
        if let Some(session) = self.registry.get_mut(id) {
            session.framed_ip = Some(addr);
            session.framed_prefix = prefix;
            session.pool = Some(pool);
            session.dynamic_lease = dynamic;
        }
        Ok(())
    }

    /// Walk the interface's pools classifying an explicitly requested
    /// address. Static-range hits are honored only for realm-fixed
    /// requests; Reserved and OutOfPool move on to the next pool; Busy
    /// and Invalid end the walk.
    fn classify_across_pools(
        &self,
        id: SessionId,
        selection: Selection,
        addr: Ipv4Addr,
        prefix: u8,
        pool_list: &[String],
    ) -> Result<(Ipv4Addr, u8, String, bool), AllocationError> {
        let user_selected = matches!(selection, Selection::UserSelect);
        let mut last = AllocationError::OutOfPool(addr);
        for label in pool_list {
            match self.pools.classify(label, addr, prefix) {
                AddressState::Ok { dynamic: true } => {
                    return Ok((addr, prefix, label.clone(), true));
                }
                AddressState::Ok { dynamic: false } => {
                    if user_selected {
                        // Static ranges are reachable only through
                        // realm/user configuration, never by bare
                        // peer request.
                        return Err(AllocationError::Reserved(addr));
                    }
                    return Ok((addr, prefix, label.clone(), false));
                }
                AddressState::Reserved => {
                    last = AllocationError::Reserved(addr);
                }
                AddressState::OutOfPool => {
                    last = AllocationError::OutOfPool(addr);
                }
                AddressState::Busy(holder) => {
                    debug!("session {id}: requested address {addr} busy under {holder}");
                    return Err(AllocationError::Busy { addr, holder });
                }
                AddressState::Invalid => {
                    return Err(AllocationError::Invalid(addr));
                }
            }
        }
        Err(last)
    }

    fn allocate_across_pools(
        &mut self,
        id: SessionId,
        pool_list: &[String],
    ) -> Result<(Ipv4Addr, u8, String, bool), AllocationError> {
        let _ = id;
        for label in pool_list {
            match self.pools.allocate_dynamic(label, &mut self.registry) {
                Ok(addr) => return Ok((addr, 32, label.clone(), true)),
                Err(AllocationError::Exhausted) | Err(AllocationError::NoSuchPool(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(AllocationError::Exhausted)
    }

    /// Toggle the session's address in or out of service: the user index
    /// follows the enabled state.
    fn set_ip_enabled(&mut self, id: SessionId, enabled: bool) {
        let session = match self.registry.get_mut(id) {
            Some(session) if session.ip_assigned() => session,
            _ => return,
        };
        if session.ip_enabled == enabled {
            return;
        }
        session.ip_enabled = enabled;
        let username = session.username.clone();
        if enabled {
            self.registry.index_user(id);
        } else {
            self.registry.deindex_user(id, &username);
        }
    }

    /// Tear the session down: address, interface and realm bindings are
    /// unwound independently, a second call is a no-op.
    pub fn release_session(&mut self, id: SessionId, reason: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.eap.remove(&id).is_some() {
            effects.push(Effect::CancelRadius { session: id });
        }
        let session = match self.registry.get_mut(id) {
            Some(session) => session,
            None => return effects,
        };

        let username = session.username.clone();
        let was_enabled = session.ip_enabled;
        session.ip_enabled = false;
        session.phase = SessionPhase::Released;
        let iface = session.iface.take();
        session.realm = None;
        self.pools.release(session);

        if was_enabled {
            self.registry.deindex_user(id, &username);
            if let Err(e) = self.offload.disable(id) {
                debug!("session {id}: offload disable failed: {e}");
            }
        }
        if let Some(ifname) = iface {
            self.ifaces.unbind(&ifname);
        }
        self.registry.remove(id);
        info!("session {id} user '{username}' released: {reason}");
        effects.push(Effect::SessionClosed {
            session: id,
            reason: reason.to_string(),
        });
        effects
    }

    /// IP packet from the peer, towards the kernel interface.
    pub fn input_ip(&mut self, id: SessionId, packet: &[u8]) -> Vec<Effect> {
        let session = match self.registry.get_mut(id) {
            Some(session) if session.ip_enabled => session,
            _ => {
                debug!("IP input for session {id} without a live address, dropped");
                return Vec::new();
            }
        };
        session.stats.add_input(packet.len() as u64);
        let ifname = session.iface.clone().unwrap_or_default();
        if let Err(e) = self.packet_io.write(&ifname, PPP_PROTO_IP, packet) {
            warn!("session {id}: class=KernelIoError reason={e}");
            return self.release_session(id, &format!("kernel write failed: {e}"));
        }
        Vec::new()
    }

    /// Packet from the kernel interface, routed to the session holding
    /// the destination address.
    pub fn network_input(&mut self, packet: &[u8]) -> Vec<Effect> {
        if packet.len() < 20 {
            return Vec::new();
        }
        let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
        let id = match self.pools.table().lookup_longest(dst) {
            Some((_, RouteRecord::Session { session })) => *session,
            _ => {
                debug!("no session holds {dst}, packet dropped");
                return Vec::new();
            }
        };
        let session = match self.registry.get_mut(id) {
            Some(session) if session.ip_enabled => session,
            _ => return Vec::new(),
        };
        session.stats.add_output(packet.len() as u64);
        vec![Effect::SendIp {
            session: id,
            packet: packet.to_vec(),
        }]
    }

    /// Periodic work: EAP deadline sweep, disposing-realm sweep, session
    /// lifetime enforcement.
    pub fn timer_tick(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();

        let ids: Vec<SessionId> = self.eap.keys().copied().collect();
        for id in ids {
            let events = match self.eap.get_mut(&id) {
                Some(auth) => auth.on_timer(now),
                None => continue,
            };
            effects.extend(self.apply_eap_events(id, events));
        }

        let disposing = self.realms.disposing_labels();
        if !disposing.is_empty() {
            let mut still_bound: HashSet<String> = HashSet::new();
            let stops: Vec<(SessionId, String)> = self
                .registry
                .iter()
                .filter_map(|s| {
                    s.realm
                        .as_ref()
                        .filter(|label| disposing.contains(label))
                        .map(|label| (s.id, label.clone()))
                })
                .collect();
            for (id, label) in stops {
                still_bound.insert(label.clone());
                effects.extend(self.release_session(
                    id,
                    &format!("binding authentication realm is disposing, realm={label}"),
                ));
            }
            self.realms
                .reap_disposing(|label| still_bound.contains(label));
        }

        let expired: Vec<(SessionId, Duration)> = self
            .registry
            .iter()
            .filter_map(|s| {
                let limit = s.session_timeout?;
                let age = (chrono::Utc::now() - s.started_at)
                    .to_std()
                    .unwrap_or_default();
                (age >= limit).then_some((s.id, limit))
            })
            .collect();
        for (id, limit) in expired {
            effects.extend(
                self.release_session(id, &format!("session timeout ({}s)", limit.as_secs())),
            );
        }

        effects
    }

    /// Swap in a new configuration. On any derivation error the running
    /// generation stays untouched. Pool records are rebuilt wholesale;
    /// live sessions whose address is still covered are re-registered in
    /// the new tree, the rest are stopped.
    pub fn reload(&mut self, props: Properties) -> Result<Vec<Effect>, ConfigError> {
        let mut config = DaemonConfig::derive(&props)?;
        let mut pools = Daemon::build_pools(&config)?;

        // Leases that made it into the new tree unwind against it on
        // release; dropped leases must not touch it.
        let mut dropped: Vec<SessionId> = Vec::new();
        let mut carried = 0usize;
        for id in self.registry.ids() {
            let session = match self.registry.get(id) {
                Some(session) => session,
                None => continue,
            };
            if let Some(addr) = session.framed_ip {
                if pools.table().lookup_longest(addr).is_none() {
                    dropped.push(id);
                } else {
                    if let Err(e) = pools.assign(id, addr, session.framed_prefix) {
                        warn!("session {id}: cannot carry {addr} into the new generation: {e}");
                        dropped.push(id);
                        continue;
                    }
                    carried += 1;
                }
            }
        }
        // Old-generation pool associations are stale; a later dynamic
        // allocation scan re-associates live sessions with the current
        // pools.
        for id in self.registry.ids() {
            if let Some(session) = self.registry.get_mut(id) {
                session.pool = None;
            }
        }

        let new_iface_names: Vec<String> =
            config.ifaces.iter().map(|i| i.name().to_string()).collect();
        let mut orphaned: Vec<SessionId> = Vec::new();
        for id in self.registry.ids() {
            if dropped.contains(&id) {
                continue;
            }
            if let Some(session) = self.registry.get(id) {
                if let Some(ifname) = session.iface.as_deref() {
                    if !new_iface_names.iter().any(|n| n == ifname) {
                        orphaned.push(id);
                    }
                }
            }
        }

        self.pools = pools;
        self.realms.replace(std::mem::take(&mut config.realms));
        self.ifaces.replace(std::mem::take(&mut config.ifaces));
        self.config = config;
        self.props = props;

        let mut effects = Vec::new();
        for id in dropped {
            // The old lease has no meaning in the new generation; drop
            // it so release does not touch the new tree.
            if let Some(session) = self.registry.get_mut(id) {
                session.framed_ip = None;
                session.dynamic_lease = false;
            }
            effects.extend(self.release_session(id, "address is out of the new address pool"));
        }
        for id in orphaned {
            effects.extend(self.release_session(id, "concentrator interface is gone"));
        }
        info!(
            "configuration reloaded: {} pools, {} realms, {} interfaces, {carried} sessions carried",
            self.pools.pool_labels().len(),
            self.realms.labels().count(),
            self.ifaces.names().count()
        );
        Ok(effects)
    }

    /// Per-session stat records for the control socket, offload counters
    /// folded in.
    pub fn who(&self) -> Vec<SessionRecord> {
        let mut records: Vec<SessionRecord> = self
            .registry
            .iter()
            .map(|session| {
                let mut record = SessionRecord::from_session(session);
                if let Some(extra) = self.offload.poll_stats(session.id) {
                    record.stats.input_packets += extra.input_packets;
                    record.stats.output_packets += extra.output_packets;
                    record.stats.input_octets += extra.input_octets;
                    record.stats.output_octets += extra.output_octets;
                }
                record
            })
            .collect();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Stop every session of `username` that holds a live address;
    /// returns how many were stopped plus the teardown effects.
    pub fn disconnect_user(&mut self, username: &str) -> (usize, Vec<Effect>) {
        let ids = self.registry.sessions_for_user(username);
        let mut effects = Vec::new();
        for id in &ids {
            effects.extend(self.release_session(*id, "disconnect requested by the operator"));
        }
        (ids.len(), effects)
    }
}
