//! Async shell around the daemon core.
//!
//! The core is single-owner state behind one `tokio::sync::Mutex`; every
//! entry point takes the lock, runs the synchronous operation, and then
//! performs the returned effects. Each relayed Access-Request runs as its
//! own task keyed by session id, so releasing a session aborts exactly
//! its exchange and nothing else.

use crate::config::{ConfigError, Properties};
use crate::daemon::{AdmissionError, Daemon, Effect};
use crate::radius::{summarize_reply, RadiusClient, RadiusClientError, RadiusReply};
use crate::session::{SessionId, SessionRecord, TunnelMeta};
use pppac_proto::EapFrame;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Reactor tick interval for timer sweeps.
pub const TIMER_TICK_INTERVAL: Duration = Duration::from_secs(4);

/// Callbacks into the tunnel layer (PPPoE/PPTP/L2TP codecs live outside
/// this crate).
pub trait TunnelLayer: Send + Sync {
    fn send_eap(&self, session: SessionId, frame: &EapFrame);
    fn send_ip(&self, session: SessionId, packet: &[u8]);
    fn close_session(&self, session: SessionId, reason: &str);
}

/// Stand-in tunnel layer that only logs; used by the binary until a
/// tunnel codec registers and by tests that do not care.
#[derive(Debug, Default)]
pub struct NullTunnelLayer;

impl TunnelLayer for NullTunnelLayer {
    fn send_eap(&self, session: SessionId, frame: &EapFrame) {
        debug!("session {session}: EAP frame ({} octets) dropped, no tunnel layer", frame.length());
    }

    fn send_ip(&self, session: SessionId, packet: &[u8]) {
        debug!("session {session}: IP packet ({} octets) dropped, no tunnel layer", packet.len());
    }

    fn close_session(&self, session: SessionId, reason: &str) {
        debug!("session {session}: close ({reason}) dropped, no tunnel layer");
    }
}

/// The daemon as the rest of the process sees it.
#[derive(Clone)]
pub struct SharedDaemon {
    inner: Arc<Mutex<Daemon>>,
    radius: Arc<dyn RadiusClient>,
    tunnel: Arc<dyn TunnelLayer>,
    exchanges: Arc<StdMutex<HashMap<SessionId, JoinHandle<()>>>>,
}

impl SharedDaemon {
    pub fn new(
        daemon: Daemon,
        radius: Arc<dyn RadiusClient>,
        tunnel: Arc<dyn TunnelLayer>,
    ) -> Self {
        SharedDaemon {
            inner: Arc::new(Mutex::new(daemon)),
            radius,
            tunnel,
            exchanges: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub async fn accept_session(
        &self,
        username: &str,
        tunnel: TunnelMeta,
    ) -> Result<SessionId, AdmissionError> {
        let (id, effects) = self
            .inner
            .lock()
            .await
            .accept_session(username, tunnel, Instant::now())?;
        self.apply(effects).await;
        Ok(id)
    }

    pub async fn input_eap(&self, id: SessionId, frame: &EapFrame) {
        let effects = self.inner.lock().await.input_eap(id, frame);
        self.apply(effects).await;
    }

    pub async fn input_ip(&self, id: SessionId, packet: &[u8]) {
        let effects = self.inner.lock().await.input_ip(id, packet);
        self.apply(effects).await;
    }

    pub async fn network_input(&self, packet: &[u8]) {
        let effects = self.inner.lock().await.network_input(packet);
        self.apply(effects).await;
    }

    pub async fn release_session(&self, id: SessionId, reason: &str) {
        let effects = self.inner.lock().await.release_session(id, reason);
        self.apply(effects).await;
    }

    pub async fn reload(&self, props: Properties) -> Result<(), ConfigError> {
        let effects = self.inner.lock().await.reload(props)?;
        self.apply(effects).await;
        Ok(())
    }

    pub async fn who(&self) -> Vec<SessionRecord> {
        self.inner.lock().await.who()
    }

    pub async fn disconnect_user(&self, username: &str) -> usize {
        let (count, effects) = self.inner.lock().await.disconnect_user(username);
        self.apply(effects).await;
        count
    }

    pub async fn control_max_msgsz(&self) -> usize {
        self.inner.lock().await.config().control_max_msgsz
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.session_count()
    }

    /// One timer sweep; `run_timer` calls this on an interval.
    pub async fn tick(&self) {
        let effects = self.inner.lock().await.timer_tick(Instant::now());
        self.apply(effects).await;
    }

    /// Drive the periodic sweeps until the task is aborted.
    pub fn run_timer(&self) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TIMER_TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                this.tick().await;
            }
        })
    }

    /// Perform effects in order. Boxed because a RADIUS exchange's
    /// completion applies further effects of its own.
    fn apply(&self, effects: Vec<Effect>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            for effect in effects {
                match effect {
                    Effect::SendEap { session, frame } => {
                        self.tunnel.send_eap(session, &frame);
                    }
                    Effect::SendIp { session, packet } => {
                        self.tunnel.send_ip(session, &packet);
                    }
                    Effect::SessionClosed { session, reason } => {
                        // Reap any leftover exchange handle as well.
                        if let Some(handle) =
                            self.exchanges.lock().expect("not poisoned").remove(&session)
                        {
                            handle.abort();
                        }
                        self.tunnel.close_session(session, &reason);
                    }
                    Effect::CancelRadius { session } => {
                        let handle = self.exchanges.lock().expect("not poisoned").remove(&session);
                        if let Some(handle) = handle {
                            debug!("session {session}: aborting in-flight RADIUS exchange");
                            handle.abort();
                        }
                    }
                    Effect::RadiusExchange {
                        session,
                        server,
                        secret,
                        timeout,
                        request,
                    } => {
                        let this = self.clone();
                        let request_auth = request.authenticator;
                        let handle = tokio::spawn(async move {
                            let reply = match this
                                .radius
                                .exchange(server, secret.as_bytes(), request, timeout)
                                .await
                            {
                                Ok(packet) => {
                                    summarize_reply(&packet, secret.as_bytes(), &request_auth)
                                }
                                Err(RadiusClientError::Timeout) => RadiusReply::Timeout,
                                Err(e) => {
                                    info!("session {session}: RADIUS exchange failed: {e}");
                                    RadiusReply::Malformed
                                }
                            };
                            this.exchanges.lock().expect("not poisoned").remove(&session);
                            let effects = this
                                .inner
                                .lock()
                                .await
                                .radius_reply(session, reply, Instant::now());
                            this.apply(effects).await;
                        });
                        self.exchanges
                            .lock()
                            .expect("not poisoned")
                            .insert(session, handle);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AuthMethod;
    use async_trait::async_trait;
    use pppac_proto::{Attribute, Code, EapCode, Packet};
    use std::net::SocketAddr;
    use std::sync::Mutex as PlainMutex;

    fn props() -> Properties {
        Properties::parse(
            "\
pool.default.dyna_pool: 10.0.0.4/30
realm_list: radius
realm.radius.type: radius
realm.radius.suffix: @example.com
realm.radius.server: 127.0.0.1:1812
realm.radius.secret: s3cr3t
realm.radius.concentrate: tun0
no_auth.concentrate: tun0
interface.tun0.pool_list: default
interface.tun0.ip_assign: user_select,nas_select,radius
",
        )
        .unwrap()
    }

    fn meta(auth: AuthMethod) -> TunnelMeta {
        TunnelMeta {
            protocol: "pppoe".to_string(),
            peer: "02:00:00:00:00:01".to_string(),
            requested_ip: None,
            auth,
        }
    }

    /// Records everything the daemon pushes towards the peer.
    #[derive(Default)]
    struct RecordingTunnel {
        eap: PlainMutex<Vec<(SessionId, EapFrame)>>,
        closed: PlainMutex<Vec<(SessionId, String)>>,
    }

    impl TunnelLayer for RecordingTunnel {
        fn send_eap(&self, session: SessionId, frame: &EapFrame) {
            self.eap.lock().unwrap().push((session, frame.clone()));
        }

        fn send_ip(&self, _session: SessionId, _packet: &[u8]) {}

        fn close_session(&self, session: SessionId, reason: &str) {
            self.closed
                .lock()
                .unwrap()
                .push((session, reason.to_string()));
        }
    }

    /// Scripted RADIUS server: answers every Access-Request with the
    /// configured code.
    struct ScriptedRadius {
        code: Code,
    }

    #[async_trait]
    impl RadiusClient for ScriptedRadius {
        async fn exchange(
            &self,
            _server: SocketAddr,
            _secret: &[u8],
            request: Packet,
            _timeout: Duration,
        ) -> Result<Packet, RadiusClientError> {
            let mut reply = Packet::new(self.code, request.identifier, request.authenticator);
            match self.code {
                Code::AccessAccept => {
                    reply.add_eap_message(&EapFrame::success(9).to_bytes());
                    reply.add_attribute(Attribute::ipv4(
                        pppac_proto::attribute::attr_type::FRAMED_IP_ADDRESS,
                        std::net::Ipv4Addr::new(10, 0, 0, 5),
                    ));
                }
                Code::AccessReject => {}
                _ => {}
            }
            Ok(reply)
        }
    }

    fn identity_response(id: u8, name: &[u8]) -> EapFrame {
        let mut bytes = vec![2, id, 0, (5 + name.len()) as u8, 1];
        bytes.extend_from_slice(name);
        EapFrame::from_bytes(&bytes).unwrap()
    }

    #[tokio::test]
    async fn full_eap_accept_flow() {
        let tunnel = Arc::new(RecordingTunnel::default());
        let shared = SharedDaemon::new(
            Daemon::new(props()).unwrap(),
            Arc::new(ScriptedRadius {
                code: Code::AccessAccept,
            }),
            tunnel.clone(),
        );

        let id = shared
            .accept_session("ivan@example.com", meta(AuthMethod::Eap))
            .await
            .unwrap();
        // Identity Request went out.
        let first = tunnel.eap.lock().unwrap().first().cloned().unwrap();
        assert_eq!(first.0, id);
        assert_eq!(first.1.code, EapCode::Request);

        shared
            .input_eap(id, &identity_response(first.1.identifier, b"ivan@example.com"))
            .await;

        // The scripted accept lands on a spawned task; wait for it.
        for _ in 0..50 {
            if tunnel.eap.lock().unwrap().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let frames = tunnel.eap.lock().unwrap().clone();
        assert!(frames.iter().any(|(_, f)| f.code == EapCode::Success));
        assert_eq!(shared.session_count().await, 1);
        let records = shared.who().await;
        assert_eq!(records[0].address, Some(std::net::Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[tokio::test]
    async fn reject_closes_session() {
        let tunnel = Arc::new(RecordingTunnel::default());
        let shared = SharedDaemon::new(
            Daemon::new(props()).unwrap(),
            Arc::new(ScriptedRadius {
                code: Code::AccessReject,
            }),
            tunnel.clone(),
        );

        let id = shared
            .accept_session("ivan@example.com", meta(AuthMethod::Eap))
            .await
            .unwrap();
        shared
            .input_eap(id, &identity_response(1, b"ivan@example.com"))
            .await;

        for _ in 0..50 {
            if !tunnel.closed.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let closed = tunnel.closed.lock().unwrap().clone();
        assert_eq!(closed[0].0, id);
        assert_eq!(shared.session_count().await, 0);
    }

    #[tokio::test]
    async fn release_aborts_inflight_exchange() {
        /// Never answers; the exchange task parks until aborted.
        struct StallingRadius;

        #[async_trait]
        impl RadiusClient for StallingRadius {
            async fn exchange(
                &self,
                _server: SocketAddr,
                _secret: &[u8],
                _request: Packet,
                _timeout: Duration,
            ) -> Result<Packet, RadiusClientError> {
                std::future::pending().await
            }
        }

        let tunnel = Arc::new(RecordingTunnel::default());
        let shared = SharedDaemon::new(
            Daemon::new(props()).unwrap(),
            Arc::new(StallingRadius),
            tunnel.clone(),
        );

        let id = shared
            .accept_session("ivan@example.com", meta(AuthMethod::Eap))
            .await
            .unwrap();
        shared
            .input_eap(id, &identity_response(1, b"ivan@example.com"))
            .await;
        assert!(shared.exchanges.lock().unwrap().contains_key(&id));

        shared.release_session(id, "peer disconnected").await;
        assert!(shared.exchanges.lock().unwrap().is_empty());
        assert_eq!(shared.session_count().await, 0);
    }
}
