//! EAP pass-through authenticator.
//!
//! One instance per EAP-using session, relaying frames between the PPP
//! peer and the realm's RADIUS server. The machine owns no sockets:
//! every entry point returns the actions the daemon must perform (send a
//! frame to the peer, relay an EAP message to RADIUS, finish the
//! session), and timeouts are explicit deadlines the reactor tick sweeps.
//! That keeps the retry/backoff behavior deterministic under test.
//!
//! States: `Initial -> AwaitingPeerResponse <-> RadiusPending -> Stopped`.

use crate::radius::RadiusReply;
use crate::session::LinkKeys;
use pppac_proto::{EapCode, EapFrame};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest peer identity accepted from an Identity Response; bounded so
/// the identity always fits one User-Name attribute.
pub const MAX_IDENTITY_LEN: usize = 253;

/// Ceiling applied to a RADIUS-supplied Session-Timeout.
pub const MAX_SESSION_TIMEOUT: Duration = Duration::from_secs(86400);

/// Retry/backoff knobs, from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EapTimers {
    /// How many times the whole exchange may be (re)started.
    pub restart_limit: u32,
    /// Base peer-response timeout; doubles per restart.
    pub timeout: Duration,
    /// Backoff ceiling.
    pub timeout_cap: Duration,
}

impl EapTimers {
    pub const DEFAULT_RESTART_LIMIT: u32 = 4;
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(6);
    pub const DEFAULT_TIMEOUT_CAP: Duration = Duration::from_secs(24);
}

impl Default for EapTimers {
    fn default() -> Self {
        EapTimers {
            restart_limit: Self::DEFAULT_RESTART_LIMIT,
            timeout: Self::DEFAULT_TIMEOUT,
            timeout_cap: Self::DEFAULT_TIMEOUT_CAP,
        }
    }
}

/// Terminal authentication failures the EAP bridge can produce.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication required")]
    AuthRequired,

    #[error("authentication server did not respond")]
    ServerTimeout,

    #[error("access rejected by the authentication server")]
    Rejected,

    #[error("EAP protocol violation: {0}")]
    Protocol(String),
}

/// What an Access-Accept delivered for the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptInfo {
    pub identity: Option<String>,
    /// Address hint (Framed-IP-Address), honored by the assignment
    /// policy only when the interface's `radius` flag is set.
    pub framed_ip: Option<Ipv4Addr>,
    /// Session-Timeout, already capped.
    pub session_timeout: Option<Duration>,
    /// Decrypted MS-MPPE link-encryption keys.
    pub keys: LinkKeys,
}

/// Actions the daemon performs on the machine's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EapEvent {
    SendToPeer(EapFrame),
    /// Forward an EAP message to the realm's RADIUS server, together
    /// with the State attribute of the pending challenge, if any.
    RelayToRadius {
        eap: Vec<u8>,
        state: Option<Vec<u8>>,
    },
    Authenticated(AcceptInfo),
    Failed(AuthError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EapState {
    Initial,
    AwaitingPeerResponse,
    RadiusPending,
    Stopped,
}

#[derive(Debug)]
pub struct EapAuthenticator {
    state: EapState,
    timers: EapTimers,
    restarts_left: u32,
    starts: u32,
    /// Identifier of the outstanding EAP Request; responses carrying any
    /// other id are discarded.
    request_id: u8,
    identity: Option<String>,
    /// State attribute of the pending Access-Challenge, echoed back on
    /// the next Access-Request.
    radius_state: Option<Vec<u8>>,
    deadline: Option<Instant>,
}

impl EapAuthenticator {
    pub fn new(timers: EapTimers) -> Self {
        EapAuthenticator {
            state: EapState::Initial,
            timers,
            restarts_left: timers.restart_limit,
            starts: 0,
            request_id: 0,
            identity: None,
            radius_state: None,
            deadline: None,
        }
    }

    pub fn state(&self) -> EapState {
        self.state
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// (Re)start the exchange: send an Identity Request and arm the
    /// response deadline. Consumes one restart; when none remain the
    /// session fails with auth-required.
    pub fn start(&mut self, now: Instant) -> Vec<EapEvent> {
        if self.state == EapState::Stopped {
            return Vec::new();
        }
        if self.restarts_left == 0 {
            info!("EAP restart limit reached, authentication required but never completed");
            self.stop();
            return vec![EapEvent::Failed(AuthError::AuthRequired)];
        }
        self.restarts_left -= 1;
        self.request_id = self.request_id.wrapping_add(1);
        self.radius_state = None;
        let timeout = self.backoff();
        self.deadline = Some(now + timeout);
        self.starts += 1;
        self.state = EapState::AwaitingPeerResponse;
        debug!(
            "EAP start #{}: Identity Request id={}, timeout {timeout:?}",
            self.starts, self.request_id
        );
        vec![EapEvent::SendToPeer(EapFrame::identity_request(
            self.request_id,
            "",
        ))]
    }

    /// Exponential per-start backoff, capped.
    fn backoff(&self) -> Duration {
        let exp = self.starts.min(16);
        self.timers
            .timeout
            .saturating_mul(1u32 << exp)
            .min(self.timers.timeout_cap)
    }

    /// Feed a frame from the peer.
    ///
    /// Ignored outside `AwaitingPeerResponse`; a frame whose identifier
    /// mismatches the outstanding request is dropped without touching the
    /// retry deadline.
    pub fn input(&mut self, frame: &EapFrame) -> Vec<EapEvent> {
        if self.state != EapState::AwaitingPeerResponse {
            debug!("EAP frame in state {:?} discarded", self.state);
            return Vec::new();
        }
        if frame.code != EapCode::Response {
            debug!("unexpected EAP code {:?} from peer, discarded", frame.code);
            return Vec::new();
        }
        if frame.identifier != self.request_id {
            debug!(
                "EAP response id {} does not match outstanding request {}, discarded",
                frame.identifier, self.request_id
            );
            return Vec::new();
        }

        if self.identity.is_none() {
            if !frame.is_identity_response() {
                warn!("first EAP response is not an Identity Response");
                self.stop();
                return vec![EapEvent::Failed(AuthError::Protocol(
                    "expected Identity Response".to_string(),
                ))];
            }
            let raw = frame.type_data();
            if raw.len() > MAX_IDENTITY_LEN {
                warn!("EAP identity of {} octets rejected", raw.len());
                self.stop();
                return vec![EapEvent::Failed(AuthError::Protocol(
                    "identity too long".to_string(),
                ))];
            }
            let name = match String::from_utf8(raw.to_vec()) {
                Ok(name) => name,
                Err(_) => {
                    self.stop();
                    return vec![EapEvent::Failed(AuthError::Protocol(
                        "identity is not valid UTF-8".to_string(),
                    ))];
                }
            };
            debug!("EAP peer identity '{name}'");
            self.identity = Some(name);
        }

        self.state = EapState::RadiusPending;
        self.deadline = None;
        vec![EapEvent::RelayToRadius {
            eap: frame.to_bytes(),
            state: self.radius_state.clone(),
        }]
    }

    /// Outcome of the relayed Access-Request.
    pub fn radius_reply(&mut self, now: Instant, reply: RadiusReply) -> Vec<EapEvent> {
        if self.state != EapState::RadiusPending {
            debug!("RADIUS reply in state {:?} discarded", self.state);
            return Vec::new();
        }
        match reply {
            RadiusReply::Challenge {
                state,
                eap,
                session_timeout,
            } => {
                let frame = match EapFrame::from_bytes(&eap) {
                    Ok(frame) if frame.code == EapCode::Request => frame,
                    _ => {
                        warn!("Access-Challenge without a usable EAP Request, restarting");
                        return self.start(now);
                    }
                };
                self.radius_state = state;
                self.request_id = frame.identifier;
                // Re-arm to half the server-side session timeout when the
                // server supplied one.
                let timeout = session_timeout
                    .map(|secs| Duration::from_secs(secs as u64 / 2))
                    .filter(|t| !t.is_zero())
                    .unwrap_or(self.timers.timeout)
                    .min(self.timers.timeout_cap);
                self.deadline = Some(now + timeout);
                self.state = EapState::AwaitingPeerResponse;
                vec![EapEvent::SendToPeer(frame)]
            }
            RadiusReply::Accept {
                eap,
                framed_ip,
                session_timeout,
                keys,
            } => {
                let frame = eap.and_then(|bytes| EapFrame::from_bytes(&bytes).ok());
                if frame.as_ref().is_some_and(|f| f.code == EapCode::Failure) {
                    // Accept carrying an EAP Failure still fails the peer.
                    let failure = EapFrame::failure(self.request_id.wrapping_add(1));
                    self.stop();
                    return vec![
                        EapEvent::SendToPeer(failure),
                        EapEvent::Failed(AuthError::Rejected),
                    ];
                }
                let success = frame
                    .filter(|f| f.code == EapCode::Success)
                    .unwrap_or_else(|| EapFrame::success(self.request_id.wrapping_add(1)));
                let info = AcceptInfo {
                    identity: self.identity.clone(),
                    framed_ip,
                    session_timeout: session_timeout
                        .map(|secs| Duration::from_secs(secs as u64).min(MAX_SESSION_TIMEOUT)),
                    keys,
                };
                self.stop();
                vec![EapEvent::SendToPeer(success), EapEvent::Authenticated(info)]
            }
            RadiusReply::Reject { .. } => {
                let failure = EapFrame::failure(self.request_id.wrapping_add(1));
                self.stop();
                vec![
                    EapEvent::SendToPeer(failure),
                    EapEvent::Failed(AuthError::Rejected),
                ]
            }
            RadiusReply::Timeout => {
                // Distinct error class; the retry is a restart of the
                // whole exchange, not a bare resend.
                info!("authentication server timeout, restarting EAP exchange");
                self.restart_or_fail(now, AuthError::ServerTimeout)
            }
            RadiusReply::Malformed => {
                warn!("malformed RADIUS reply, restarting EAP exchange");
                self.restart_or_fail(now, AuthError::ServerTimeout)
            }
        }
    }

    fn restart_or_fail(&mut self, now: Instant, terminal: AuthError) -> Vec<EapEvent> {
        if self.restarts_left == 0 {
            self.stop();
            return vec![EapEvent::Failed(terminal)];
        }
        self.start(now)
    }

    /// Deadline sweep from the reactor tick. An expired peer-response
    /// deadline restarts the exchange.
    pub fn on_timer(&mut self, now: Instant) -> Vec<EapEvent> {
        if self.state != EapState::AwaitingPeerResponse {
            return Vec::new();
        }
        match self.deadline {
            Some(deadline) if deadline <= now => {
                debug!("no EAP response before deadline, restarting");
                self.start(now)
            }
            _ => Vec::new(),
        }
    }

    fn stop(&mut self) {
        self.state = EapState::Stopped;
        self.deadline = None;
        self.radius_state = None;
    }
}
