//! RADIUS client for the EAP pass-through bridge.
//!
//! One Access-Request per relayed EAP message: the request is signed with
//! a Message-Authenticator, the reply verified against both
//! authenticators before anything else looks at it, and the decoded
//! packet reduced to the small [`RadiusReply`] summary the authenticator
//! state machine consumes. The daemon runs each exchange as a cancellable
//! task keyed by session id, so releasing a session aborts its in-flight
//! request.

use crate::session::LinkKeys;
use async_trait::async_trait;
use pppac_proto::attribute::attr_type;
use pppac_proto::mppe::{MS_MPPE_RECV_KEY, MS_MPPE_SEND_KEY};
use pppac_proto::{
    decrypt_mppe_key, sign_access_request, verify_reply_authenticators, Attribute, Code, Packet,
    PacketError, VENDOR_MICROSOFT,
};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Service-Type Framed (RFC 2865).
const SERVICE_TYPE_FRAMED: u32 = 2;
/// Framed-Protocol PPP.
const FRAMED_PROTOCOL_PPP: u32 = 1;
/// NAS-Port-Type Virtual.
const NAS_PORT_TYPE_VIRTUAL: u32 = 5;

#[derive(Debug, Error)]
pub enum RadiusClientError {
    #[error("authentication server did not respond in time")]
    Timeout,

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed reply: {0}")]
    Malformed(#[from] PacketError),
}

/// The seam the daemon sends Access-Requests through. The UDP
/// implementation below is the production one; tests plug in scripted
/// fakes.
#[async_trait]
pub trait RadiusClient: Send + Sync {
    async fn exchange(
        &self,
        server: SocketAddr,
        secret: &[u8],
        request: Packet,
        timeout: Duration,
    ) -> Result<Packet, RadiusClientError>;
}

/// Ephemeral-socket UDP client. Replies whose identifier or
/// authenticators do not check out are dropped and the wait continues
/// until the deadline.
#[derive(Debug, Default)]
pub struct UdpRadiusClient;

#[async_trait]
impl RadiusClient for UdpRadiusClient {
    async fn exchange(
        &self,
        server: SocketAddr,
        secret: &[u8],
        mut request: Packet,
        timeout: Duration,
    ) -> Result<Packet, RadiusClientError> {
        let wire = sign_access_request(&mut request, secret)?;
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect(server).await?;
        socket.send(&wire).await?;

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 4096];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RadiusClientError::Timeout);
            }
            let n = match tokio::time::timeout(remaining, socket.recv(&mut buf)).await {
                Err(_) => return Err(RadiusClientError::Timeout),
                Ok(recvd) => recvd?,
            };
            let reply = &buf[..n];
            if n < 2 || reply[1] != request.identifier {
                debug!("RADIUS reply with stray identifier, ignored");
                continue;
            }
            if !verify_reply_authenticators(reply, &request.authenticator, secret) {
                warn!("RADIUS reply failed authenticator verification, ignored");
                continue;
            }
            return Ok(Packet::decode(reply)?);
        }
    }
}

/// Build the Access-Request relaying one EAP message, with the NAS
/// attributes a PPP concentrator sends. The Message-Authenticator is
/// added at signing time.
pub fn build_access_request(
    identifier: u8,
    username: Option<&str>,
    eap: &[u8],
    state: Option<&[u8]>,
    nas_identifier: &str,
    calling_station: &str,
) -> Result<Packet, PacketError> {
    let mut packet = Packet::new(Code::AccessRequest, identifier, rand::random());
    if let Some(username) = username {
        packet.add_attribute(Attribute::string(attr_type::USER_NAME, username)?);
    }
    packet.add_attribute(Attribute::string(attr_type::NAS_IDENTIFIER, nas_identifier)?);
    packet.add_attribute(Attribute::integer(
        attr_type::SERVICE_TYPE,
        SERVICE_TYPE_FRAMED,
    ));
    packet.add_attribute(Attribute::integer(
        attr_type::FRAMED_PROTOCOL,
        FRAMED_PROTOCOL_PPP,
    ));
    packet.add_attribute(Attribute::integer(
        attr_type::NAS_PORT_TYPE,
        NAS_PORT_TYPE_VIRTUAL,
    ));
    if !calling_station.is_empty() {
        packet.add_attribute(Attribute::string(
            attr_type::CALLING_STATION_ID,
            calling_station,
        )?);
    }
    packet.add_eap_message(eap);
    if let Some(state) = state {
        packet.add_attribute(Attribute::new(attr_type::STATE, state.to_vec())?);
    }
    Ok(packet)
}

/// What a finished exchange means to the EAP state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadiusReply {
    Challenge {
        state: Option<Vec<u8>>,
        eap: Vec<u8>,
        session_timeout: Option<u32>,
    },
    Accept {
        eap: Option<Vec<u8>>,
        framed_ip: Option<Ipv4Addr>,
        session_timeout: Option<u32>,
        keys: LinkKeys,
    },
    Reject {
        eap: Option<Vec<u8>>,
    },
    Timeout,
    Malformed,
}

/// Reduce a verified reply packet to its [`RadiusReply`] summary,
/// decrypting the MS-MPPE key attributes of an Access-Accept.
pub fn summarize_reply(
    reply: &Packet,
    secret: &[u8],
    request_authenticator: &[u8; 16],
) -> RadiusReply {
    match reply.code {
        Code::AccessChallenge => match reply.eap_message() {
            Some(eap) => RadiusReply::Challenge {
                state: reply
                    .find_attribute(attr_type::STATE)
                    .map(|a| a.value.clone()),
                eap,
                session_timeout: reply.session_timeout(),
            },
            None => {
                warn!("Access-Challenge without EAP-Message");
                RadiusReply::Malformed
            }
        },
        Code::AccessAccept => RadiusReply::Accept {
            eap: reply.eap_message(),
            framed_ip: reply.framed_ip_address(),
            session_timeout: reply.session_timeout(),
            keys: decrypt_link_keys(reply, secret, request_authenticator),
        },
        Code::AccessReject => RadiusReply::Reject {
            eap: reply.eap_message(),
        },
        Code::AccessRequest => RadiusReply::Malformed,
    }
}

fn decrypt_link_keys(reply: &Packet, secret: &[u8], request_authenticator: &[u8; 16]) -> LinkKeys {
    let mut keys = LinkKeys::default();
    for attr in reply.find_all_attributes(attr_type::VENDOR_SPECIFIC) {
        let (vendor, vendor_type, data) = match attr.as_vendor() {
            Ok(parts) => parts,
            Err(_) => continue,
        };
        if vendor != VENDOR_MICROSOFT {
            continue;
        }
        let slot = match vendor_type {
            MS_MPPE_SEND_KEY => &mut keys.send_key,
            MS_MPPE_RECV_KEY => &mut keys.recv_key,
            _ => continue,
        };
        match decrypt_mppe_key(secret, request_authenticator, data) {
            Ok(key) => *slot = Some(key),
            Err(e) => warn!("MPPE key attribute {vendor_type} undecryptable: {e}"),
        }
    }
    keys
}
