//! Protocol building blocks for the pppacd access concentrator.
//!
//! This crate carries the wire-level pieces the daemon's EAP pass-through
//! bridge needs and nothing more: the EAP frame codec (RFC 3748), the
//! narrow RADIUS packet/attribute surface used to relay EAP over RADIUS
//! (RFC 3579), the Message-Authenticator attribute (RFC 2869) and the
//! MS-MPPE key attributes (RFC 2548). A full RADIUS stack is out of
//! scope; the daemon only ever builds Access-Requests and consumes the
//! replies a home server sends back.

pub mod attribute;
pub mod eap;
pub mod message_auth;
pub mod mppe;
pub mod packet;

pub use attribute::{attr_type, Attribute};
pub use eap::{EapBody, EapCode, EapError, EapFrame};
pub use message_auth::{sign_access_request, verify_reply_authenticators};
pub use mppe::{decrypt_mppe_key, encrypt_mppe_key, MppeKeyError, VENDOR_MICROSOFT};
pub use packet::{Code, Packet, PacketError, EAP_MESSAGE_CHUNK};
