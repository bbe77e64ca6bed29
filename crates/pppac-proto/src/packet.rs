//! RADIUS packet codec — only the slice of RFC 2865/3579 the EAP bridge
//! touches: building Access-Requests and decoding the Access-Accept /
//! Access-Reject / Access-Challenge replies, including EAP-Message
//! reassembly.

use crate::attribute::{attr_type, Attribute};
use std::net::Ipv4Addr;
use thiserror::Error;

/// An EAP message is carried in EAP-Message attributes of at most this
/// many octets (RFC 3579 section 3.1); longer messages are chunked.
pub const EAP_MESSAGE_CHUNK: usize = 253;

pub const HEADER_LEN: usize = 20;
pub const MAX_PACKET_LEN: usize = 4096;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet truncated")]
    Truncated,

    #[error("invalid packet code: {0}")]
    InvalidCode(u8),

    #[error("declared length {0} out of range")]
    InvalidLength(usize),

    #[error("attribute value too long: {0} octets")]
    AttributeTooLong(usize),

    #[error("attribute {0} has an unexpected value shape")]
    InvalidValue(u8),
}

/// RADIUS packet codes the bridge sends or accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Code {
    AccessRequest = 1,
    AccessAccept = 2,
    AccessReject = 3,
    AccessChallenge = 11,
}

impl Code {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Code::AccessRequest),
            2 => Some(Code::AccessAccept),
            3 => Some(Code::AccessReject),
            11 => Some(Code::AccessChallenge),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A decoded RADIUS packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub code: Code,
    pub identifier: u8,
    pub authenticator: [u8; 16],
    pub attributes: Vec<Attribute>,
}

impl Packet {
    pub fn new(code: Code, identifier: u8, authenticator: [u8; 16]) -> Self {
        Packet {
            code,
            identifier,
            authenticator,
            attributes: Vec::new(),
        }
    }

    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    pub fn find_attribute(&self, attr_type: u8) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.attr_type == attr_type)
    }

    pub fn find_all_attributes(&self, attr_type: u8) -> impl Iterator<Item = &Attribute> {
        self.attributes.iter().filter(move |a| a.attr_type == attr_type)
    }

    /// Append an EAP message, chunked into EAP-Message attributes of at
    /// most [`EAP_MESSAGE_CHUNK`] octets each.
    pub fn add_eap_message(&mut self, eap_bytes: &[u8]) {
        if eap_bytes.is_empty() {
            return;
        }
        for chunk in eap_bytes.chunks(EAP_MESSAGE_CHUNK) {
            self.attributes.push(Attribute {
                attr_type: attr_type::EAP_MESSAGE,
                value: chunk.to_vec(),
            });
        }
    }

    /// Reassemble the EAP message spread over the packet's EAP-Message
    /// attributes; `None` when the packet carries none.
    pub fn eap_message(&self) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let mut seen = false;
        for attr in self.find_all_attributes(attr_type::EAP_MESSAGE) {
            seen = true;
            out.extend_from_slice(&attr.value);
        }
        seen.then_some(out)
    }

    /// Framed-IP-Address, when present and not one of the two sentinel
    /// values (0xffffffff "user selects", 0xfffffffe "NAS selects").
    pub fn framed_ip_address(&self) -> Option<Ipv4Addr> {
        self.find_attribute(attr_type::FRAMED_IP_ADDRESS)
            .and_then(|a| a.as_ipv4().ok())
            .filter(|ip| {
                let v = u32::from(*ip);
                v != 0xffff_ffff && v != 0xffff_fffe
            })
    }

    pub fn session_timeout(&self) -> Option<u32> {
        self.find_attribute(attr_type::SESSION_TIMEOUT)
            .and_then(|a| a.as_integer().ok())
    }

    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let length = self.length();
        if length > MAX_PACKET_LEN {
            return Err(PacketError::InvalidLength(length));
        }
        let mut out = Vec::with_capacity(length);
        out.push(self.code.as_u8());
        out.push(self.identifier);
        out.extend_from_slice(&(length as u16).to_be_bytes());
        out.extend_from_slice(&self.authenticator);
        for attr in &self.attributes {
            attr.encode(&mut out);
        }
        Ok(out)
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_LEN {
            return Err(PacketError::Truncated);
        }
        let code = Code::from_u8(data[0]).ok_or(PacketError::InvalidCode(data[0]))?;
        let identifier = data[1];
        let length = u16::from_be_bytes([data[2], data[3]]) as usize;
        if length < HEADER_LEN || length > MAX_PACKET_LEN {
            return Err(PacketError::InvalidLength(length));
        }
        if data.len() < length {
            return Err(PacketError::Truncated);
        }
        let mut authenticator = [0u8; 16];
        authenticator.copy_from_slice(&data[4..20]);

        let mut attributes = Vec::new();
        let mut offset = HEADER_LEN;
        while offset < length {
            let (attr, used) = Attribute::decode(&data[offset..length])?;
            attributes.push(attr);
            offset += used;
        }

        Ok(Packet {
            code,
            identifier,
            authenticator,
            attributes,
        })
    }

    pub fn length(&self) -> usize {
        HEADER_LEN
            + self
                .attributes
                .iter()
                .map(Attribute::encoded_length)
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Packet {
        let mut pkt = Packet::new(Code::AccessRequest, 42, [7u8; 16]);
        pkt.add_attribute(Attribute::string(attr_type::USER_NAME, "carol@corp").unwrap());
        pkt.add_attribute(Attribute::integer(attr_type::NAS_PORT, 12));
        pkt
    }

    #[test]
    fn encode_decode_round_trip() {
        let pkt = request();
        let bytes = pkt.encode().unwrap();
        assert_eq!(bytes.len(), pkt.length());
        assert_eq!(Packet::decode(&bytes).unwrap(), pkt);
    }

    #[test]
    fn eap_message_chunking_at_253() {
        let mut pkt = request();
        let eap = vec![0x5a; 600];
        pkt.add_eap_message(&eap);
        let chunks: Vec<_> = pkt.find_all_attributes(attr_type::EAP_MESSAGE).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].value.len(), 253);
        assert_eq!(chunks[1].value.len(), 253);
        assert_eq!(chunks[2].value.len(), 94);
        assert_eq!(pkt.eap_message().unwrap(), eap);
    }

    #[test]
    fn short_eap_message_single_chunk() {
        let mut pkt = request();
        pkt.add_eap_message(&[1, 2, 3]);
        assert_eq!(pkt.find_all_attributes(attr_type::EAP_MESSAGE).count(), 1);
        assert_eq!(pkt.eap_message().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn no_eap_message_is_none() {
        assert!(request().eap_message().is_none());
    }

    #[test]
    fn framed_ip_sentinels_are_hidden() {
        let mut pkt = Packet::new(Code::AccessAccept, 1, [0u8; 16]);
        pkt.add_attribute(Attribute::ipv4(
            attr_type::FRAMED_IP_ADDRESS,
            Ipv4Addr::new(255, 255, 255, 254),
        ));
        assert_eq!(pkt.framed_ip_address(), None);

        let mut pkt = Packet::new(Code::AccessAccept, 1, [0u8; 16]);
        pkt.add_attribute(Attribute::ipv4(
            attr_type::FRAMED_IP_ADDRESS,
            Ipv4Addr::new(10, 1, 2, 3),
        ));
        assert_eq!(pkt.framed_ip_address(), Some(Ipv4Addr::new(10, 1, 2, 3)));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Packet::decode(&[1, 2, 3]).is_err());
        let mut bytes = request().encode().unwrap();
        bytes[0] = 99; // unknown code
        assert!(matches!(
            Packet::decode(&bytes),
            Err(PacketError::InvalidCode(99))
        ));
        let mut bytes = request().encode().unwrap();
        bytes[3] = 10; // declared length below header size
        assert!(Packet::decode(&bytes).is_err());
    }
}
