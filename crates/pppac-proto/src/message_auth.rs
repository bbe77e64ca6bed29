//! Message-Authenticator handling (RFC 2869 section 5.14, RFC 3579
//! section 3.2)
//!
//! Every Access-Request carrying EAP-Message attributes MUST carry a
//! Message-Authenticator; replies to such requests MUST be verified
//! against both the Response Authenticator and the Message-Authenticator
//! before the relay may act on them.

use crate::attribute::{attr_type, Attribute};
use crate::packet::{Packet, PacketError, HEADER_LEN};
use hmac::{Hmac, Mac};
use md5_digest::Md5;

type HmacMd5 = Hmac<Md5>;

fn hmac_md5(secret: &[u8], data: &[u8]) -> [u8; 16] {
    let mut mac = HmacMd5::new_from_slice(secret).expect("HMAC accepts any key size");
    mac.update(data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Append a Message-Authenticator to `packet` and return the signed wire
/// bytes. The attribute is first added zeroed, the HMAC-MD5 is computed
/// over the whole encoded request, then patched into place.
pub fn sign_access_request(packet: &mut Packet, secret: &[u8]) -> Result<Vec<u8>, PacketError> {
    packet.add_attribute(Attribute {
        attr_type: attr_type::MESSAGE_AUTHENTICATOR,
        value: vec![0u8; 16],
    });
    let mut bytes = packet.encode()?;
    let digest = hmac_md5(secret, &bytes);

    let offset = find_message_auth_value(&bytes).ok_or(PacketError::Truncated)?;
    bytes[offset..offset + 16].copy_from_slice(&digest);
    if let Some(attr) = packet
        .attributes
        .iter_mut()
        .rev()
        .find(|a| a.attr_type == attr_type::MESSAGE_AUTHENTICATOR)
    {
        attr.value.copy_from_slice(&digest);
    }
    Ok(bytes)
}

/// Verify a reply against the request it answers.
///
/// Checks the Response Authenticator
/// (`MD5(Code+ID+Length+RequestAuth+Attributes+Secret)`, RFC 2865
/// section 3) and, when the reply carries one, the Message-Authenticator
/// computed with the authenticator field replaced by the request
/// authenticator and the attribute value zeroed.
pub fn verify_reply_authenticators(
    reply: &[u8],
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> bool {
    if reply.len() < HEADER_LEN {
        return false;
    }

    let mut hashed = Vec::with_capacity(reply.len() + secret.len());
    hashed.extend_from_slice(&reply[..4]);
    hashed.extend_from_slice(request_authenticator);
    hashed.extend_from_slice(&reply[HEADER_LEN..]);
    hashed.extend_from_slice(secret);
    if md5::compute(&hashed).0 != reply[4..HEADER_LEN] {
        return false;
    }

    match find_message_auth_value(reply) {
        None => true,
        Some(offset) => {
            if offset + 16 > reply.len() {
                return false;
            }
            let mut copy = reply.to_vec();
            copy[4..HEADER_LEN].copy_from_slice(request_authenticator);
            copy[offset..offset + 16].fill(0);
            hmac_md5(secret, &copy) == reply[offset..offset + 16]
        }
    }
}

/// Offset of the Message-Authenticator value inside raw packet bytes.
fn find_message_auth_value(bytes: &[u8]) -> Option<usize> {
    let mut offset = HEADER_LEN;
    while offset + 2 <= bytes.len() {
        let attr_len = bytes[offset + 1] as usize;
        if attr_len < 2 || offset + attr_len > bytes.len() {
            return None;
        }
        if bytes[offset] == attr_type::MESSAGE_AUTHENTICATOR && attr_len == 18 {
            return Some(offset + 2);
        }
        offset += attr_len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Code;

    fn base_request() -> Packet {
        let mut pkt = Packet::new(Code::AccessRequest, 5, [0x11; 16]);
        pkt.add_attribute(Attribute::string(attr_type::USER_NAME, "dave").unwrap());
        pkt.add_eap_message(&[2, 1, 0, 9, 1, b'd', b'a', b'v', b'e']);
        pkt
    }

    fn reply_for(request_auth: &[u8; 16], secret: &[u8]) -> Vec<u8> {
        // Hand-build an Access-Challenge with a valid response
        // authenticator and Message-Authenticator.
        let mut pkt = Packet::new(Code::AccessChallenge, 5, [0u8; 16]);
        pkt.add_attribute(Attribute::new(attr_type::STATE, vec![9, 9, 9]).unwrap());
        pkt.add_attribute(Attribute {
            attr_type: attr_type::MESSAGE_AUTHENTICATOR,
            value: vec![0u8; 16],
        });
        let mut bytes = pkt.encode().unwrap();

        // Message-Authenticator over the packet with the request
        // authenticator in the header.
        bytes[4..20].copy_from_slice(request_auth);
        let offset = find_message_auth_value(&bytes).unwrap();
        let digest = hmac_md5(secret, &bytes);
        bytes[offset..offset + 16].copy_from_slice(&digest);

        // Then the response authenticator over code+id+len+reqauth+attrs.
        let mut hashed = Vec::new();
        hashed.extend_from_slice(&bytes[..4]);
        hashed.extend_from_slice(request_auth);
        hashed.extend_from_slice(&bytes[HEADER_LEN..]);
        hashed.extend_from_slice(secret);
        let response_auth = md5::compute(&hashed).0;
        bytes[4..20].copy_from_slice(&response_auth);
        bytes
    }

    #[test]
    fn signing_patches_attribute_and_bytes() {
        let mut pkt = base_request();
        let bytes = sign_access_request(&mut pkt, b"s3cr3t").unwrap();
        let offset = find_message_auth_value(&bytes).unwrap();
        assert_ne!(&bytes[offset..offset + 16], &[0u8; 16]);
        let signed_attr = pkt
            .find_attribute(attr_type::MESSAGE_AUTHENTICATOR)
            .unwrap();
        assert_eq!(signed_attr.value, &bytes[offset..offset + 16]);
    }

    #[test]
    fn valid_reply_verifies() {
        let req_auth = [0x22; 16];
        let bytes = reply_for(&req_auth, b"s3cr3t");
        assert!(verify_reply_authenticators(&bytes, &req_auth, b"s3cr3t"));
    }

    #[test]
    fn wrong_secret_fails() {
        let req_auth = [0x22; 16];
        let bytes = reply_for(&req_auth, b"s3cr3t");
        assert!(!verify_reply_authenticators(&bytes, &req_auth, b"other"));
    }

    #[test]
    fn tampered_message_authenticator_fails() {
        let req_auth = [0x22; 16];
        let mut bytes = reply_for(&req_auth, b"s3cr3t");
        let offset = find_message_auth_value(&bytes).unwrap();
        bytes[offset] ^= 0xff;
        assert!(!verify_reply_authenticators(&bytes, &req_auth, b"s3cr3t"));
    }

    #[test]
    fn reply_without_message_auth_only_needs_response_auth() {
        let req_auth = [0x33; 16];
        let secret = b"s3cr3t";
        let pkt = Packet::new(Code::AccessReject, 5, [0u8; 16]);
        let mut bytes = pkt.encode().unwrap();
        let mut hashed = Vec::new();
        hashed.extend_from_slice(&bytes[..4]);
        hashed.extend_from_slice(&req_auth);
        hashed.extend_from_slice(&bytes[HEADER_LEN..]);
        hashed.extend_from_slice(secret);
        let response_auth = md5::compute(&hashed).0;
        bytes[4..20].copy_from_slice(&response_auth);
        assert!(verify_reply_authenticators(&bytes, &req_auth, secret));
    }
}
