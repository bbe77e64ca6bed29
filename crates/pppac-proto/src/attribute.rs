//! RADIUS attribute encoding (RFC 2865 section 5)
//!
//! Attributes are type-length-value triples; the value is at most 253
//! octets because the length octet counts the two-octet header. The
//! attribute type stays a raw octet here so replies carrying attributes
//! the daemon does not know about still decode.

use crate::packet::PacketError;
use std::net::Ipv4Addr;

/// Attribute type octets used by the EAP bridge (RFC 2865/2869/3579).
pub mod attr_type {
    pub const USER_NAME: u8 = 1;
    pub const NAS_IP_ADDRESS: u8 = 4;
    pub const NAS_PORT: u8 = 5;
    pub const SERVICE_TYPE: u8 = 6;
    pub const FRAMED_PROTOCOL: u8 = 7;
    pub const FRAMED_IP_ADDRESS: u8 = 8;
    pub const FRAMED_IP_NETMASK: u8 = 9;
    pub const STATE: u8 = 24;
    pub const CLASS: u8 = 25;
    pub const VENDOR_SPECIFIC: u8 = 26;
    pub const SESSION_TIMEOUT: u8 = 27;
    pub const CALLED_STATION_ID: u8 = 30;
    pub const CALLING_STATION_ID: u8 = 31;
    pub const NAS_IDENTIFIER: u8 = 32;
    pub const ACCT_SESSION_ID: u8 = 44;
    pub const NAS_PORT_TYPE: u8 = 61;
    pub const EAP_MESSAGE: u8 = 79;
    pub const MESSAGE_AUTHENTICATOR: u8 = 80;
}

/// Largest value an attribute can carry.
pub const MAX_VALUE_LEN: usize = 253;

/// One RADIUS attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: u8,
    pub value: Vec<u8>,
}

impl Attribute {
    pub fn new(attr_type: u8, value: Vec<u8>) -> Result<Self, PacketError> {
        if value.len() > MAX_VALUE_LEN {
            return Err(PacketError::AttributeTooLong(value.len()));
        }
        Ok(Attribute { attr_type, value })
    }

    pub fn string(attr_type: u8, value: impl AsRef<str>) -> Result<Self, PacketError> {
        Attribute::new(attr_type, value.as_ref().as_bytes().to_vec())
    }

    pub fn integer(attr_type: u8, value: u32) -> Self {
        Attribute {
            attr_type,
            value: value.to_be_bytes().to_vec(),
        }
    }

    pub fn ipv4(attr_type: u8, value: Ipv4Addr) -> Self {
        Attribute {
            attr_type,
            value: value.octets().to_vec(),
        }
    }

    /// Build a Vendor-Specific attribute (type 26) with a single
    /// vendor sub-attribute.
    pub fn vendor(vendor_id: u32, vendor_type: u8, data: &[u8]) -> Result<Self, PacketError> {
        let mut value = Vec::with_capacity(6 + data.len());
        value.extend_from_slice(&vendor_id.to_be_bytes());
        value.push(vendor_type);
        value.push((data.len() + 2) as u8);
        value.extend_from_slice(data);
        Attribute::new(attr_type::VENDOR_SPECIFIC, value)
    }

    pub fn as_string(&self) -> Result<String, PacketError> {
        String::from_utf8(self.value.clone()).map_err(|_| PacketError::InvalidValue(self.attr_type))
    }

    pub fn as_integer(&self) -> Result<u32, PacketError> {
        let octets: [u8; 4] = self
            .value
            .as_slice()
            .try_into()
            .map_err(|_| PacketError::InvalidValue(self.attr_type))?;
        Ok(u32::from_be_bytes(octets))
    }

    pub fn as_ipv4(&self) -> Result<Ipv4Addr, PacketError> {
        let octets: [u8; 4] = self
            .value
            .as_slice()
            .try_into()
            .map_err(|_| PacketError::InvalidValue(self.attr_type))?;
        Ok(Ipv4Addr::from(octets))
    }

    /// Split a Vendor-Specific value into `(vendor_id, vendor_type, data)`.
    /// Only single-sub-attribute VSAs are understood; that is what every
    /// RADIUS server the daemon talks to emits for the MPPE keys.
    pub fn as_vendor(&self) -> Result<(u32, u8, &[u8]), PacketError> {
        if self.attr_type != attr_type::VENDOR_SPECIFIC || self.value.len() < 6 {
            return Err(PacketError::InvalidValue(self.attr_type));
        }
        let vendor_id = u32::from_be_bytes([
            self.value[0],
            self.value[1],
            self.value[2],
            self.value[3],
        ]);
        let vendor_type = self.value[4];
        let vendor_len = self.value[5] as usize;
        if vendor_len < 2 || 4 + vendor_len > self.value.len() {
            return Err(PacketError::InvalidValue(self.attr_type));
        }
        Ok((vendor_id, vendor_type, &self.value[6..4 + vendor_len]))
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.attr_type);
        out.push((self.value.len() + 2) as u8);
        out.extend_from_slice(&self.value);
    }

    /// Decode one attribute from the head of `data`; returns the
    /// attribute and the number of octets consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), PacketError> {
        if data.len() < 2 {
            return Err(PacketError::Truncated);
        }
        let len = data[1] as usize;
        if len < 2 || len > data.len() {
            return Err(PacketError::Truncated);
        }
        Ok((
            Attribute {
                attr_type: data[0],
                value: data[2..len].to_vec(),
            },
            len,
        ))
    }

    pub fn encoded_length(&self) -> usize {
        2 + self.value.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let attr = Attribute::string(attr_type::USER_NAME, "bob@example.net").unwrap();
        let mut buf = Vec::new();
        attr.encode(&mut buf);
        let (decoded, used) = Attribute::decode(&buf).unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded, attr);
        assert_eq!(decoded.as_string().unwrap(), "bob@example.net");
    }

    #[test]
    fn integer_and_ipv4_accessors() {
        let attr = Attribute::integer(attr_type::SESSION_TIMEOUT, 3600);
        assert_eq!(attr.as_integer().unwrap(), 3600);

        let attr = Attribute::ipv4(attr_type::FRAMED_IP_ADDRESS, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(attr.as_ipv4().unwrap(), Ipv4Addr::new(10, 0, 0, 5));
        assert!(attr.as_integer().is_ok()); // same width, caller's choice
    }

    #[test]
    fn oversized_value_rejected() {
        assert!(matches!(
            Attribute::new(attr_type::STATE, vec![0u8; 254]),
            Err(PacketError::AttributeTooLong(254))
        ));
    }

    #[test]
    fn vendor_round_trip() {
        let attr = Attribute::vendor(311, 16, &[0xab; 18]).unwrap();
        let (vendor_id, vendor_type, data) = attr.as_vendor().unwrap();
        assert_eq!(vendor_id, 311);
        assert_eq!(vendor_type, 16);
        assert_eq!(data, &[0xab; 18]);
    }

    #[test]
    fn truncated_attribute_rejected() {
        assert!(Attribute::decode(&[1]).is_err());
        assert!(Attribute::decode(&[1, 10, 0, 0]).is_err());
        assert!(Attribute::decode(&[1, 1, 0]).is_err()); // length below header
    }
}
