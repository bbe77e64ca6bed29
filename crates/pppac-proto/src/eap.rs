//! EAP frame codec (RFC 3748)
//!
//! The daemon is a pass-through authenticator: apart from the Identity
//! round it never interprets method-specific type-data, it only relays
//! frames between the PPP peer and the RADIUS server. The codec therefore
//! keeps the method type as a raw octet instead of an enum, so unknown
//! methods survive the round trip untouched.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Code      |  Identifier   |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |  Type-Data ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use thiserror::Error;

/// EAP method type octets the daemon actually looks at.
pub const TYPE_IDENTITY: u8 = 1;
/// Nak (Response only), sent when the peer refuses the offered method.
pub const TYPE_NAK: u8 = 3;

/// EAP packet code (first octet).
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EapCode {
    Request = 1,
    Response = 2,
    Success = 3,
    Failure = 4,
}

impl EapCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(EapCode::Request),
            2 => Some(EapCode::Response),
            3 => Some(EapCode::Success),
            4 => Some(EapCode::Failure),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Body of an EAP frame.
///
/// Request/Response carry a method type octet plus type-data; Success and
/// Failure are headers only.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EapBody {
    /// Request or Response: method type plus opaque type-data.
    Typed { method: u8, data: Vec<u8> },
    /// Success or Failure: no body.
    Empty,
}

/// A single EAP frame.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapFrame {
    pub code: EapCode,
    pub identifier: u8,
    pub body: EapBody,
}

impl EapFrame {
    /// Build an Identity Request carrying an optional display message.
    pub fn identity_request(identifier: u8, message: &str) -> Self {
        EapFrame {
            code: EapCode::Request,
            identifier,
            body: EapBody::Typed {
                method: TYPE_IDENTITY,
                data: message.as_bytes().to_vec(),
            },
        }
    }

    /// Build a Success frame.
    pub fn success(identifier: u8) -> Self {
        EapFrame {
            code: EapCode::Success,
            identifier,
            body: EapBody::Empty,
        }
    }

    /// Build a Failure frame.
    pub fn failure(identifier: u8) -> Self {
        EapFrame {
            code: EapCode::Failure,
            identifier,
            body: EapBody::Empty,
        }
    }

    /// The method type octet, if this frame carries one.
    pub fn method(&self) -> Option<u8> {
        match &self.body {
            EapBody::Typed { method, .. } => Some(*method),
            EapBody::Empty => None,
        }
    }

    /// Type-data of a Request/Response, empty slice otherwise.
    pub fn type_data(&self) -> &[u8] {
        match &self.body {
            EapBody::Typed { data, .. } => data,
            EapBody::Empty => &[],
        }
    }

    /// True when this is an Identity Response; `type_data()` is then the
    /// peer's identity.
    pub fn is_identity_response(&self) -> bool {
        self.code == EapCode::Response && self.method() == Some(TYPE_IDENTITY)
    }

    /// Parse a frame, tolerating trailing padding after the declared
    /// length (PPP padding is common).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EapError> {
        if bytes.len() < 4 {
            return Err(EapError::Truncated {
                expected: 4,
                actual: bytes.len(),
            });
        }
        let code = EapCode::from_u8(bytes[0]).ok_or(EapError::InvalidCode(bytes[0]))?;
        let identifier = bytes[1];
        let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if length < 4 {
            return Err(EapError::InvalidLength(length));
        }
        if bytes.len() < length {
            return Err(EapError::Truncated {
                expected: length,
                actual: bytes.len(),
            });
        }

        let body = match code {
            EapCode::Request | EapCode::Response => {
                if length < 5 {
                    return Err(EapError::InvalidLength(length));
                }
                EapBody::Typed {
                    method: bytes[4],
                    data: bytes[5..length].to_vec(),
                }
            }
            EapCode::Success | EapCode::Failure => EapBody::Empty,
        };

        Ok(EapFrame {
            code,
            identifier,
            body,
        })
    }

    /// Encode the frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.length());
        bytes.push(self.code.as_u8());
        bytes.push(self.identifier);
        bytes.extend_from_slice(&(self.length() as u16).to_be_bytes());
        if let EapBody::Typed { method, data } = &self.body {
            bytes.push(*method);
            bytes.extend_from_slice(data);
        }
        bytes
    }

    /// Total encoded length of the frame.
    pub fn length(&self) -> usize {
        match &self.body {
            EapBody::Typed { data, .. } => 5 + data.len(),
            EapBody::Empty => 4,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EapError {
    #[error("frame too short: expected at least {expected} octets, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("invalid EAP code: {0}")]
    InvalidCode(u8),

    #[error("invalid frame length: {0}")]
    InvalidLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_request_round_trip() {
        let frame = EapFrame::identity_request(7, "");
        let bytes = frame.to_bytes();
        assert_eq!(bytes, vec![1, 7, 0, 5, TYPE_IDENTITY]);
        assert_eq!(EapFrame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn identity_response_extracts_name() {
        let mut bytes = vec![2, 7, 0, 10, TYPE_IDENTITY];
        bytes.extend_from_slice(b"alice");
        let frame = EapFrame::from_bytes(&bytes).unwrap();
        assert!(frame.is_identity_response());
        assert_eq!(frame.type_data(), b"alice");
    }

    #[test]
    fn unknown_method_survives_round_trip() {
        // EAP-TLS (13) is opaque to the relay but must not be rejected.
        let bytes = vec![1, 3, 0, 7, 13, 0x20, 0x00];
        let frame = EapFrame::from_bytes(&bytes).unwrap();
        assert_eq!(frame.method(), Some(13));
        assert_eq!(frame.to_bytes(), bytes);
    }

    #[test]
    fn success_has_no_body() {
        let frame = EapFrame::from_bytes(&[3, 9, 0, 4]).unwrap();
        assert_eq!(frame.code, EapCode::Success);
        assert_eq!(frame.body, EapBody::Empty);
        assert_eq!(frame.to_bytes(), vec![3, 9, 0, 4]);
    }

    #[test]
    fn trailing_padding_is_tolerated() {
        let frame = EapFrame::from_bytes(&[4, 1, 0, 4, 0, 0, 0]).unwrap();
        assert_eq!(frame.code, EapCode::Failure);
    }

    #[test]
    fn truncated_and_invalid_frames_rejected() {
        assert!(matches!(
            EapFrame::from_bytes(&[1, 1]),
            Err(EapError::Truncated { .. })
        ));
        assert!(matches!(
            EapFrame::from_bytes(&[9, 1, 0, 4]),
            Err(EapError::InvalidCode(9))
        ));
        // Declared length larger than the buffer.
        assert!(matches!(
            EapFrame::from_bytes(&[1, 1, 0, 50, 1]),
            Err(EapError::Truncated { .. })
        ));
        // Request with no room for the type octet.
        assert!(matches!(
            EapFrame::from_bytes(&[1, 1, 0, 4]),
            Err(EapError::InvalidLength(4))
        ));
    }
}
