//! MS-MPPE key attributes (RFC 2548 sections 2.4.2 / 2.4.3)
//!
//! An Access-Accept finishing an EAP exchange delivers the derived link
//! encryption keys as MS-MPPE-Send-Key / MS-MPPE-Recv-Key vendor
//! attributes, each encrypted with MD5 keyed on the shared secret and
//! the Access-Request authenticator. The daemon decrypts them before
//! handing them to the tunnel layer; the encrypt direction exists for
//! tests and tooling.

use thiserror::Error;

/// Microsoft's SMI enterprise code, the vendor id of the MPPE attributes.
pub const VENDOR_MICROSOFT: u32 = 311;
/// Vendor types within [`VENDOR_MICROSOFT`].
pub const MS_MPPE_SEND_KEY: u8 = 16;
pub const MS_MPPE_RECV_KEY: u8 = 17;

const BLOCK: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MppeKeyError {
    #[error("salted key blob too short: {0} octets")]
    TooShort(usize),

    #[error("ciphertext length {0} is not a multiple of 16")]
    BadBlocking(usize),

    #[error("salt does not have its high bit set")]
    BadSalt,

    #[error("embedded key length {0} exceeds plaintext")]
    BadKeyLength(usize),
}

fn md5_cat(parts: &[&[u8]]) -> [u8; BLOCK] {
    let mut buf = Vec::new();
    for part in parts {
        buf.extend_from_slice(part);
    }
    md5::compute(&buf).0
}

/// Decrypt a salted MPPE key blob (`salt || c(1) || ... || c(n)`).
///
/// Returns the key with the length octet and padding stripped.
pub fn decrypt_mppe_key(
    secret: &[u8],
    request_authenticator: &[u8; 16],
    blob: &[u8],
) -> Result<Vec<u8>, MppeKeyError> {
    if blob.len() < 2 + BLOCK {
        return Err(MppeKeyError::TooShort(blob.len()));
    }
    let (salt, cipher) = blob.split_at(2);
    if cipher.len() % BLOCK != 0 {
        return Err(MppeKeyError::BadBlocking(cipher.len()));
    }
    if salt[0] & 0x80 == 0 {
        return Err(MppeKeyError::BadSalt);
    }

    let mut plain = Vec::with_capacity(cipher.len());
    let mut prev = md5_cat(&[secret, request_authenticator, salt]);
    for block in cipher.chunks(BLOCK) {
        for (p, c) in prev.iter().zip(block) {
            plain.push(p ^ c);
        }
        prev = md5_cat(&[secret, block]);
    }

    let key_len = plain[0] as usize;
    if key_len > plain.len() - 1 {
        return Err(MppeKeyError::BadKeyLength(key_len));
    }
    plain.drain(..1);
    plain.truncate(key_len);
    Ok(plain)
}

/// Encrypt a key into a salted MPPE blob. `salt` must have its high bit
/// set (RFC 2548 requires it to mark the newer encryption scheme).
pub fn encrypt_mppe_key(
    secret: &[u8],
    request_authenticator: &[u8; 16],
    salt: [u8; 2],
    key: &[u8],
) -> Result<Vec<u8>, MppeKeyError> {
    if salt[0] & 0x80 == 0 {
        return Err(MppeKeyError::BadSalt);
    }

    let mut plain = Vec::with_capacity((key.len() + 1).next_multiple_of(BLOCK));
    plain.push(key.len() as u8);
    plain.extend_from_slice(key);
    while plain.len() % BLOCK != 0 {
        plain.push(0);
    }

    let mut out = Vec::with_capacity(2 + plain.len());
    out.extend_from_slice(&salt);
    let mut prev = md5_cat(&[secret, request_authenticator, &salt]);
    for block in plain.chunks(BLOCK) {
        let start = out.len();
        for (p, b) in block.iter().zip(prev.iter()) {
            out.push(p ^ b);
        }
        prev = md5_cat(&[secret, &out[start..]]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_16_octet_key() {
        let secret = b"radius-secret";
        let auth = [0x42; 16];
        let key: Vec<u8> = (0..16).collect();
        let blob = encrypt_mppe_key(secret, &auth, [0x80, 0x01], &key).unwrap();
        assert_eq!(blob.len(), 2 + 32); // length octet forces a second block
        assert_eq!(decrypt_mppe_key(secret, &auth, &blob).unwrap(), key);
    }

    #[test]
    fn round_trip_32_octet_key() {
        let secret = b"radius-secret";
        let auth = [0x01; 16];
        let key = vec![0xee; 32];
        let blob = encrypt_mppe_key(secret, &auth, [0xff, 0xff], &key).unwrap();
        assert_eq!(decrypt_mppe_key(secret, &auth, &blob).unwrap(), key);
    }

    #[test]
    fn wrong_secret_yields_garbage_or_error() {
        let auth = [0x42; 16];
        let key = vec![0x55; 16];
        let blob = encrypt_mppe_key(b"right", &auth, [0x80, 0x00], &key).unwrap();
        match decrypt_mppe_key(b"wrong", &auth, &blob) {
            Ok(decrypted) => assert_ne!(decrypted, key),
            Err(MppeKeyError::BadKeyLength(_)) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn malformed_blobs_rejected() {
        let auth = [0u8; 16];
        assert!(matches!(
            decrypt_mppe_key(b"s", &auth, &[0x80]),
            Err(MppeKeyError::TooShort(1))
        ));
        assert!(matches!(
            decrypt_mppe_key(b"s", &auth, &[0x80, 0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17]),
            Err(MppeKeyError::BadBlocking(17))
        ));
        assert!(matches!(
            decrypt_mppe_key(b"s", &auth, &[0x00, 0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(MppeKeyError::BadSalt)
        ));
    }

    #[test]
    fn encrypt_requires_marked_salt() {
        assert!(matches!(
            encrypt_mppe_key(b"s", &[0u8; 16], [0x00, 0x01], &[1, 2, 3]),
            Err(MppeKeyError::BadSalt)
        ));
    }
}
