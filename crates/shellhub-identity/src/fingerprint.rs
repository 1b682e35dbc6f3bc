//! Legacy MD5 fingerprints over the canonical SSH wire encoding of a public
//! key, plus the wire-form RSA parser used when a key arrives over SSH.

use md5::{Digest as _, Md5};
use num_bigint_dig::BigUint;
use picky::key::PublicKey;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("truncated SSH wire encoding")]
    Truncated,
    #[error("unsupported key algorithm {algorithm}")]
    UnsupportedAlgorithm { algorithm: String },
    #[error("invalid RSA components")]
    InvalidComponents { source: picky::key::KeyError },
}

/// Legacy fingerprint: MD5 of the wire form, lowercase hex bytes joined by
/// ':'. This is the primary key of registered public keys.
pub fn legacy(wire: &[u8]) -> String {
    let digest = Md5::digest(wire);
    let hex_bytes: Vec<String> = digest.iter().map(|byte| format!("{byte:02x}")).collect();
    hex_bytes.join(":")
}

/// Parses the canonical `ssh-rsa` wire encoding (`string "ssh-rsa", mpint e,
/// mpint n`) into a verification key.
pub fn rsa_from_wire(wire: &[u8]) -> Result<PublicKey, WireError> {
    let mut cursor = wire;

    let algorithm = read_string(&mut cursor)?;
    if algorithm != b"ssh-rsa" {
        return Err(WireError::UnsupportedAlgorithm {
            algorithm: String::from_utf8_lossy(algorithm).into_owned(),
        });
    }

    let e = read_string(&mut cursor)?;
    let n = read_string(&mut cursor)?;

    Ok(PublicKey::from_rsa_components(
        &BigUint::from_bytes_be(n),
        &BigUint::from_bytes_be(e),
    ))
}

/// Builds the canonical `ssh-rsa` wire encoding from a verification key's
/// components.
pub fn rsa_to_wire(e: &[u8], n: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity(4 + 7 + 8 + e.len() + n.len() + 2);
    write_string(&mut wire, b"ssh-rsa");
    write_mpint(&mut wire, e);
    write_mpint(&mut wire, n);
    wire
}

fn read_string<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8], WireError> {
    if cursor.len() < 4 {
        return Err(WireError::Truncated);
    }

    let (length_bytes, rest) = cursor.split_at(4);
    let length = u32::from_be_bytes([length_bytes[0], length_bytes[1], length_bytes[2], length_bytes[3]]) as usize;

    if rest.len() < length {
        return Err(WireError::Truncated);
    }

    let (value, rest) = rest.split_at(length);
    *cursor = rest;

    Ok(value)
}

fn write_string(out: &mut Vec<u8>, value: &[u8]) {
    out.extend_from_slice(&u32::try_from(value.len()).expect("wire field length fits in u32").to_be_bytes());
    out.extend_from_slice(value);
}

fn write_mpint(out: &mut Vec<u8>, value: &[u8]) {
    // mpint: strip leading zeroes, then prepend one if the high bit is set.
    let value = {
        let mut slice = value;
        while let [0, rest @ ..] = slice {
            slice = rest;
        }
        slice
    };

    if value.first().is_some_and(|first| first & 0x80 != 0) {
        let mut padded = Vec::with_capacity(value.len() + 1);
        padded.push(0);
        padded.extend_from_slice(value);
        write_string(out, &padded);
    } else {
        write_string(out, value);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn known_md5_vectors() {
        assert_eq!(
            legacy(b""),
            "d4:1d:8c:d9:8f:00:b2:04:e9:80:09:98:ec:f8:42:7e"
        );
        assert_eq!(
            legacy(b"abc"),
            "90:01:50:98:3c:d2:4f:b0:d6:96:3f:7d:28:e1:7f:72"
        );
    }

    #[test]
    fn mpint_encoding_is_normalized() {
        // Leading zeroes are stripped, and a set high bit gets one back.
        let wire = rsa_to_wire(&[0x01, 0x00, 0x01], &[0x00, 0x00, 0xC2, 0x17]);

        let expected: Vec<u8> = [
            &[0, 0, 0, 7][..],
            b"ssh-rsa",
            &[0, 0, 0, 3, 0x01, 0x00, 0x01],
            &[0, 0, 0, 3, 0x00, 0xC2, 0x17],
        ]
        .concat();

        assert_eq!(wire, expected);
    }

    #[test]
    fn well_formed_wire_parses() {
        let mut modulus = vec![0x80u8];
        modulus.extend(std::iter::repeat(0x5A).take(255));

        let wire = rsa_to_wire(&[0x01, 0x00, 0x01], &modulus);
        rsa_from_wire(&wire).unwrap();
    }

    #[test]
    fn truncated_wire_is_rejected() {
        assert!(matches!(rsa_from_wire(&[0, 0, 0, 7, b's']), Err(WireError::Truncated)));
    }

    #[test]
    fn non_rsa_keys_are_rejected() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&[0, 0, 0, 11]);
        wire.extend_from_slice(b"ssh-ed25519");

        assert!(matches!(
            rsa_from_wire(&wire),
            Err(WireError::UnsupportedAlgorithm { .. })
        ));
    }
}
