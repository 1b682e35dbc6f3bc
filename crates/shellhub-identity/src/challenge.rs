//! Challenge co-signing for public-key SSH authentication.
//!
//! The agent builds the canonical challenge for the login it is asked to
//! authenticate, the gateway signs it with the companion private key bound
//! to the offered key's fingerprint, and the agent verifies the signature
//! against the offered key itself.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use picky::hash::HashAlgorithm;
use picky::key::{PrivateKey, PublicKey};
use picky::signature::SignatureAlgorithm;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// Canonical challenge payload. Field order is part of the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge<'a> {
    pub username: &'a str,
    pub namespace: &'a str,
}

#[derive(Debug, thiserror::Error)]
pub enum ChallengeError {
    #[error("signing failed")]
    Signing { source: picky::signature::SignatureError },
    #[error("signature is not valid base64")]
    Encoding {
        #[from]
        source: base64::DecodeError,
    },
}

/// Canonical byte encoding of the challenge.
pub fn canonical(username: &str, namespace: &str) -> Vec<u8> {
    serde_json::to_vec(&Challenge { username, namespace }).expect("challenge serialization is infallible")
}

/// SHA-256 digest of the canonical challenge, hex encoded. Used as the
/// fingerprint-auth hash.
pub fn hash_fingerprint_auth(username: &str, namespace: &str) -> String {
    hex::encode(Sha256::digest(canonical(username, namespace)))
}

/// PKCS1v15 signature over SHA-256 of the given data, base64 encoded.
pub fn sign(key: &PrivateKey, data: &[u8]) -> Result<String, ChallengeError> {
    let signature = SignatureAlgorithm::RsaPkcs1v15(HashAlgorithm::SHA2_256)
        .sign(data, key)
        .map_err(|source| ChallengeError::Signing { source })?;

    Ok(BASE64.encode(signature))
}

/// Verifies a base64 signature produced by [`sign`] against `key`.
pub fn verify(key: &PublicKey, data: &[u8], signature_b64: &str) -> Result<bool, ChallengeError> {
    let signature = BASE64.decode(signature_b64)?;

    let verified = SignatureAlgorithm::RsaPkcs1v15(HashAlgorithm::SHA2_256)
        .verify(key, data, &signature)
        .is_ok();

    Ok(verified)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn canonical_form_is_stable() {
        assert_eq!(
            canonical("root", "testspace"),
            br#"{"username":"root","namespace":"testspace"}"#
        );
    }

    #[test]
    fn sign_then_verify() {
        let key = crate::keys::generate_rsa_keypair().unwrap();
        let public = key.to_public_key().unwrap();

        let data = canonical("root", "testspace");
        let signature = sign(&key, &data).unwrap();

        assert!(verify(&public, &data, &signature).unwrap());

        // A different challenge must not verify.
        let other = canonical("admin", "testspace");
        assert!(!verify(&public, &other, &signature).unwrap());

        // Nor a signature from another key.
        let stranger = crate::keys::generate_rsa_keypair().unwrap();
        let forged = sign(&stranger, &data).unwrap();
        assert!(!verify(&public, &data, &forged).unwrap());
    }

    #[test]
    fn fingerprint_auth_hash_is_hex_sha256() {
        let digest = hash_fingerprint_auth("root", "testspace");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, hash_fingerprint_auth("root", "testspace"));
    }
}
