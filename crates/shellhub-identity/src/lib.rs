//! Device identity and the cryptographic plumbing shared by the gateway and
//! the agent: RSA keypairs, legacy fingerprints, RS256 tokens, crypt(3)
//! password verification and the challenge co-signing used for public-key
//! SSH authentication.

pub mod challenge;
pub mod crypt;
pub mod fingerprint;
pub mod keys;
pub mod token;

pub use picky::key::{PrivateKey, PublicKey};

use serde::Serialize;
use sha2::{Digest as _, Sha256};

/// The immutable tuple a device UID is derived from.
///
/// Serialization order is part of the contract: two processes deriving the
/// UID for the same tuple must agree byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceIdentity<'a> {
    pub mac: &'a str,
    pub hostname: &'a str,
    pub fingerprint: &'a str,
    pub tenant: &'a str,
}

/// Stable device UID: SHA-256 over the structural encoding of the identity
/// tuple, lowercase hex.
pub fn device_uid(identity: &DeviceIdentity<'_>) -> String {
    let encoded = serde_json::to_vec(identity).expect("identity tuple serialization is infallible");
    hex::encode(Sha256::digest(encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn uid_is_stable() {
        let identity = DeviceIdentity {
            mac: "02:42:ac:11:00:02",
            hostname: "dev01",
            fingerprint: "aa:bb",
            tenant: "00000000-0000-4000-0000-000000000000",
        };

        assert_eq!(device_uid(&identity), device_uid(&identity));
        assert_eq!(device_uid(&identity).len(), 64);
    }

    proptest! {
        #[test]
        fn distinct_tuples_produce_distinct_uids(
            mac_a in "[0-9a-f:]{1,17}",
            mac_b in "[0-9a-f:]{1,17}",
            hostname in "[a-z0-9-]{1,32}",
        ) {
            let a = DeviceIdentity { mac: &mac_a, hostname: &hostname, fingerprint: "fp", tenant: "t" };
            let b = DeviceIdentity { mac: &mac_b, hostname: &hostname, fingerprint: "fp", tenant: "t" };

            if mac_a != mac_b {
                prop_assert_ne!(device_uid(&a), device_uid(&b));
            } else {
                prop_assert_eq!(device_uid(&a), device_uid(&b));
            }
        }
    }
}
