//! crypt(3)-style password verification.
//!
//! The agent authenticates local logins against `/etc/shadow` entries or the
//! configured single-user hash; both use the modular crypt format. Supported
//! variants: `$1$` (md5-crypt), `$apr1$` (Apache md5-crypt), `$5$`
//! (sha256-crypt), `$6$` (sha512-crypt) and `$2a/2b/2y$` (bcrypt).

use md5::{Digest as _, Md5};

/// Verifies `candidate` against a modular-crypt hash specification.
///
/// Unknown or malformed specifications verify false.
pub fn verify(hash_spec: &str, candidate: &str) -> bool {
    if let Some(rest) = hash_spec.strip_prefix("$apr1$") {
        return verify_apr1(rest, hash_spec, candidate);
    }

    if hash_spec.starts_with("$1$") {
        return pwhash::md5_crypt::verify(candidate, hash_spec);
    }

    if hash_spec.starts_with("$5$") {
        return pwhash::sha256_crypt::verify(candidate, hash_spec);
    }

    if hash_spec.starts_with("$6$") {
        return pwhash::sha512_crypt::verify(candidate, hash_spec);
    }

    if hash_spec.starts_with("$2a$") || hash_spec.starts_with("$2b$") || hash_spec.starts_with("$2y$") {
        return pwhash::bcrypt::verify(candidate, hash_spec);
    }

    false
}

/// Hashes a password with sha512-crypt and a random salt; used when seeding
/// local accounts.
pub fn hash_sha512(password: &str) -> Result<String, pwhash::error::Error> {
    pwhash::sha512_crypt::hash(password)
}

fn verify_apr1(salt_and_hash: &str, full_spec: &str, candidate: &str) -> bool {
    let Some((salt, _)) = salt_and_hash.split_once('$') else {
        return false;
    };

    apr1_crypt(candidate.as_bytes(), salt.as_bytes()) == full_spec
}

/// Apache variant of the md5-crypt algorithm: identical to `$1$` except for
/// the magic string. 1000 digest rounds over password, salt and the running
/// digest.
pub fn apr1_crypt(password: &[u8], salt: &[u8]) -> String {
    const MAGIC: &[u8] = b"$apr1$";

    // Salt is at most 8 characters, terminated by '$'.
    let salt = &salt[..salt.len().min(8)];

    let alternate = {
        let mut ctx = Md5::new();
        ctx.update(password);
        ctx.update(salt);
        ctx.update(password);
        ctx.finalize()
    };

    let mut ctx = Md5::new();
    ctx.update(password);
    ctx.update(MAGIC);
    ctx.update(salt);

    let mut remaining = password.len();
    while remaining > 0 {
        let take = remaining.min(16);
        ctx.update(&alternate[..take]);
        remaining -= take;
    }

    let mut length_bits = password.len();
    while length_bits != 0 {
        if length_bits & 1 == 1 {
            ctx.update([0u8]);
        } else {
            ctx.update(&password[..1]);
        }
        length_bits >>= 1;
    }

    let mut digest = ctx.finalize();

    for round in 0..1000 {
        let mut ctx = Md5::new();

        if round & 1 == 1 {
            ctx.update(password);
        } else {
            ctx.update(digest.as_slice());
        }

        if round % 3 != 0 {
            ctx.update(salt);
        }

        if round % 7 != 0 {
            ctx.update(password);
        }

        if round & 1 == 1 {
            ctx.update(digest.as_slice());
        } else {
            ctx.update(password);
        }

        digest = ctx.finalize();
    }

    let mut encoded = String::with_capacity(22);
    for (a, b, c) in [(0, 6, 12), (1, 7, 13), (2, 8, 14), (3, 9, 15), (4, 10, 5)] {
        let value = (u32::from(digest[a]) << 16) | (u32::from(digest[b]) << 8) | u32::from(digest[c]);
        to64(&mut encoded, value, 4);
    }
    to64(&mut encoded, u32::from(digest[11]), 2);

    format!(
        "$apr1${}${}",
        String::from_utf8_lossy(salt),
        encoded
    )
}

fn to64(out: &mut String, mut value: u32, chars: usize) {
    const ALPHABET: &[u8] = b"./0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

    for _ in 0..chars {
        out.push(char::from(ALPHABET[(value & 0x3f) as usize]));
        value >>= 6;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    use rstest::rstest;

    #[test]
    fn apr1_matches_htpasswd() {
        // Canonical htpasswd vector.
        assert_eq!(
            apr1_crypt(b"myPassword", b"r31....."),
            "$apr1$r31.....$HqJZimcKQFAMYayBlzkrA/"
        );
    }

    #[rstest]
    #[case::md5(pwhash::md5_crypt::hash("password").unwrap())]
    #[case::sha256(pwhash::sha256_crypt::hash("password").unwrap())]
    #[case::sha512(pwhash::sha512_crypt::hash("password").unwrap())]
    #[case::bcrypt(pwhash::bcrypt::hash("password").unwrap())]
    fn crypt_variants_verify(#[case] hash_spec: String) {
        assert!(verify(&hash_spec, "password"));
        assert!(!verify(&hash_spec, "wrong"));
    }

    #[test]
    fn apr1_spec_dispatch() {
        assert!(verify("$apr1$r31.....$HqJZimcKQFAMYayBlzkrA/", "myPassword"));
        assert!(!verify("$apr1$r31.....$HqJZimcKQFAMYayBlzkrA/", "wrong"));
    }

    #[test]
    fn unknown_prefixes_verify_false() {
        assert!(!verify("$9$whatever", "password"));
        assert!(!verify("plaintext", "plaintext"));
        assert!(!verify("$apr1$broken", "password"));
    }
}
