//! RS256 access tokens for devices and users.

use core::fmt;
use std::str::FromStr;

use picky::jose::jws::RawJws;
use picky::key::{PrivateKey, PublicKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Clock skew tolerated when validating `exp`/`nbf`.
pub const LEEWAY_SECS: i64 = 60 * 5; // 5 minutes

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Device,
    User,
}

impl TokenKind {
    pub const fn content_type(self) -> &'static str {
        match self {
            TokenKind::Device => "DEVICE",
            TokenKind::User => "USER",
        }
    }
}

impl FromStr for TokenKind {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DEVICE" => Ok(TokenKind::Device),
            "USER" => Ok(TokenKind::User),
            _ => Err(TokenError::Malformed {
                reason: "unknown content type",
            }),
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.content_type())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Claims {
    /// Device UID or user id.
    pub sub: String,
    pub tenant: String,
    pub kind: TokenKind,
    /// Namespace role; only meaningful for user tokens.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub jti: Uuid,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

impl Claims {
    pub fn device(uid: impl Into<String>, tenant: impl Into<String>, validity_secs: i64) -> Self {
        Self::new(TokenKind::Device, uid.into(), tenant.into(), None, validity_secs)
    }

    pub fn user(
        user_id: impl Into<String>,
        tenant: impl Into<String>,
        role: impl Into<String>,
        validity_secs: i64,
    ) -> Self {
        Self::new(
            TokenKind::User,
            user_id.into(),
            tenant.into(),
            Some(role.into()),
            validity_secs,
        )
    }

    fn new(kind: TokenKind, sub: String, tenant: String, role: Option<String>, validity_secs: i64) -> Self {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();

        Self {
            sub,
            tenant,
            kind,
            role,
            jti: Uuid::new_v4(),
            iat: now,
            nbf: now,
            exp: now + validity_secs,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("token not valid yet")]
    NotYetValid,
    #[error("failed to verify token signature")]
    BadSignature { source: picky::jose::jws::JwsError },
    #[error("malformed token: {reason}")]
    Malformed { reason: &'static str },
    #[error("invalid JWS structure")]
    Jws {
        #[from]
        source: picky::jose::jws::JwsError,
    },
    #[error("invalid JWT structure")]
    Jwt {
        #[from]
        source: picky::jose::jwt::JwtError,
    },
    #[error("invalid claims")]
    InvalidClaims {
        #[from]
        source: serde_json::Error,
    },
    #[error("token signing failed")]
    Signing { source: picky::jose::jwt::JwtError },
}

/// Signs the claims with RS256, stamping the content type header.
pub fn sign(claims: &Claims, key: &PrivateKey) -> Result<String, TokenError> {
    use picky::jose::jws::JwsAlg;
    use picky::jose::jwt::CheckedJwtSig;

    let jwt = CheckedJwtSig::new_with_cty(JwsAlg::RS256, claims.kind.content_type(), claims);
    jwt.encode(key).map_err(|source| TokenError::Signing { source })
}

/// Verifies the signature and time bounds, returning the claims.
pub fn verify(token: &str, key: &PublicKey) -> Result<Claims, TokenError> {
    use picky::jose::jwt::{JwtDate, JwtSig, JwtValidator};

    let raw_jws = RawJws::decode(token)?;

    let jwt: JwtSig = raw_jws
        .verify(key)
        .map(JwtSig::from)
        .map_err(|source| TokenError::BadSignature { source })?;

    // Time bounds are checked by hand afterwards so expiry maps to its own
    // error kind.
    let timestamp_now = time::OffsetDateTime::now_utc().unix_timestamp();
    let now = JwtDate::new(timestamp_now);
    let lenient_validator = JwtValidator::strict(now)
        .not_before_check_optional()
        .expiration_check_optional();

    let claims: Claims = jwt.validate::<Claims>(&lenient_validator)?.state.claims;

    if claims.exp + LEEWAY_SECS <= timestamp_now {
        return Err(TokenError::Expired);
    }

    if claims.nbf - LEEWAY_SECS > timestamp_now {
        return Err(TokenError::NotYetValid);
    }

    Ok(claims)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn keypair() -> (PrivateKey, PublicKey) {
        let private = crate::keys::generate_rsa_keypair().unwrap();
        let public = private.to_public_key().unwrap();
        (private, public)
    }

    #[test]
    fn sign_verify_roundtrip() {
        let (private, public) = keypair();

        let claims = Claims::device("abcdef", "tenant-1", 3600);
        let token = sign(&claims, &private).unwrap();

        let verified = verify(&token, &public).unwrap();
        assert_eq!(verified, claims);
        assert_eq!(verified.kind, TokenKind::Device);
        assert!(verified.role.is_none());
    }

    #[test]
    fn user_tokens_carry_role() {
        let (private, public) = keypair();

        let claims = Claims::user("user-1", "tenant-1", "owner", 72 * 3600);
        let token = sign(&claims, &private).unwrap();

        let verified = verify(&token, &public).unwrap();
        assert_eq!(verified.role.as_deref(), Some("owner"));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let (private, public) = keypair();

        let mut claims = Claims::device("abcdef", "tenant-1", 0);
        claims.iat -= 7200;
        claims.nbf -= 7200;
        claims.exp -= 7200;

        let token = sign(&claims, &private).unwrap();
        assert!(matches!(verify(&token, &public), Err(TokenError::Expired)));
    }

    #[test]
    fn foreign_signatures_are_rejected() {
        let (private, _) = keypair();
        let (_, other_public) = keypair();

        let token = sign(&Claims::device("abcdef", "tenant-1", 3600), &private).unwrap();
        assert!(matches!(
            verify(&token, &other_public),
            Err(TokenError::BadSignature { .. })
        ));
    }

    #[test]
    fn garbage_is_malformed() {
        let (_, public) = keypair();
        assert!(verify("definitely-not-a-jwt", &public).is_err());
    }
}
