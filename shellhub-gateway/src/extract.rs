use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use shellhub_identity::token::{Claims, TokenKind};

use crate::GwState;
use crate::http::HttpError;

fn bearer_token(parts: &Parts) -> Result<&str, HttpError> {
    parts
        .headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| HttpError::unauthorized().msg("missing bearer token"))
}

fn validate(state: &GwState, token: &str) -> Result<Claims, HttpError> {
    let claims = state
        .provisioner_key
        .verify(token)
        .map_err(HttpError::unauthorized().err())?;

    if let Some(cached) = state.token_cache.get(claims.jti) {
        return Ok(cached);
    }

    state.token_cache.put(claims.clone());

    Ok(claims)
}

/// Claims of an authenticated device.
#[derive(Clone)]
pub struct DeviceClaims(pub Claims);

impl FromRequestParts<GwState> for DeviceClaims {
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &GwState) -> Result<Self, Self::Rejection> {
        let claims = validate(state, bearer_token(parts)?)?;

        if claims.kind != TokenKind::Device {
            return Err(HttpError::forbidden().msg("token not allowed (expected DEVICE)"));
        }

        Ok(Self(claims))
    }
}

/// Claims of an authenticated user; membership is re-checked against the
/// store when the token is not cached (the revocation path).
#[derive(Clone)]
pub struct UserClaims(pub Claims);

impl FromRequestParts<GwState> for UserClaims {
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &GwState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)?;

        let claims = state
            .provisioner_key
            .verify(token)
            .map_err(HttpError::unauthorized().err())?;

        if claims.kind != TokenKind::User {
            return Err(HttpError::forbidden().msg("token not allowed (expected USER)"));
        }

        if state.token_cache.get(claims.jti).is_none() {
            // Not cached: either a fresh token or one that was revoked.
            // Either way, membership must still hold.
            let namespace = state.store.namespace_get(&claims.tenant).await?;

            let member = namespace
                .member(&claims.sub)
                .ok_or_else(|| HttpError::unauthorized().msg("not a member of this namespace"))?;

            if claims.role.as_deref() != Some(member.role.to_string().as_str()) {
                return Err(HttpError::unauthorized().msg("role changed, please re-authenticate"));
            }

            state.token_cache.put(claims.clone());
        }

        Ok(Self(claims))
    }
}
