use axum::Json;
use axum::extract::{Path, State};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use shellhub_registry::{PublicKeyFilter, PublicKeyInput, Role, SshPublicKey};

use crate::GwState;
use crate::extract::UserClaims;
use crate::http::HttpError;

fn require_admin(claims: &shellhub_identity::token::Claims) -> Result<(), HttpError> {
    let role: Role = claims
        .role
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(|_| HttpError::forbidden().msg("token carries no usable role"))?;

    // Key policy is an administrative concern.
    if role.dominates(Role::Operator) {
        Ok(())
    } else {
        Err(HttpError::forbidden().msg("insufficient role"))
    }
}

#[derive(Debug, Deserialize)]
pub struct PublicKeyRequest {
    /// Base64 of the OpenSSH authorized_keys line.
    pub data: String,
    pub name: String,
    #[serde(default)]
    pub username: String,
    pub filter: PublicKeyFilter,
}

impl PublicKeyRequest {
    fn into_input(self) -> Result<PublicKeyInput, HttpError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|_| HttpError::bad_request().msg("key data is not valid base64"))?;

        Ok(PublicKeyInput {
            data,
            name: self.name,
            username: self.username,
            filter: self.filter,
        })
    }
}

pub(crate) async fn list(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
) -> Result<Json<Vec<SshPublicKey>>, HttpError> {
    let keys = state.store.public_key_list(&claims.tenant).await?;
    Ok(Json(keys))
}

pub(crate) async fn create(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Json(request): Json<PublicKeyRequest>,
) -> Result<Json<SshPublicKey>, HttpError> {
    require_admin(&claims)?;

    let input = request.into_input()?;
    let key = state.store.public_key_create(&claims.tenant, input).await?;
    Ok(Json(key))
}

pub(crate) async fn update(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Path(fingerprint): Path<String>,
    Json(request): Json<PublicKeyRequest>,
) -> Result<Json<SshPublicKey>, HttpError> {
    require_admin(&claims)?;

    let input = request.into_input()?;
    let key = state.store.public_key_update(&claims.tenant, &fingerprint, input).await?;
    Ok(Json(key))
}

pub(crate) async fn delete(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Path(fingerprint): Path<String>,
) -> Result<(), HttpError> {
    require_admin(&claims)?;

    state.store.public_key_delete(&claims.tenant, &fingerprint).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct EvaluateRequest {
    pub tenant_id: String,
    pub device_uid: String,
}

#[derive(Debug, Serialize)]
pub struct EvaluateResponse {
    pub evaluate: bool,
}

/// Internal policy check: may this key authenticate this login against
/// this device?
pub(crate) async fn evaluate(
    State(state): State<GwState>,
    Path((fingerprint, username)): Path<(String, String)>,
    Json(request): Json<EvaluateRequest>,
) -> Result<Json<EvaluateResponse>, HttpError> {
    let evaluate = state
        .store
        .public_key_evaluate(&request.tenant_id, &fingerprint, &username, &request.device_uid)
        .await?;

    Ok(Json(EvaluateResponse { evaluate }))
}
