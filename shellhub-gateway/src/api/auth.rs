//! Device and user authentication, plus the challenge co-signing endpoint.

use axum::Json;
use axum::extract::State;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use shellhub_identity::DeviceIdentity;
use shellhub_registry::{DeviceAuthInput, DeviceInfo};

use crate::GwState;
use crate::extract::DeviceClaims;
use crate::http::HttpError;

#[derive(Debug, Deserialize)]
pub struct DeviceAuthRequest {
    pub tenant_id: String,
    pub hostname: String,
    pub identity: IdentityDto,
    /// Legacy fingerprint of the device public key, computed by the agent
    /// over the canonical SSH wire encoding.
    pub fingerprint: String,
    /// PEM of the device public key.
    pub public_key: String,
    #[serde(default)]
    pub info: DeviceInfo,
}

#[derive(Debug, Deserialize)]
pub struct IdentityDto {
    pub mac: String,
}

#[derive(Debug, Serialize)]
pub struct DeviceAuthResponse {
    pub uid: String,
    pub token: String,
    pub name: String,
    pub namespace: String,
}

pub(crate) async fn auth_device(
    State(state): State<GwState>,
    Json(request): Json<DeviceAuthRequest>,
) -> Result<Json<DeviceAuthResponse>, HttpError> {
    let identity = DeviceIdentity {
        mac: &request.identity.mac,
        hostname: &request.hostname,
        fingerprint: &request.fingerprint,
        tenant: &request.tenant_id,
    };
    let uid = shellhub_identity::device_uid(&identity);

    // The short-TTL identity cache spares a store hit on re-authentication;
    // on a miss, the namespace must exist before anything is written.
    let namespace_name = match state.identity_cache.get(&uid) {
        Some((_, namespace)) => namespace,
        None => {
            state
                .store
                .namespace_get(&request.tenant_id)
                .await
                .map_err(|_| HttpError::not_found().msg("namespace not found"))?
                .name
        }
    };

    let device = state
        .store
        .device_upsert_by_identity(DeviceAuthInput {
            uid: uid.clone(),
            tenant_id: request.tenant_id.clone(),
            mac: request.identity.mac,
            hostname: request.hostname,
            public_key_pem: request.public_key,
            info: request.info,
        })
        .await?;

    let token = state
        .provisioner_key
        .sign_device(&device.uid, &request.tenant_id)
        .map_err(HttpError::internal().err())?;

    let conf = state.conf_handle.get_conf();
    state
        .identity_cache
        .put(&device.uid, &device.name, &namespace_name, conf.resolution_cache_ttl);

    debug!(device = %device.uid, namespace = %namespace_name, "Device authenticated");

    Ok(Json(DeviceAuthResponse {
        uid: device.uid,
        token,
        name: device.name,
        namespace: namespace_name,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Username or email.
    pub identifier: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub user_id: String,
    pub tenant: String,
    pub role: String,
}

pub(crate) async fn login(
    State(state): State<GwState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, HttpError> {
    let user = state
        .store
        .user_get_by_identifier(&request.identifier)
        .await
        .map_err(|_| HttpError::unauthorized().msg("bad credentials"))?;

    if !shellhub_identity::crypt::verify(&user.password_hash, &request.password) {
        return Err(HttpError::unauthorized().msg("bad credentials"));
    }

    let primary = state.store.user_primary_namespace(&user.id).await.map_err(|_| {
        HttpError::forbidden().msg("user does not belong to any namespace")
    })?;

    let role = primary.role.to_string();
    let token = state
        .provisioner_key
        .sign_user(&user.id, &primary.tenant_id, &role)
        .map_err(HttpError::internal().err())?;

    Ok(Json(LoginResponse {
        token,
        user_id: user.id,
        tenant: primary.tenant_id,
        role,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SignRequest {
    /// Fingerprint the agent observed on the offered key.
    pub fingerprint: String,
    /// Base64 of the canonical challenge bytes.
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct SignResponse {
    pub signature: String,
}

/// Co-signs a challenge with the companion private key bound to the given
/// fingerprint. Only authenticated devices may ask, and only for keys
/// registered in their own tenant.
pub(crate) async fn sign_challenge(
    State(state): State<GwState>,
    DeviceClaims(claims): DeviceClaims,
    Json(request): Json<SignRequest>,
) -> Result<Json<SignResponse>, HttpError> {
    let companion = state
        .store
        .companion_key_get(&claims.tenant, &request.fingerprint)
        .await
        .map_err(|_| HttpError::unauthorized().msg("unknown key fingerprint"))?;

    let data = base64::engine::general_purpose::STANDARD
        .decode(&request.data)
        .map_err(|_| HttpError::bad_request().msg("challenge data is not valid base64"))?;

    let private = shellhub_identity::keys::from_pem(&companion.private_pem)
        .map_err(HttpError::internal().err())?;

    let signature = shellhub_identity::challenge::sign(&private, &data).map_err(HttpError::internal().err())?;

    Ok(Json(SignResponse { signature }))
}
