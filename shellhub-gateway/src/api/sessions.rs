//! Internal session surface consumed by collaborators (and by agents for
//! the periodic reauthorization of live sessions).

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use shellhub_registry::{Session, SessionInput, SessionType};

use crate::GwState;
use crate::extract::DeviceClaims;
use crate::http::HttpError;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub uid: String,
    pub device_uid: String,
    pub tenant_id: String,
    pub username: String,
    pub ip_address: String,
    #[serde(rename = "type")]
    pub ty: SessionType,
}

pub(crate) async fn create(
    State(state): State<GwState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<Session>, HttpError> {
    let session = state
        .sessions
        .new_session(SessionInput {
            uid: request.uid,
            device_uid: request.device_uid,
            tenant_id: request.tenant_id,
            username: request.username,
            ip_address: request.ip_address,
            ty: request.ty,
        })
        .await
        .map_err(HttpError::internal().err())?;

    Ok(Json(session))
}

pub(crate) async fn finish(State(state): State<GwState>, Path(uid): Path<String>) -> Result<(), HttpError> {
    state.sessions.close(&uid).await.map_err(HttpError::internal().err())?;
    Ok(())
}

pub(crate) async fn keepalive(State(state): State<GwState>, Path(uid): Path<String>) -> Result<(), HttpError> {
    state
        .sessions
        .keepalive(&uid)
        .await
        .map_err(HttpError::internal().err())?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct ReauthorizeRequest {
    pub ids: Vec<String>,
}

/// Agents re-post their live session ids every few minutes so the registry
/// can reconcile sessions the gateway lost track of.
pub(crate) async fn reauthorize(
    State(state): State<GwState>,
    DeviceClaims(_claims): DeviceClaims,
    Json(request): Json<ReauthorizeRequest>,
) -> Result<(), HttpError> {
    for uid in &request.ids {
        if let Err(error) = state.sessions.keepalive(uid).await {
            debug!(session = %uid, %error, "Reauthorized session is unknown");
        }
    }

    Ok(())
}
