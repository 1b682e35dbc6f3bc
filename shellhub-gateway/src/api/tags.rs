use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use shellhub_registry::{Role, Tag, TagTarget};

use crate::GwState;
use crate::extract::UserClaims;
use crate::http::HttpError;

fn require_operator(claims: &shellhub_identity::token::Claims) -> Result<(), HttpError> {
    let role: Role = claims
        .role
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(|_| HttpError::forbidden().msg("token carries no usable role"))?;

    if role.dominates(Role::Observer) {
        Ok(())
    } else {
        Err(HttpError::forbidden().msg("insufficient role"))
    }
}

pub(crate) async fn list(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
) -> Result<Json<Vec<Tag>>, HttpError> {
    let tags = state.store.tag_list(&claims.tenant).await?;
    Ok(Json(tags))
}

#[derive(Debug, Deserialize)]
pub struct CreateTagRequest {
    pub name: String,
}

pub(crate) async fn create(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Json(request): Json<CreateTagRequest>,
) -> Result<Json<Tag>, HttpError> {
    require_operator(&claims)?;

    let tag = state.store.tag_create(&claims.tenant, &request.name).await?;
    Ok(Json(tag))
}

pub(crate) async fn delete(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Path(name): Path<String>,
) -> Result<(), HttpError> {
    require_operator(&claims)?;

    state.store.tag_delete(&claims.tenant, &name).await?;
    Ok(())
}

pub(crate) async fn push_to_device(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Path((name, uid)): Path<(String, String)>,
) -> Result<(), HttpError> {
    require_operator(&claims)?;

    state
        .store
        .tag_push(&claims.tenant, &name, TagTarget::Device, &uid)
        .await?;
    Ok(())
}

pub(crate) async fn pull_from_device(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Path((name, uid)): Path<(String, String)>,
) -> Result<(), HttpError> {
    require_operator(&claims)?;

    state
        .store
        .tag_pull(&claims.tenant, &name, TagTarget::Device, Some(&uid))
        .await?;
    Ok(())
}
