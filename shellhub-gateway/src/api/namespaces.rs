use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use shellhub_registry::{Member, MemberStatus, Namespace, Role};
use time::OffsetDateTime;

use crate::GwState;
use crate::extract::UserClaims;
use crate::http::HttpError;

fn actor_role(claims: &shellhub_identity::token::Claims) -> Result<Role, HttpError> {
    claims
        .role
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(|_| HttpError::forbidden().msg("token carries no usable role"))
}

pub(crate) async fn get_own(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
) -> Result<Json<Namespace>, HttpError> {
    let namespace = state.store.namespace_get(&claims.tenant).await?;
    Ok(Json(namespace))
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: String,
    pub role: Role,
}

pub(crate) async fn add_member(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Json(request): Json<AddMemberRequest>,
) -> Result<Json<Namespace>, HttpError> {
    let inviter_role = actor_role(&claims)?;

    let member = Member {
        user_id: request.user_id,
        role: request.role,
        status: MemberStatus::Pending,
        added_at: OffsetDateTime::now_utc(),
        expires_at: None,
    };

    let namespace = state
        .store
        .namespace_add_member(&claims.tenant, member, inviter_role)
        .await?;

    Ok(Json(namespace))
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    pub role: Role,
}

pub(crate) async fn update_member(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Path(user_id): Path<String>,
    Json(request): Json<UpdateMemberRequest>,
) -> Result<Json<Namespace>, HttpError> {
    let actor = actor_role(&claims)?;

    let namespace = state
        .store
        .namespace_update_member_role(&claims.tenant, &user_id, request.role, actor)
        .await?;

    // The member's outstanding tokens carry the old role.
    state.token_cache.uncache_user(&claims.tenant, &user_id);

    Ok(Json(namespace))
}

pub(crate) async fn remove_member(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Path(user_id): Path<String>,
) -> Result<Json<Namespace>, HttpError> {
    let actor = actor_role(&claims)?;

    let namespace = state
        .store
        .namespace_remove_member(&claims.tenant, &user_id, actor)
        .await?;

    state.token_cache.uncache_user(&claims.tenant, &user_id);

    Ok(Json(namespace))
}
