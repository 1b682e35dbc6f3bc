use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use shellhub_registry::{AcceptabilityMode, Device, DeviceListQuery, DeviceSortBy, DeviceStatus, Role, SortOrder};

use crate::GwState;
use crate::extract::UserClaims;
use crate::http::HttpError;

fn role_of(claims: &shellhub_identity::token::Claims) -> Result<Role, HttpError> {
    claims
        .role
        .as_deref()
        .unwrap_or_default()
        .parse()
        .map_err(|_| HttpError::forbidden().msg("token carries no usable role"))
}

/// Observers can look, everyone above can act.
fn require_operator(claims: &shellhub_identity::token::Claims) -> Result<Role, HttpError> {
    let role = role_of(claims)?;
    if role.dominates(Role::Observer) {
        Ok(role)
    } else {
        Err(HttpError::forbidden().msg("insufficient role"))
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub filter: Option<String>,
    pub sort_by: Option<String>,
    pub order: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

pub(crate) async fn list(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Device>>, HttpError> {
    let status = query.status.as_deref().map(str::parse::<DeviceStatus>).transpose()?;

    let list_query = DeviceListQuery {
        status,
        name_contains: query.filter,
        sort_by: match query.sort_by.as_deref() {
            Some("last_seen") => DeviceSortBy::LastSeen,
            _ => DeviceSortBy::Name,
        },
        order: match query.order.as_deref() {
            Some("desc") => SortOrder::Desc,
            _ => SortOrder::Asc,
        },
        page: query.page.unwrap_or(1),
        per_page: query.per_page.unwrap_or(100),
    };

    let (devices, _total) = state
        .store
        .device_list(&claims.tenant, list_query, AcceptabilityMode::FromRemoved)
        .await?;

    Ok(Json(devices))
}

pub(crate) async fn get(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Path(uid): Path<String>,
) -> Result<Json<Device>, HttpError> {
    let device = state.store.device_get(&claims.tenant, &uid).await?;
    Ok(Json(device))
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

pub(crate) async fn rename(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Path(uid): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Result<Json<Device>, HttpError> {
    require_operator(&claims)?;

    let device = state.store.device_rename(&claims.tenant, &uid, &request.name).await?;
    Ok(Json(device))
}

pub(crate) async fn set_status(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Path((uid, status)): Path<(String, String)>,
) -> Result<Json<Device>, HttpError> {
    require_operator(&claims)?;

    let status: DeviceStatus = status.parse()?;

    if status == DeviceStatus::Removed {
        return Err(HttpError::bad_request().msg("tombstones are produced by deletion"));
    }

    let device = state.store.device_set_status(&claims.tenant, &uid, status).await?;
    Ok(Json(device))
}

pub(crate) async fn delete(
    State(state): State<GwState>,
    UserClaims(claims): UserClaims,
    Path(uid): Path<String>,
) -> Result<(), HttpError> {
    require_operator(&claims)?;

    state.store.device_delete(&claims.tenant, &uid).await?;
    Ok(())
}
