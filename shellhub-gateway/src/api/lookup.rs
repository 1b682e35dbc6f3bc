//! Internal lookup surface: device resolution and the auth_request-style
//! device token check.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use shellhub_registry::Device;

use crate::GwState;
use crate::extract::DeviceClaims;
use crate::http::HttpError;

pub(crate) async fn get_device(
    State(state): State<GwState>,
    Path(uid): Path<String>,
) -> Result<Json<Device>, HttpError> {
    let device = state.store.device_get_by_uid(&uid).await?;
    Ok(Json(device))
}

#[derive(Debug, Deserialize)]
pub struct LookupQuery {
    /// Namespace name.
    pub domain: String,
    /// Device name.
    pub name: String,
}

pub(crate) async fn lookup(
    State(state): State<GwState>,
    Query(query): Query<LookupQuery>,
) -> Result<Json<Device>, HttpError> {
    let device = state.store.device_lookup(&query.domain, &query.name).await?;

    let conf = state.conf_handle.get_conf();
    state.tunnels.cache_resolution(
        &query.domain,
        &query.name,
        &device.uid,
        &device.tenant_id,
        conf.resolution_cache_ttl,
    );

    Ok(Json(device))
}

/// Returns 200 iff the bearer token is a valid device token; meant for
/// auth_request-style delegation by front proxies.
pub(crate) async fn auth_device_check(DeviceClaims(_claims): DeviceClaims) -> &'static str {
    "OK"
}
