use axum::Json;
use axum::extract::State;
use russh_keys::PublicKeyBase64 as _;
use serde::Serialize;

use crate::GwState;

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    pub version: &'static str,
    /// Legacy fingerprint of the SSH host key, rotated per install.
    pub ssh_host_key_fingerprint: String,
    pub connected_devices: usize,
}

pub(crate) async fn get_info(State(state): State<GwState>) -> Json<InfoResponse> {
    let wire = state.ssh_host_key.public_key_bytes();

    Json(InfoResponse {
        version: env!("CARGO_PKG_VERSION"),
        ssh_host_key_fingerprint: shellhub_identity::fingerprint::legacy(&wire),
        connected_devices: state.tunnels.connected_count(),
    })
}
