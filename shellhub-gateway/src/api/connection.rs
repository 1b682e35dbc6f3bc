//! Agent uplink termination.
//!
//! The agent connects with its device token, the request is upgraded to a
//! WebSocket, and the resulting byte stream becomes the device's tunnel.

use axum::extract::ws::WebSocket;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use shellhub_identity::token::Claims;
use tunnel_proxy::{TunnelConfig, TunnelProxy};

use crate::GwState;
use crate::extract::DeviceClaims;
use crate::http::HttpError;
use crate::tunnel::TunnelKeepaliveTask;

pub(crate) async fn connect(
    State(state): State<GwState>,
    DeviceClaims(claims): DeviceClaims,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, HttpError> {
    // The advertised UID must match the token's subject.
    if let Some(advertised) = headers.get("X-Device-UID") {
        let advertised = advertised
            .to_str()
            .map_err(|_| HttpError::bad_request().msg("invalid X-Device-UID header"))?;

        if advertised != claims.sub {
            return Err(HttpError::forbidden().msg("X-Device-UID does not match the token"));
        }
    }

    // Only accepted (or at least known) devices get a tunnel.
    state
        .store
        .device_get(&claims.tenant, &claims.sub)
        .await
        .map_err(|_| HttpError::forbidden().msg("unknown device"))?;

    let response = ws.on_upgrade(move |ws| handle_uplink(state, claims, ws));

    Ok(response)
}

#[instrument(skip_all, fields(device = %claims.sub))]
async fn handle_uplink(state: GwState, claims: Claims, ws: WebSocket) {
    let uid = claims.sub.clone();

    let stream = crate::ws::websocket_compat(ws);
    let (reader, writer) = tokio::io::split(stream);

    let proxy = TunnelProxy::new(Box::new(reader), Box::new(writer)).with_config(TunnelConfig::initiator());
    let handle = proxy.handle();

    let (generation, displaced) = state.tunnels.register(&uid, handle.clone());

    if let Some(displaced) = displaced {
        // Last-writer-wins: the previous uplink observes EOF.
        info!("Displacing a previous tunnel for this device");
        displaced.close().await;
    }

    if let Err(error) = state.store.device_set_online(&uid, true).await {
        warn!(%error, "Couldn't mark device online");
    }

    let conf = state.conf_handle.get_conf();

    shellhub_task::spawn_task(
        TunnelKeepaliveTask {
            uid: uid.clone(),
            generation,
            handle,
            table: state.tunnels.clone(),
            store: state.store.clone(),
            interval: conf.keepalive_interval,
        },
        state.shutdown_signal.clone(),
    )
    .detach();

    info!("Tunnel established");

    match proxy.run().await {
        Ok(()) => info!("Tunnel closed"),
        Err(error) => warn!(error = format!("{error:#}"), "Tunnel failed"),
    }

    // The keepalive task owns unregistration (it observes the closed
    // engine), but make sure the device doesn't linger online if it went
    // down before the task even started.
    if state.tunnels.unregister(&uid, generation) {
        if let Err(error) = state.store.device_set_online(&uid, false).await {
            warn!(%error, "Couldn't mark device offline");
        }
    }
}
