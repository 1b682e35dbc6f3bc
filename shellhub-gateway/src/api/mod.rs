pub mod auth;
pub mod connection;
pub mod devices;
pub mod info;
pub mod lookup;
pub mod namespaces;
pub mod sessions;
pub mod sshkeys;
pub mod tags;

use crate::GwState;

pub fn make_router(state: GwState) -> axum::Router<()> {
    axum::Router::new()
        // Public surface.
        .route("/api/info", axum::routing::get(info::get_info))
        .route("/api/devices/auth", axum::routing::post(auth::auth_device))
        .route("/api/login", axum::routing::post(auth::login))
        .route("/api/auth/ssh/sign", axum::routing::post(auth::sign_challenge))
        // Agent uplink.
        .route("/ssh/connection", axum::routing::get(connection::connect))
        // Operator surface exercised by the core.
        .route("/api/devices", axum::routing::get(devices::list))
        .route(
            "/api/devices/{uid}",
            axum::routing::get(devices::get)
                .patch(devices::rename)
                .delete(devices::delete),
        )
        .route("/api/devices/{uid}/{status}", axum::routing::patch(devices::set_status))
        .route("/api/namespace", axum::routing::get(namespaces::get_own))
        .route("/api/namespaces/members", axum::routing::post(namespaces::add_member))
        .route(
            "/api/namespaces/members/{user_id}",
            axum::routing::patch(namespaces::update_member).delete(namespaces::remove_member),
        )
        .route("/api/tags", axum::routing::get(tags::list).post(tags::create))
        .route("/api/tags/{name}", axum::routing::delete(tags::delete))
        .route(
            "/api/tags/{name}/devices/{uid}",
            axum::routing::post(tags::push_to_device).delete(tags::pull_from_device),
        )
        .route(
            "/api/sshkeys/public-keys",
            axum::routing::get(sshkeys::list).post(sshkeys::create),
        )
        .route(
            "/api/sshkeys/public-keys/{fingerprint}",
            axum::routing::put(sshkeys::update).delete(sshkeys::delete),
        )
        // Internal surface consumed by collaborators.
        .route("/internal/devices/{uid}", axum::routing::get(lookup::get_device))
        .route("/internal/lookup", axum::routing::get(lookup::lookup))
        .route("/internal/auth/device", axum::routing::get(lookup::auth_device_check))
        .route("/internal/sessions", axum::routing::post(sessions::create))
        .route("/internal/sessions/{uid}/finish", axum::routing::post(sessions::finish))
        .route(
            "/internal/sessions/{uid}/keepalive",
            axum::routing::post(sessions::keepalive),
        )
        .route(
            "/internal/sessions/reauthorize",
            axum::routing::post(sessions::reauthorize),
        )
        .route(
            "/internal/sshkeys/public-keys/evaluate/{fingerprint}/{username}",
            axum::routing::post(sshkeys::evaluate),
        )
        .with_state(state)
}
