#[macro_use]
extern crate tracing;

pub mod api;
pub mod config;
pub mod extract;
pub mod http;
pub mod log;
pub mod session;
pub mod sshd;
pub mod token;
pub mod tunnel;
pub mod ws;

use std::sync::Arc;

use shellhub_registry::Store;
use shellhub_task::ShutdownSignal;

use crate::config::ConfHandle;
use crate::session::SessionMessageSender;
use crate::token::{DeviceIdentityCache, ProvisionerKey, TokenCache};
use crate::tunnel::TunnelTable;

#[derive(Clone)]
pub struct GwState {
    pub conf_handle: ConfHandle,
    pub store: Arc<dyn Store>,
    pub provisioner_key: Arc<ProvisionerKey>,
    pub token_cache: Arc<TokenCache>,
    pub identity_cache: Arc<DeviceIdentityCache>,
    pub tunnels: TunnelTable,
    pub sessions: SessionMessageSender,
    pub ssh_host_key: Arc<russh_keys::key::KeyPair>,
    pub shutdown_signal: ShutdownSignal,
}

pub fn make_http_service(state: GwState) -> axum::Router<()> {
    trace!("make HTTP service");
    api::make_router(state)
}
