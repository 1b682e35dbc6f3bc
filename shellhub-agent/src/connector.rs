//! The outer reconnect loop and everything a live uplink spawns.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use parking_lot::Mutex;
use shellhub_task::TaskHandle;
use tunnel_proxy::{TunnelConfig, TunnelProxy};

use crate::client::ApiClient;
use crate::config::AgentConfig;
use crate::keys::{self, DeviceKeys};
use crate::sshd::AgentSshHandler;

/// Fixed backoff between uplink attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);
/// Period of the live-session reconciliation posts.
const REAUTHORIZE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Session ids currently served by the embedded SSH server.
#[derive(Clone, Default)]
pub struct LiveSessions {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl LiveSessions {
    pub fn insert(&self, id: &str) {
        self.inner.lock().insert(id.to_owned());
    }

    pub fn remove(&self, id: &str) {
        self.inner.lock().remove(id);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().iter().cloned().collect()
    }
}

pub async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let keys = keys::load_or_generate(&config.private_key)?;
    let identity = keys::identity_of(&config)?;

    info!(
        mac = %identity.mac,
        hostname = %identity.hostname,
        fingerprint = %keys.fingerprint,
        "Agent identity assembled"
    );

    let api = ApiClient::new(config.clone())?;

    loop {
        match connect_once(&config, &api, &keys, &identity).await {
            Ok(()) => info!("Uplink closed, reconnecting"),
            Err(error) => warn!(error = format!("{error:#}"), "Uplink attempt failed"),
        }

        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

async fn connect_once(
    config: &AgentConfig,
    api: &ApiClient,
    keys: &DeviceKeys,
    identity: &keys::Identity,
) -> anyhow::Result<()> {
    let auth = api.auth_device(keys, identity).await.context("device authentication")?;

    info!(uid = %auth.uid, name = %auth.name, namespace = %auth.namespace, "Device authenticated");

    let uplink = api.dial_uplink(&auth).await.context("uplink dial")?;
    let (reader, writer) = tokio::io::split(uplink);

    let mut proxy = TunnelProxy::new(Box::new(reader), Box::new(writer)).with_config(TunnelConfig::acceptor());
    let mut sessions_rx = proxy.session_acceptor();
    let engine = proxy.spawn();

    let live_sessions = LiveSessions::default();

    let ssh_config = Arc::new(russh::server::Config {
        keys: vec![keys.host_keypair.clone()],
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::ZERO),
        ..Default::default()
    });

    // Accepts session channels and serves the embedded SSH server on each.
    let accept_loop = {
        let config = config.clone();
        let api = api.clone();
        let auth = auth.clone();
        let live_sessions = live_sessions.clone();

        TaskHandle::spawn(async move {
            while let Some(incoming) = sessions_rx.recv().await {
                let session_id = incoming.session_id.clone();
                debug!(session = %session_id, "Session channel accepted");

                let handler = AgentSshHandler::new(
                    config.clone(),
                    api.clone(),
                    auth.clone(),
                    session_id.clone(),
                    live_sessions.clone(),
                );

                let ssh_config = Arc::clone(&ssh_config);
                let live_sessions = live_sessions.clone();

                TaskHandle::spawn(async move {
                    live_sessions.insert(&session_id);

                    match russh::server::run_stream(ssh_config, incoming.stream, handler).await {
                        Ok(session) => {
                            if let Err(error) = session.await {
                                debug!(session = %session_id, %error, "SSH session ended with an error");
                            }
                        }
                        Err(error) => {
                            warn!(session = %session_id, %error, "SSH handshake over the tunnel failed");
                        }
                    }

                    live_sessions.remove(&session_id);
                })
                .detach();
            }
        })
    };

    // Periodically re-posts the live session ids for reconciliation.
    let reauthorize_loop = {
        let api = api.clone();
        let token = auth.token.clone();
        let live_sessions = live_sessions.clone();

        TaskHandle::spawn(async move {
            loop {
                tokio::time::sleep(REAUTHORIZE_INTERVAL).await;

                let ids = live_sessions.snapshot();
                if ids.is_empty() {
                    continue;
                }

                if let Err(error) = api.reauthorize_sessions(&token, &ids).await {
                    debug!(error = format!("{error:#}"), "Session reauthorization failed");
                }
            }
        })
    };

    let result = engine.join().await.context("tunnel engine crashed")?;

    drop(accept_loop);
    drop(reauthorize_loop);

    result.context("tunnel engine failed")
}
