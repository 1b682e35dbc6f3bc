//! Operator-facing SSH termination.
//!
//! Each accepted connection resolves its SSHID to a device tunnel, opens an
//! SSH client leg to the agent's embedded server over a fresh logical
//! channel, and mirrors the operator's channels onto it.

pub mod sshid;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId, ChannelMsg, CryptoVec, Pty};
use russh_keys::PublicKeyBase64 as _;
use russh_keys::key::PublicKey;
use shellhub_registry::{RegistryError, SessionInput, SessionType};
use shellhub_task::{ShutdownSignal, Task, TaskHandle};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::GwState;
use crate::sshd::sshid::Sshid;

/// Time allotted to finish authentication.
const AUTH_DEADLINE: Duration = Duration::from_secs(10);
/// Time allotted to open the first channel once authenticated.
const FIRST_CHANNEL_DEADLINE: Duration = Duration::from_secs(30);

pub struct SshServerTask {
    pub state: GwState,
}

#[async_trait]
impl Task for SshServerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "operator ssh listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let conf = self.state.conf_handle.get_conf();

        let listener = TcpListener::bind(conf.ssh_bind)
            .await
            .with_context(|| format!("couldn't bind SSH listener on {}", conf.ssh_bind))?;

        info!(addr = %conf.ssh_bind, "Operator SSH listener started");

        let config = Arc::new(russh::server::Config {
            keys: vec![(*self.state.ssh_host_key).clone()],
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            let state = self.state.clone();
                            let config = Arc::clone(&config);

                            TaskHandle::spawn(async move {
                                if let Err(error) = handle_connection(config, state, stream, peer_addr).await {
                                    warn!(client = %peer_addr, error = format!("{error:#}"), "SSH connection failed");
                                }
                            })
                            .detach();
                        }
                        Err(error) => error!(%error, "SSH accept failure"),
                    }
                }
                () = shutdown_signal.wait() => break,
            }
        }

        Ok(())
    }
}

#[instrument("ssh", skip_all, fields(client = %peer_addr))]
async fn handle_connection(
    config: Arc<russh::server::Config>,
    state: GwState,
    stream: TcpStream,
    peer_addr: SocketAddr,
) -> anyhow::Result<()> {
    let handler = OperatorHandler::new(state, peer_addr);

    let session = tokio::time::timeout(
        AUTH_DEADLINE + FIRST_CHANNEL_DEADLINE,
        russh::server::run_stream(config, stream, handler),
    )
    .await
    .context("SSH handshake timed out")?
    .map_err(|error| anyhow::anyhow!("SSH handshake failed: {error}"))?;

    session.await.map_err(|error| anyhow::anyhow!("SSH session: {error}"))?;

    Ok(())
}

struct ResolvedTarget {
    sshid: Sshid,
    device_uid: String,
    tenant_id: String,
    tunnel: tunnel_proxy::TunnelHandle,
}

/// What the operator did on a channel, replayed onto the agent leg.
enum OperatorEvent {
    Pty {
        term: String,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: Vec<(Pty, u32)>,
    },
    Shell,
    Exec(Vec<u8>),
    Subsystem(String),
    WindowChange {
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
    },
    Data(Vec<u8>),
    Eof,
    Close,
}

struct ChannelProxy {
    event_tx: mpsc::UnboundedSender<OperatorEvent>,
    has_pty: bool,
    ty_recorded: bool,
    _channel: Channel<Msg>,
}

struct OperatorHandler {
    state: GwState,
    peer_addr: SocketAddr,
    /// Assigned by the gateway; the agent keys its session map on it.
    session_id: String,
    target: Option<ResolvedTarget>,
    agent: Option<russh::client::Handle<AgentClientHandler>>,
    channels: HashMap<ChannelId, ChannelProxy>,
    session_tracked: bool,
    keepalive: Option<TaskHandle<()>>,
}

impl OperatorHandler {
    fn new(state: GwState, peer_addr: SocketAddr) -> Self {
        Self {
            state,
            peer_addr,
            session_id: Uuid::new_v4().to_string(),
            target: None,
            agent: None,
            channels: HashMap::new(),
            session_tracked: false,
            keepalive: None,
        }
    }

    /// Parses the SSHID and resolves the target tunnel.
    ///
    /// A registry outage falls back to the resolution cache for up to its
    /// TTL; beyond that the connection is refused.
    async fn resolve_target(&mut self, user: &str) -> Result<(), &'static str> {
        if self.target.is_some() {
            return Ok(());
        }

        let sshid: Sshid = user.parse().map_err(|_| "invalid SSHID")?;

        let (device_uid, tenant_id) = match self.state.store.device_lookup(&sshid.namespace, &sshid.device).await {
            Ok(device) => {
                let conf = self.state.conf_handle.get_conf();
                self.state.tunnels.cache_resolution(
                    &sshid.namespace,
                    &sshid.device,
                    &device.uid,
                    &device.tenant_id,
                    conf.resolution_cache_ttl,
                );
                (device.uid, device.tenant_id)
            }
            Err(RegistryError::StoreUnavailable | RegistryError::Unknown { .. }) => self
                .state
                .tunnels
                .cached_resolution(&sshid.namespace, &sshid.device)
                .ok_or("registry unavailable")?,
            Err(_) => return Err("unknown device"),
        };

        let tunnel = self.state.tunnels.lookup(&device_uid).ok_or("device is offline")?;

        self.target = Some(ResolvedTarget {
            sshid,
            device_uid,
            tenant_id,
            tunnel,
        });

        Ok(())
    }

    /// Opens the SSH client leg to the agent over a fresh tunnel channel.
    async fn connect_agent(&mut self) -> anyhow::Result<russh::client::Handle<AgentClientHandler>> {
        let target = self.target.as_ref().context("target not resolved")?;

        let stream = target
            .tunnel
            .open_session(self.session_id.clone())
            .await
            .context("couldn't open a session channel on the tunnel")?;

        let config = Arc::new(russh::client::Config::default());
        let handle = russh::client::connect_stream(config, stream, AgentClientHandler)
            .await
            .context("SSH handshake with the agent failed")?;

        Ok(handle)
    }

    /// Registers the session with the tracker and starts its keepalive.
    async fn track_session(&mut self) {
        if self.session_tracked {
            return;
        }

        let Some(target) = self.target.as_ref() else { return };

        let input = SessionInput {
            uid: self.session_id.clone(),
            device_uid: target.device_uid.clone(),
            tenant_id: target.tenant_id.clone(),
            username: target.sshid.username.clone(),
            ip_address: self.peer_addr.ip().to_string(),
            ty: SessionType::Shell,
        };

        match self.state.sessions.new_session(input).await {
            Ok(_) => {
                self.session_tracked = true;

                if let Err(error) = self.state.sessions.set_authenticated(&self.session_id, true).await {
                    warn!(%error, "Couldn't flag session as authenticated");
                }

                let sessions = self.state.sessions.clone();
                let session_id = self.session_id.clone();
                let interval = self.state.conf_handle.get_conf().keepalive_interval;

                self.keepalive = Some(TaskHandle::spawn(async move {
                    loop {
                        tokio::time::sleep(interval).await;
                        if sessions.keepalive(&session_id).await.is_err() {
                            break;
                        }
                    }
                }));
            }
            Err(error) => warn!(%error, "Couldn't register session"),
        }
    }

    fn record_type(&mut self, id: ChannelId, ty: SessionType) {
        let Some(proxy) = self.channels.get_mut(&id) else { return };

        if proxy.ty_recorded {
            return;
        }
        proxy.ty_recorded = true;

        let sessions = self.state.sessions.clone();
        let session_id = self.session_id.clone();
        TaskHandle::spawn(async move {
            let _ = sessions.set_type(&session_id, ty).await;
        })
        .detach();
    }

    fn send_event(&mut self, id: ChannelId, event: OperatorEvent) {
        if let Some(proxy) = self.channels.get(&id) {
            let _ = proxy.event_tx.send(event);
        }
    }
}

#[async_trait]
impl russh::server::Handler for OperatorHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if let Err(reason) = self.resolve_target(user).await {
            debug!(user, reason, "Password authentication refused");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        // The gateway never checks the password itself: it is forwarded to
        // the agent, which owns local authentication.
        let mut agent = match self.connect_agent().await {
            Ok(agent) => agent,
            Err(error) => {
                warn!(error = format!("{error:#}"), "Couldn't reach the agent");
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                });
            }
        };

        let username = self
            .target
            .as_ref()
            .map(|target| target.sshid.username.clone())
            .unwrap_or_default();

        match agent.authenticate_password(username, password).await {
            Ok(true) => {
                self.agent = Some(agent);
                self.track_session().await;
                Ok(Auth::Accept)
            }
            Ok(false) => Ok(Auth::Reject {
                proceed_with_methods: None,
            }),
            Err(error) => {
                warn!(%error, "Agent-side password authentication errored");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        if let Err(reason) = self.resolve_target(user).await {
            debug!(user, reason, "Public key authentication refused");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        let fingerprint = shellhub_identity::fingerprint::legacy(&public_key.public_key_bytes());

        let (tenant_id, device_uid, username) = {
            let target = self.target.as_ref().expect("resolved above");
            (
                target.tenant_id.clone(),
                target.device_uid.clone(),
                target.sshid.username.clone(),
            )
        };

        // The key must be registered and its filter must cover both the
        // device and the login.
        let authorized = self
            .state
            .store
            .public_key_evaluate(&tenant_id, &fingerprint, &username, &device_uid)
            .await
            .unwrap_or(false);

        if !authorized {
            debug!(%fingerprint, "Offered key is not authorized for this target");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        // Authenticate the agent leg with the companion key; the agent
        // closes the loop through the co-signing flow.
        let companion = match self.state.store.companion_key_for_user_key(&tenant_id, &fingerprint).await {
            Ok(companion) => companion,
            Err(error) => {
                warn!(%error, "No companion key for an authorized fingerprint");
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                });
            }
        };

        let keypair = match russh_keys::decode_secret_key(&companion.private_pem, None) {
            Ok(keypair) => keypair,
            Err(error) => {
                warn!(%error, "Companion key is unusable");
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                });
            }
        };

        let mut agent = match self.connect_agent().await {
            Ok(agent) => agent,
            Err(error) => {
                warn!(error = format!("{error:#}"), "Couldn't reach the agent");
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                });
            }
        };

        match agent.authenticate_publickey(username, Arc::new(keypair)).await {
            Ok(true) => {
                self.agent = Some(agent);
                self.track_session().await;
                Ok(Auth::Accept)
            }
            Ok(false) => Ok(Auth::Reject {
                proceed_with_methods: None,
            }),
            Err(error) => {
                warn!(%error, "Agent-side public key authentication errored");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(agent) = self.agent.as_ref() else {
            return Ok(false);
        };

        let agent_channel = match agent.channel_open_session().await {
            Ok(agent_channel) => agent_channel,
            Err(error) => {
                warn!(%error, "Couldn't open a channel on the agent leg");
                return Ok(false);
            }
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // The pump ends on its own once either leg closes.
        TaskHandle::spawn(pump_channel(agent_channel, event_rx, session.handle(), channel.id())).detach();

        self.channels.insert(
            channel.id(),
            ChannelProxy {
                event_tx,
                has_pty: false,
                ty_recorded: false,
                _channel: channel,
            },
        );

        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(target) = self.target.as_ref() else {
            return Ok(false);
        };

        let port = match u16::try_from(port_to_connect) {
            Ok(port) => port,
            Err(_) => return Ok(false),
        };

        match target.tunnel.open_direct_tcpip(host_to_connect, port).await {
            Ok(stream) => {
                TaskHandle::spawn(async move {
                    if let Err(error) = transport::forward_bidirectional(channel.into_stream(), stream).await {
                        debug!(error = format!("{error:#}"), "direct-tcpip forward ended");
                    }
                })
                .detach();

                Ok(true)
            }
            Err(error) => {
                debug!(%error, host_to_connect, port, "direct-tcpip refused");
                Ok(false)
            }
        }
    }

    async fn pty_request(
        &mut self,
        id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(proxy) = self.channels.get_mut(&id) {
            proxy.has_pty = true;
        }

        self.send_event(
            id,
            OperatorEvent::Pty {
                term: term.to_owned(),
                col_width,
                row_height,
                pix_width,
                pix_height,
                modes: modes.to_vec(),
            },
        );

        session.channel_success(id);
        Ok(())
    }

    async fn shell_request(&mut self, id: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        let ty = match self.channels.get(&id) {
            Some(proxy) if proxy.has_pty => SessionType::Shell,
            // A shell with no terminal behaves like a heredoc pipe.
            _ => SessionType::Heredoc,
        };
        self.record_type(id, ty);

        self.send_event(id, OperatorEvent::Shell);
        session.channel_success(id);
        Ok(())
    }

    async fn exec_request(&mut self, id: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        self.record_type(id, SessionType::Exec);

        self.send_event(id, OperatorEvent::Exec(data.to_vec()));
        session.channel_success(id);
        Ok(())
    }

    async fn subsystem_request(&mut self, id: ChannelId, name: &str, session: &mut Session) -> Result<(), Self::Error> {
        if name != "sftp" {
            session.channel_failure(id);
            return Ok(());
        }

        self.record_type(id, SessionType::Sftp);

        self.send_event(id, OperatorEvent::Subsystem(name.to_owned()));
        session.channel_success(id);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        id: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.send_event(
            id,
            OperatorEvent::WindowChange {
                col_width,
                row_height,
                pix_width,
                pix_height,
            },
        );

        session.channel_success(id);
        Ok(())
    }

    async fn data(&mut self, id: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
        self.send_event(id, OperatorEvent::Data(data.to_vec()));
        Ok(())
    }

    async fn channel_eof(&mut self, id: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.send_event(id, OperatorEvent::Eof);
        Ok(())
    }

    async fn channel_close(&mut self, id: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        if let Some(proxy) = self.channels.remove(&id) {
            let _ = proxy.event_tx.send(OperatorEvent::Close);
        }
        Ok(())
    }
}

impl Drop for OperatorHandler {
    fn drop(&mut self) {
        if self.session_tracked {
            let sessions = self.state.sessions.clone();
            let session_id = self.session_id.clone();
            tokio::spawn(async move {
                let _ = sessions.close(&session_id).await;
            });
        }
    }
}

/// Replays operator channel activity onto the agent leg and streams the
/// agent's answers back.
async fn pump_channel(
    mut agent_channel: Channel<russh::client::Msg>,
    mut events: mpsc::UnboundedReceiver<OperatorEvent>,
    server_handle: russh::server::Handle,
    operator_id: ChannelId,
) {
    loop {
        tokio::select! {
            msg = agent_channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        if server_handle.data(operator_id, CryptoVec::from_slice(&data)).await.is_err() {
                            break;
                        }
                    }
                    Some(ChannelMsg::ExtendedData { data, ext }) => {
                        let _ = server_handle
                            .extended_data(operator_id, ext, CryptoVec::from_slice(&data))
                            .await;
                    }
                    Some(ChannelMsg::ExitStatus { exit_status }) => {
                        let _ = server_handle.exit_status_request(operator_id, exit_status).await;
                    }
                    Some(ChannelMsg::Eof) => {
                        // Agent-side EOF closes the operator channel entirely.
                        let _ = server_handle.eof(operator_id).await;
                        let _ = server_handle.close(operator_id).await;
                        break;
                    }
                    Some(ChannelMsg::Close) | None => {
                        let _ = server_handle.close(operator_id).await;
                        break;
                    }
                    Some(_) => {}
                }
            }
            event = events.recv() => {
                match event {
                    Some(OperatorEvent::Data(bytes)) => {
                        if agent_channel.data(&bytes[..]).await.is_err() {
                            break;
                        }
                    }
                    Some(OperatorEvent::Pty { term, col_width, row_height, pix_width, pix_height, modes }) => {
                        let _ = agent_channel
                            .request_pty(false, &term, col_width, row_height, pix_width, pix_height, &modes)
                            .await;
                    }
                    Some(OperatorEvent::Shell) => {
                        let _ = agent_channel.request_shell(false).await;
                    }
                    Some(OperatorEvent::Exec(command)) => {
                        let _ = agent_channel.exec(false, command).await;
                    }
                    Some(OperatorEvent::Subsystem(name)) => {
                        let _ = agent_channel.request_subsystem(false, &name).await;
                    }
                    Some(OperatorEvent::WindowChange { col_width, row_height, pix_width, pix_height }) => {
                        let _ = agent_channel.window_change(col_width, row_height, pix_width, pix_height).await;
                    }
                    Some(OperatorEvent::Eof) => {
                        // Operator EOF half-closes the agent direction only.
                        let _ = agent_channel.eof().await;
                    }
                    Some(OperatorEvent::Close) | None => {
                        let _ = agent_channel.eof().await;
                        break;
                    }
                }
            }
        }
    }
}

/// Client handler for the gateway→agent SSH leg.
///
/// The tunnel already attributes and authenticates the remote device, so
/// the agent's host key is accepted as-is.
struct AgentClientHandler;

#[async_trait]
impl russh::client::Handler for AgentClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}
