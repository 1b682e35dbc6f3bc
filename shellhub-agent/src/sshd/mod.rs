//! The embedded SSH server, served over tunnel session channels.
//!
//! Authentication is local: passwords check against the system accounts (or
//! the single-user hash), public keys close the gateway co-signing loop.

pub mod osauth;
#[cfg(unix)]
pub mod pty;
#[cfg(target_os = "linux")]
pub mod utmp;

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId};
use russh_keys::PublicKeyBase64 as _;
use russh_keys::key::PublicKey;
use shellhub_task::TaskHandle;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use crate::client::{ApiClient, AuthResponse};
use crate::config::AgentConfig;
use crate::connector::LiveSessions;
use crate::sshd::osauth::LocalUser;

struct SessionChannel {
    channel: Option<Channel<Msg>>,
    #[cfg(unix)]
    pty: Option<pty::PtyRequest>,
    #[cfg(unix)]
    master_resize: Option<std::os::fd::OwnedFd>,
}

pub struct AgentSshHandler {
    config: AgentConfig,
    api: ApiClient,
    auth: AuthResponse,
    session_id: String,
    _live: LiveSessions,
    user: Option<LocalUser>,
    channels: HashMap<ChannelId, SessionChannel>,
}

impl AgentSshHandler {
    pub fn new(
        config: AgentConfig,
        api: ApiClient,
        auth: AuthResponse,
        session_id: String,
        live: LiveSessions,
    ) -> Self {
        Self {
            config,
            api,
            auth,
            session_id,
            _live: live,
            user: None,
            channels: HashMap::new(),
        }
    }

    /// Resolves which local account the login runs as.
    fn resolve_user(&self, login: &str) -> Option<LocalUser> {
        #[cfg(unix)]
        {
            if self.config.single_user() {
                // Single-user mode always runs as the invoking account.
                osauth::current()
            } else {
                osauth::lookup(login)
            }
        }

        #[cfg(not(unix))]
        {
            let _ = login;
            None
        }
    }
}

#[async_trait]
impl russh::server::Handler for AgentSshHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let verified = if let Some(hash) = &self.config.single_user_password {
            shellhub_identity::crypt::verify(hash, password)
        } else {
            #[cfg(unix)]
            {
                osauth::authenticate(user, password)
            }
            #[cfg(not(unix))]
            {
                false
            }
        };

        if !verified {
            debug!(session = %self.session_id, user, "Password rejected");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        match self.resolve_user(user) {
            Some(local) => {
                debug!(session = %self.session_id, user, run_as = %local.name, "Password accepted");
                self.user = Some(local);
                Ok(Auth::Accept)
            }
            None => {
                debug!(session = %self.session_id, user, "No usable local account");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                })
            }
        }
    }

    /// The co-signing loop: ask the gateway to sign the canonical challenge
    /// for this login, then verify that signature against the key the
    /// gateway offered. A valid signature proves the key is registered for
    /// this tenant.
    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let wire = public_key.public_key_bytes();
        let fingerprint = shellhub_identity::fingerprint::legacy(&wire);
        let challenge = shellhub_identity::challenge::canonical(user, &self.auth.namespace);

        let signature = match self
            .api
            .sign_challenge(&self.auth.token, &fingerprint, &challenge)
            .await
        {
            Ok(signature) => signature,
            Err(error) => {
                debug!(session = %self.session_id, %fingerprint, error = format!("{error:#}"), "Co-signing refused");
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                });
            }
        };

        let verification_key = match shellhub_identity::fingerprint::rsa_from_wire(&wire) {
            Ok(key) => key,
            Err(error) => {
                debug!(session = %self.session_id, %error, "Offered key is not a usable RSA key");
                return Ok(Auth::Reject {
                    proceed_with_methods: None,
                });
            }
        };

        let verified =
            shellhub_identity::challenge::verify(&verification_key, &challenge, &signature).unwrap_or(false);

        if !verified {
            warn!(session = %self.session_id, %fingerprint, "Co-signature did not verify against the offered key");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        match self.resolve_user(user) {
            Some(local) => {
                debug!(session = %self.session_id, user, run_as = %local.name, "Public key accepted");
                self.user = Some(local);
                Ok(Auth::Accept)
            }
            None => Ok(Auth::Reject {
                proceed_with_methods: None,
            }),
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(
            channel.id(),
            SessionChannel {
                channel: Some(channel),
                #[cfg(unix)]
                pty: None,
                #[cfg(unix)]
                master_resize: None,
            },
        );

        Ok(true)
    }

    #[cfg(unix)]
    async fn pty_request(
        &mut self,
        id: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(sc) = self.channels.get_mut(&id) {
            sc.pty = Some(pty::PtyRequest {
                term: term.to_owned(),
                col_width,
                row_height,
                pix_width,
                pix_height,
            });
            session.channel_success(id);
        } else {
            session.channel_failure(id);
        }

        Ok(())
    }

    #[cfg(unix)]
    async fn shell_request(&mut self, id: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        let Some(user) = self.user.clone() else {
            session.channel_failure(id);
            return Ok(());
        };

        let Some(sc) = self.channels.get_mut(&id) else {
            session.channel_failure(id);
            return Ok(());
        };

        let Some(channel) = sc.channel.take() else {
            session.channel_failure(id);
            return Ok(());
        };

        let handle = session.handle();
        let multi_user = !self.config.single_user();

        if let Some(request) = sc.pty.clone() {
            match pty::spawn_shell(&user, &request, multi_user) {
                Ok(pty_session) => {
                    sc.master_resize = pty_session.master_resize.try_clone().ok();

                    TaskHandle::spawn(run_pty_session(channel, pty_session, handle, id, user, multi_user)).detach();
                    session.channel_success(id);
                }
                Err(error) => {
                    warn!(session = %self.session_id, error = format!("{error:#}"), "PTY allocation failed");
                    session.channel_failure(id);
                }
            }
        } else {
            // Shell without a terminal: plain pipes, merged output.
            let command = build_piped_command(&user, None, multi_user);
            TaskHandle::spawn(run_piped_session(channel, command, handle, id)).detach();
            session.channel_success(id);
        }

        Ok(())
    }

    #[cfg(unix)]
    async fn exec_request(&mut self, id: ChannelId, data: &[u8], session: &mut Session) -> Result<(), Self::Error> {
        let command_line = String::from_utf8_lossy(data).into_owned();
        let handle = session.handle();

        if command_line.trim().is_empty() {
            warn!(session = %self.session_id, "None command received");
            session.channel_success(id);
            let _ = handle.exit_status_request(id, 1).await;
            let _ = handle.close(id).await;
            return Ok(());
        }

        let Some(user) = self.user.clone() else {
            session.channel_failure(id);
            return Ok(());
        };

        let Some(channel) = self.channels.get_mut(&id).and_then(|sc| sc.channel.take()) else {
            session.channel_failure(id);
            return Ok(());
        };

        let multi_user = !self.config.single_user();
        let command = build_piped_command(&user, Some(&command_line), multi_user);

        TaskHandle::spawn(run_piped_session(channel, command, handle, id)).detach();
        session.channel_success(id);

        Ok(())
    }

    #[cfg(unix)]
    async fn subsystem_request(&mut self, id: ChannelId, name: &str, session: &mut Session) -> Result<(), Self::Error> {
        if name != "sftp" {
            session.channel_failure(id);
            return Ok(());
        }

        let Some(user) = self.user.clone() else {
            session.channel_failure(id);
            return Ok(());
        };

        let Some(channel) = self.channels.get_mut(&id).and_then(|sc| sc.channel.take()) else {
            session.channel_failure(id);
            return Ok(());
        };

        let handle = session.handle();
        let multi_user = !self.config.single_user();

        TaskHandle::spawn(run_sftp_session(channel, handle, id, user, multi_user)).detach();
        session.channel_success(id);

        Ok(())
    }

    #[cfg(unix)]
    async fn window_change_request(
        &mut self,
        id: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(master) = self.channels.get(&id).and_then(|sc| sc.master_resize.as_ref()) {
            pty::resize(
                master,
                &pty::PtyRequest {
                    term: String::new(),
                    col_width,
                    row_height,
                    pix_width,
                    pix_height,
                },
            );
        }

        session.channel_success(id);
        Ok(())
    }

    async fn channel_close(&mut self, id: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
        self.channels.remove(&id);
        Ok(())
    }
}

#[cfg(unix)]
fn build_piped_command(user: &LocalUser, command: Option<&str>, multi_user: bool) -> tokio::process::Command {
    let shell = pty::login_shell(user);

    let mut cmd = tokio::process::Command::new(&shell);

    match command {
        Some(line) => {
            cmd.arg("-c").arg(line);
        }
        None => {
            cmd.arg("-l");
        }
    }

    cmd.env_clear()
        .env("HOME", &user.home)
        .env("USER", &user.name)
        .env("LOGNAME", &user.name)
        .env("SHELL", &shell)
        .env("PATH", "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin")
        .current_dir(&user.home)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if multi_user {
        cmd.uid(user.uid).gid(user.gid);
    }

    cmd
}

/// Splices a pty-backed login shell with the channel, then reports the exit
/// code.
#[cfg(unix)]
async fn run_pty_session(
    channel: Channel<Msg>,
    mut pty_session: pty::PtySession,
    handle: Handle,
    id: ChannelId,
    user: LocalUser,
    multi_user: bool,
) {
    #[cfg(target_os = "linux")]
    let logged = if multi_user {
        let pid = pty_session.child.id().and_then(|pid| i32::try_from(pid).ok());
        if let (Some(pid), Some(line)) = (pid, pty_session.slave_name.clone()) {
            utmp::write_login(&user.name, &line, pid);
            Some((line, pid))
        } else {
            None
        }
    } else {
        None
    };
    #[cfg(not(target_os = "linux"))]
    let _ = (user, multi_user);

    let stream = channel.into_stream();

    // The master read errors with EIO once the child exits; either way the
    // session is over.
    let _ = transport::forward_bidirectional(stream, &mut pty_session.master).await;

    let code = wait_exit_code(&mut pty_session.child).await;

    #[cfg(target_os = "linux")]
    if let Some((line, pid)) = logged {
        utmp::write_logout(&line, pid);
    }

    let _ = handle.exit_status_request(id, code).await;
    let _ = handle.eof(id).await;
    let _ = handle.close(id).await;
}

/// Splices a piped child process with the channel; stderr is merged into
/// the output stream.
#[cfg(unix)]
async fn run_piped_session(channel: Channel<Msg>, mut command: tokio::process::Command, handle: Handle, id: ChannelId) {
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            warn!(%error, "Couldn't spawn the requested command");
            let _ = handle.exit_status_request(id, 127).await;
            let _ = handle.close(id).await;
            return;
        }
    };

    let mut stdin = child.stdin.take();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let (mut channel_rd, mut channel_wr) = tokio::io::split(channel.into_stream());

    let input_pump = TaskHandle::spawn(async move {
        if let Some(stdin) = stdin.as_mut() {
            let _ = tokio::io::copy(&mut channel_rd, stdin).await;
            let _ = stdin.shutdown().await;
        }
    });

    // Merge stdout and stderr into the channel, preserving order within
    // each stream.
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let mut out_open = stdout.is_some();
    let mut err_open = stderr.is_some();

    while out_open || err_open {
        tokio::select! {
            read = async { stdout.as_mut().expect("guarded by out_open").read(&mut out_buf).await }, if out_open => {
                match read {
                    Ok(0) | Err(_) => out_open = false,
                    Ok(n) => {
                        if channel_wr.write_all(&out_buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
            read = async { stderr.as_mut().expect("guarded by err_open").read(&mut err_buf).await }, if err_open => {
                match read {
                    Ok(0) | Err(_) => err_open = false,
                    Ok(n) => {
                        if channel_wr.write_all(&err_buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    let _ = channel_wr.shutdown().await;
    drop(input_pump);

    let code = wait_exit_code(&mut child).await;

    let _ = handle.exit_status_request(id, code).await;
    let _ = handle.eof(id).await;
    let _ = handle.close(id).await;
}

/// Re-executes the agent binary as the `sftp` helper and splices it with
/// the channel.
#[cfg(unix)]
async fn run_sftp_session(channel: Channel<Msg>, handle: Handle, id: ChannelId, user: LocalUser, multi_user: bool) {
    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(error) => {
            warn!(%error, "Couldn't locate the agent binary");
            let _ = handle.close(id).await;
            return;
        }
    };

    let mut command = tokio::process::Command::new(exe);
    command
        .arg("sftp")
        .env_clear()
        .env("HOME", &user.home)
        .env("USER", &user.name)
        .current_dir(&user.home)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    if multi_user {
        command.uid(user.uid).gid(user.gid);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            warn!(%error, "Couldn't spawn the sftp helper");
            let _ = handle.close(id).await;
            return;
        }
    };

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();

    if let (Some(stdin), Some(stdout)) = (stdin, stdout) {
        let joined = tokio::io::join(stdout, stdin);
        let _ = transport::forward_bidirectional(channel.into_stream(), joined).await;
    }

    let code = wait_exit_code(&mut child).await;

    let _ = handle.exit_status_request(id, code).await;
    let _ = handle.close(id).await;
}

#[cfg(unix)]
async fn wait_exit_code(child: &mut tokio::process::Child) -> u32 {
    match child.wait().await {
        Ok(status) => status.code().and_then(|code| u32::try_from(code).ok()).unwrap_or(1),
        Err(_) => 1,
    }
}
