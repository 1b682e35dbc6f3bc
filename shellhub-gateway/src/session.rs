//! Operator session tracker.
//!
//! Message-driven manager owning the in-flight session set; the registry
//! holds the authoritative record once a session closes. Stale sessions
//! (no keepalive) are finalized by the sweeper task.

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use shellhub_registry::{RegistryError, Session, SessionInput, SessionType, Store};
use shellhub_task::{ShutdownSignal, Task};
use tap::prelude::*;
use tokio::sync::{mpsc, oneshot};

enum SessionManagerMessage {
    New {
        input: SessionInput,
        channel: oneshot::Sender<Result<Session, RegistryError>>,
    },
    SetAuthenticated {
        uid: String,
        authenticated: bool,
    },
    SetType {
        uid: String,
        ty: SessionType,
    },
    Keepalive {
        uid: String,
    },
    Close {
        uid: String,
    },
    GetCount {
        channel: oneshot::Sender<usize>,
    },
}

impl fmt::Debug for SessionManagerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionManagerMessage::New { input, channel: _ } => {
                f.debug_struct("New").field("uid", &input.uid).finish_non_exhaustive()
            }
            SessionManagerMessage::SetAuthenticated { uid, authenticated } => f
                .debug_struct("SetAuthenticated")
                .field("uid", uid)
                .field("authenticated", authenticated)
                .finish(),
            SessionManagerMessage::SetType { uid, ty } => {
                f.debug_struct("SetType").field("uid", uid).field("type", ty).finish()
            }
            SessionManagerMessage::Keepalive { uid } => f.debug_struct("Keepalive").field("uid", uid).finish(),
            SessionManagerMessage::Close { uid } => f.debug_struct("Close").field("uid", uid).finish(),
            SessionManagerMessage::GetCount { channel: _ } => f.debug_struct("GetCount").finish_non_exhaustive(),
        }
    }
}

#[derive(Clone)]
pub struct SessionMessageSender(mpsc::Sender<SessionManagerMessage>);

impl SessionMessageSender {
    pub async fn new_session(&self, input: SessionInput) -> anyhow::Result<Session> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionManagerMessage::New { input, channel: tx })
            .await
            .ok()
            .context("couldn't send New message")?;
        rx.await
            .context("couldn't receive session")?
            .context("couldn't create session")
    }

    pub async fn set_authenticated(&self, uid: &str, authenticated: bool) -> anyhow::Result<()> {
        self.0
            .send(SessionManagerMessage::SetAuthenticated {
                uid: uid.to_owned(),
                authenticated,
            })
            .await
            .ok()
            .context("couldn't send SetAuthenticated message")
    }

    pub async fn set_type(&self, uid: &str, ty: SessionType) -> anyhow::Result<()> {
        self.0
            .send(SessionManagerMessage::SetType { uid: uid.to_owned(), ty })
            .await
            .ok()
            .context("couldn't send SetType message")
    }

    pub async fn keepalive(&self, uid: &str) -> anyhow::Result<()> {
        self.0
            .send(SessionManagerMessage::Keepalive { uid: uid.to_owned() })
            .await
            .ok()
            .context("couldn't send Keepalive message")
    }

    pub async fn close(&self, uid: &str) -> anyhow::Result<()> {
        self.0
            .send(SessionManagerMessage::Close { uid: uid.to_owned() })
            .await
            .ok()
            .context("couldn't send Close message")
    }

    pub async fn running_count(&self) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.0
            .send(SessionManagerMessage::GetCount { channel: tx })
            .await
            .ok()
            .context("couldn't send GetCount message")?;
        rx.await.context("couldn't receive running session count")
    }
}

pub struct SessionMessageReceiver(mpsc::Receiver<SessionManagerMessage>);

pub fn session_manager_channel() -> (SessionMessageSender, SessionMessageReceiver) {
    mpsc::channel(64).pipe(|(tx, rx)| (SessionMessageSender(tx), SessionMessageReceiver(rx)))
}

pub struct SessionManagerTask {
    rx: SessionMessageReceiver,
    store: Arc<dyn Store>,
    running: HashMap<String, ()>,
}

impl SessionManagerTask {
    pub fn new(rx: SessionMessageReceiver, store: Arc<dyn Store>) -> Self {
        Self {
            rx,
            store,
            running: HashMap::new(),
        }
    }
}

#[async_trait]
impl Task for SessionManagerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "session manager";

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output {
        session_manager_task(self, shutdown_signal).await
    }
}

#[instrument(skip_all)]
async fn session_manager_task(
    mut manager: SessionManagerTask,
    mut shutdown_signal: ShutdownSignal,
) -> anyhow::Result<()> {
    debug!("Task started");

    loop {
        tokio::select! {
            msg = manager.rx.0.recv() => {
                let Some(msg) = msg else {
                    warn!("All senders are dead");
                    break;
                };

                debug!(?msg, "Received message");

                match msg {
                    SessionManagerMessage::New { input, channel } => {
                        let uid = input.uid.clone();
                        let result = manager.store.session_create(input).await;
                        if result.is_ok() {
                            manager.running.insert(uid, ());
                        }
                        let _ = channel.send(result);
                    }
                    SessionManagerMessage::SetAuthenticated { uid, authenticated } => {
                        if let Err(error) = manager.store.session_set_authenticated(&uid, authenticated).await {
                            warn!(session = %uid, %error, "Couldn't update session authentication");
                        }
                    }
                    SessionManagerMessage::SetType { uid, ty } => {
                        if let Err(error) = manager.store.session_set_type(&uid, ty).await {
                            warn!(session = %uid, %error, "Couldn't update session type");
                        }
                    }
                    SessionManagerMessage::Keepalive { uid } => {
                        if let Err(error) = manager.store.session_keepalive(&uid).await {
                            debug!(session = %uid, %error, "Session keepalive not recorded");
                        }
                    }
                    SessionManagerMessage::Close { uid } => {
                        manager.running.remove(&uid);
                        if let Err(error) = manager.store.session_close(&uid).await {
                            warn!(session = %uid, %error, "Couldn't close session");
                        }
                    }
                    SessionManagerMessage::GetCount { channel } => {
                        let _ = channel.send(manager.running.len());
                    }
                }
            }
            () = shutdown_signal.wait() => {
                break;
            }
        }
    }

    // Finalize whatever is still in flight.
    for uid in manager.running.keys() {
        if let Err(error) = manager.store.session_close(uid).await {
            warn!(session = %uid, %error, "Couldn't close session during shutdown");
        }
    }

    debug!("Task terminated");

    Ok(())
}

/// Registry-side idle sweep: sessions whose keepalive stopped are closed.
pub struct SessionSweeperTask {
    pub store: Arc<dyn Store>,
    pub idle_threshold: Duration,
}

#[async_trait]
impl Task for SessionSweeperTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "session sweeper";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        debug!("Task started");

        let sweep_interval = self.idle_threshold / 2;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(sweep_interval) => {}
                () = shutdown_signal.wait() => break,
            }

            match self.store.session_sweep_stale(self.idle_threshold).await {
                Ok(swept) if !swept.is_empty() => {
                    info!(count = swept.len(), "Swept stale sessions");
                }
                Ok(_) => {}
                Err(error) => warn!(%error, "Stale session sweep failed"),
            }
        }

        debug!("Task terminated");

        Ok(())
    }
}
