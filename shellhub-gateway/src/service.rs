use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use camino::Utf8Path;
use shellhub_gateway::config::{Conf, ConfHandle};
use shellhub_gateway::log::{GatewayLog, LogDeleterTask};
use shellhub_gateway::session::{SessionManagerTask, SessionSweeperTask, session_manager_channel};
use shellhub_gateway::sshd::SshServerTask;
use shellhub_gateway::token::{CleanupTask, ProvisionerKey, TokenCache};
use shellhub_gateway::tunnel::TunnelTable;
use shellhub_gateway::{GwState, make_http_service};
use shellhub_identity::crypt;
use shellhub_registry::{
    Member, MemberStatus, MemoryStore, Namespace, NamespaceSettings, RegistryError, Role, Store, User,
};
use shellhub_task::{ShutdownHandle, ShutdownSignal, Task, TaskHandle};
use tap::prelude::*;
use time::OffsetDateTime;
use tokio::runtime::{self, Runtime};

#[allow(clippy::large_enum_variant)] // `Running` variant is bigger than `Stopped` but we don't care
enum GatewayState {
    Stopped,
    Running {
        shutdown_handle: ShutdownHandle,
        runtime: Runtime,
    },
}

pub struct GatewayService {
    conf_handle: ConfHandle,
    state: GatewayState,
    _logger_guard: shellhub_log::LoggerGuard,
}

impl GatewayService {
    pub fn load(conf_handle: ConfHandle) -> anyhow::Result<Self> {
        let conf = conf_handle.get_conf();

        let logger_guard =
            shellhub_log::init::<GatewayLog>(&conf.log_file, &conf.log_filter).context("failed to setup logger")?;

        info!(version = env!("CARGO_PKG_VERSION"));

        Ok(GatewayService {
            conf_handle,
            state: GatewayState::Stopped,
            _logger_guard: logger_guard,
        })
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        let runtime = runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to create runtime")?;

        let conf_handle = self.conf_handle.clone();

        // Binding sockets and seeding the store need the runtime.
        let tasks = runtime.block_on(spawn_tasks(conf_handle))?;

        trace!("Tasks created");

        let mut join_all = futures::future::select_all(tasks.inner.into_iter().map(|child| Box::pin(child.join())));

        runtime.spawn(async {
            loop {
                let (result, _, rest) = join_all.await;

                match result {
                    Ok(Ok(())) => trace!("A task terminated gracefully"),
                    Ok(Err(error)) => error!(error = format!("{error:#}"), "A task failed"),
                    Err(error) => error!(%error, "Something went very wrong with a task"),
                }

                if rest.is_empty() {
                    break;
                } else {
                    join_all = futures::future::select_all(rest);
                }
            }
        });

        self.state = GatewayState::Running {
            shutdown_handle: tasks.shutdown_handle,
            runtime,
        };

        Ok(())
    }

    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.state, GatewayState::Stopped) {
            GatewayState::Stopped => {
                info!("Attempted to stop gateway service, but it's already stopped");
            }
            GatewayState::Running {
                shutdown_handle,
                runtime,
            } => {
                info!("Stopping gateway service");

                shutdown_handle.signal();

                runtime.block_on(async move {
                    tokio::select! {
                        _ = shutdown_handle.all_closed() => {
                            debug!("All tasks closed gracefully");
                        }
                        _ = tokio::time::sleep(Duration::from_secs(10)) => {
                            warn!("Some tasks didn’t terminate at all");
                        }
                    }
                });

                runtime.shutdown_timeout(Duration::from_secs(3));

                self.state = GatewayState::Stopped;
            }
        }
    }
}

struct Tasks {
    inner: Vec<TaskHandle<anyhow::Result<()>>>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl Tasks {
    fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = shellhub_task::shutdown_channel();

        Self {
            inner: Vec::new(),
            shutdown_handle,
            shutdown_signal,
        }
    }

    fn register<T>(&mut self, task: T)
    where
        T: Task<Output = anyhow::Result<()>> + Send + 'static,
    {
        let child = shellhub_task::spawn_task(task, self.shutdown_signal.clone());
        self.inner.push(child);
    }
}

async fn spawn_tasks(conf_handle: ConfHandle) -> anyhow::Result<Tasks> {
    let conf = conf_handle.get_conf();

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    bootstrap_store(store.as_ref(), &conf).await?;

    let provisioner_key =
        ProvisionerKey::load_or_generate(&conf.provisioner_key_file).context("provisioner key")?;
    let ssh_host_key = load_or_generate_host_key(&conf.ssh_host_key_file).context("SSH host key")?;

    let token_cache = TokenCache::new().pipe(Arc::new);
    let (session_manager_handle, session_manager_rx) = session_manager_channel();
    let mut tasks = Tasks::new();

    let state = GwState {
        conf_handle: conf_handle.clone(),
        store: Arc::clone(&store),
        provisioner_key: Arc::new(provisioner_key),
        token_cache: Arc::clone(&token_cache),
        identity_cache: Arc::new(shellhub_gateway::token::DeviceIdentityCache::new()),
        tunnels: TunnelTable::new(),
        sessions: session_manager_handle,
        ssh_host_key: Arc::new(ssh_host_key),
        shutdown_signal: tasks.shutdown_signal.clone(),
    };

    tasks.register(HttpListenerTask {
        bind: conf.http_bind,
        state: state.clone(),
    });

    tasks.register(SshServerTask { state: state.clone() });

    tasks.register(SessionManagerTask::new(session_manager_rx, Arc::clone(&store)));

    tasks.register(SessionSweeperTask {
        store,
        idle_threshold: conf.session_idle_threshold,
    });

    tasks.register(CleanupTask { token_cache });

    tasks.register(LogDeleterTask::new(conf.log_file.clone()));

    Ok(tasks)
}

struct HttpListenerTask {
    bind: SocketAddr,
    state: GwState,
}

#[async_trait]
impl Task for HttpListenerTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "http listener";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let listener = tokio::net::TcpListener::bind(self.bind)
            .await
            .with_context(|| format!("couldn't bind HTTP listener on {}", self.bind))?;

        info!(addr = %self.bind, "HTTP listener started");

        let app = make_http_service(self.state).into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown_signal.wait().await })
            .await
            .context("HTTP server")
    }
}

/// Seeds the bootstrap namespace and admin account at first boot.
async fn bootstrap_store(store: &dyn Store, conf: &Conf) -> anyhow::Result<()> {
    let bootstrap = &conf.bootstrap;

    match store.namespace_get(&bootstrap.tenant_id).await {
        Ok(_) => return Ok(()),
        Err(RegistryError::NotFound { .. }) => {}
        Err(error) => return Err(error).context("store probe failed"),
    }

    let admin_id = bootstrap.admin_username.clone();

    store
        .namespace_create(Namespace {
            tenant_id: bootstrap.tenant_id.clone(),
            name: bootstrap.namespace.clone(),
            owner: admin_id.clone(),
            members: vec![Member {
                user_id: admin_id.clone(),
                role: Role::Owner,
                status: MemberStatus::Accepted,
                added_at: OffsetDateTime::now_utc(),
                expires_at: None,
            }],
            settings: NamespaceSettings::default(),
            max_devices: bootstrap.max_devices,
            billing: None,
        })
        .await
        .context("couldn't seed the bootstrap namespace")?;

    let password_hash =
        crypt::hash_sha512(&bootstrap.admin_password).map_err(|_| anyhow::anyhow!("password hashing failed"))?;

    store
        .user_create(User {
            id: admin_id.clone(),
            username: bootstrap.admin_username.clone(),
            email: format!("{admin_id}@localhost"),
            password_hash,
        })
        .await
        .context("couldn't seed the admin user")?;

    info!(
        namespace = %bootstrap.namespace,
        tenant = %bootstrap.tenant_id,
        "Seeded the bootstrap namespace"
    );

    Ok(())
}

fn load_or_generate_host_key(path: &Utf8Path) -> anyhow::Result<russh_keys::key::KeyPair> {
    if path.exists() {
        russh_keys::load_secret_key(path.as_std_path(), None).context("couldn't read the SSH host key")
    } else {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("couldn't create {parent}"))?;
        }

        let key = russh_keys::key::KeyPair::generate_ed25519().context("host key generation failed")?;

        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            options.mode(0o600);
        }
        let file = options
            .open(path.as_std_path())
            .with_context(|| format!("couldn't create {path}"))?;

        russh_keys::encode_pkcs8_pem(&key, file).context("couldn't persist the SSH host key")?;

        info!(%path, "Generated a new SSH host key");

        Ok(key)
    }
}
