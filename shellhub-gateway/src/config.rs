use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tap::prelude::*;

const DEFAULT_HTTP_BIND: &str = "0.0.0.0:8080";
const DEFAULT_SSH_BIND: &str = "0.0.0.0:2222";
const DEFAULT_KEEPALIVE_SECS: u64 = 30;
const DEFAULT_RESOLUTION_CACHE_TTL_SECS: u64 = 30;

pub fn get_data_dir() -> Utf8PathBuf {
    if let Ok(path) = std::env::var("SHELLHUB_GATEWAY_DATA_PATH") {
        Utf8PathBuf::from(path)
    } else {
        Utf8PathBuf::from("/var/lib/shellhub-gateway")
    }
}

fn get_conf_file_path() -> Utf8PathBuf {
    if let Ok(path) = std::env::var("SHELLHUB_GATEWAY_CONFIG_PATH") {
        Utf8PathBuf::from(path)
    } else {
        get_data_dir().join("gateway.json")
    }
}

/// Source of truth for the running configuration.
#[derive(Debug, Clone)]
pub struct Conf {
    pub http_bind: SocketAddr,
    pub ssh_bind: SocketAddr,
    pub keepalive_interval: Duration,
    pub resolution_cache_ttl: Duration,
    /// Sessions without keepalive for this long are swept.
    pub session_idle_threshold: Duration,
    pub provisioner_key_file: Utf8PathBuf,
    pub ssh_host_key_file: Utf8PathBuf,
    pub log_file: Utf8PathBuf,
    pub log_filter: String,
    /// Namespace seeded at first boot.
    pub bootstrap: BootstrapConf,
}

#[derive(Debug, Clone)]
pub struct BootstrapConf {
    pub tenant_id: String,
    pub namespace: String,
    pub max_devices: i64,
    pub admin_username: String,
    pub admin_password: String,
}

impl Conf {
    fn from_conf_file(conf_file: &dto::ConfFile) -> anyhow::Result<Self> {
        let data_dir = get_data_dir();

        let http_bind = conf_file
            .http_bind
            .as_deref()
            .unwrap_or(DEFAULT_HTTP_BIND)
            .parse()
            .context("invalid http_bind")?;

        let ssh_bind = conf_file
            .ssh_bind
            .as_deref()
            .unwrap_or(DEFAULT_SSH_BIND)
            .parse()
            .context("invalid ssh_bind")?;

        let keepalive_interval = Duration::from_secs(conf_file.keepalive_interval.unwrap_or(DEFAULT_KEEPALIVE_SECS));

        let resolution_cache_ttl = Duration::from_secs(
            conf_file
                .resolution_cache_ttl
                .unwrap_or(DEFAULT_RESOLUTION_CACHE_TTL_SECS),
        );

        // Two missed keepalives plus a little slack.
        let session_idle_threshold = keepalive_interval * 2 + Duration::from_secs(5);

        let provisioner_key_file = conf_file
            .provisioner_key_file
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("provisioner.key"))
            .pipe_ref(|path| normalize_data_path(path, &data_dir));

        let ssh_host_key_file = conf_file
            .ssh_host_key_file
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("ssh_host.key"))
            .pipe_ref(|path| normalize_data_path(path, &data_dir));

        let log_file = conf_file
            .log_file
            .clone()
            .unwrap_or_else(|| Utf8PathBuf::from("gateway"))
            .pipe_ref(|path| normalize_data_path(path, &data_dir));

        let log_filter = std::env::var("SHELLHUB_GATEWAY_LOG")
            .ok()
            .or_else(|| conf_file.log_filter.clone())
            .unwrap_or_else(|| "info".to_owned());

        let bootstrap = BootstrapConf {
            tenant_id: conf_file.tenant_id.clone(),
            namespace: conf_file.namespace.clone().unwrap_or_else(|| "shellhub".to_owned()),
            max_devices: conf_file.max_devices.unwrap_or(-1),
            admin_username: conf_file.admin_username.clone().unwrap_or_else(|| "admin".to_owned()),
            admin_password: conf_file.admin_password.clone().unwrap_or_else(|| "admin".to_owned()),
        };

        Ok(Conf {
            http_bind,
            ssh_bind,
            keepalive_interval,
            resolution_cache_ttl,
            session_idle_threshold,
            provisioner_key_file,
            ssh_host_key_file,
            log_file,
            log_filter,
            bootstrap,
        })
    }
}

fn normalize_data_path(path: &Utf8Path, data_dir: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        data_dir.join(path)
    }
}

/// Configuration handle, cheap to clone.
#[derive(Clone)]
pub struct ConfHandle {
    inner: Arc<ConfHandleInner>,
}

struct ConfHandleInner {
    conf: parking_lot::RwLock<Arc<Conf>>,
    conf_file: parking_lot::RwLock<Arc<dto::ConfFile>>,
}

impl ConfHandle {
    /// Initializes configuration for this instance.
    ///
    /// It's best to call this only once to avoid inconsistencies.
    pub fn init() -> anyhow::Result<Self> {
        let conf_file = load_conf_file_or_generate_new()?;
        let conf = Conf::from_conf_file(&conf_file).context("invalid configuration file")?;

        Ok(Self {
            inner: Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(Arc::new(conf_file)),
            }),
        })
    }

    /// Builds a handle around an explicit configuration (tests).
    pub fn from_conf(conf: Conf) -> Self {
        Self {
            inner: Arc::new(ConfHandleInner {
                conf: parking_lot::RwLock::new(Arc::new(conf)),
                conf_file: parking_lot::RwLock::new(Arc::new(dto::ConfFile::default())),
            }),
        }
    }

    pub fn get_conf(&self) -> Arc<Conf> {
        Arc::clone(&self.inner.conf.read())
    }

    pub fn get_conf_file(&self) -> Arc<dto::ConfFile> {
        Arc::clone(&self.inner.conf_file.read())
    }
}

pub fn load_conf_file_or_generate_new() -> anyhow::Result<dto::ConfFile> {
    let conf_file_path = get_conf_file_path();

    if conf_file_path.exists() {
        let json = std::fs::read_to_string(&conf_file_path)
            .with_context(|| format!("couldn't read config file at {conf_file_path}"))?;
        let conf_file = serde_json::from_str(&json).context("invalid config file")?;
        Ok(conf_file)
    } else {
        let defaults = dto::ConfFile::default();

        if let Some(parent) = conf_file_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("couldn't create {parent}"))?;
        }

        let json = serde_json::to_string_pretty(&defaults).context("couldn't serialize default config")?;
        std::fs::write(&conf_file_path, json)
            .with_context(|| format!("couldn't write default config file at {conf_file_path}"))?;

        info!(path = %conf_file_path, "Generated a default configuration file");

        Ok(defaults)
    }
}

pub mod dto {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ConfFile {
        /// Tenant id of the bootstrap namespace.
        pub tenant_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub namespace: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub max_devices: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub admin_username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub admin_password: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub http_bind: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub ssh_bind: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub keepalive_interval: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub resolution_cache_ttl: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub provisioner_key_file: Option<Utf8PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub ssh_host_key_file: Option<Utf8PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_file: Option<Utf8PathBuf>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub log_filter: Option<String>,
    }

    impl Default for ConfFile {
        fn default() -> Self {
            Self {
                tenant_id: uuid::Uuid::new_v4().to_string(),
                namespace: None,
                max_devices: None,
                admin_username: None,
                admin_password: None,
                http_bind: None,
                ssh_bind: None,
                keepalive_interval: None,
                resolution_cache_ttl: None,
                provisioner_key_file: None,
                ssh_host_key_file: None,
                log_file: None,
                log_filter: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let conf_file = dto::ConfFile::default();
        let conf = Conf::from_conf_file(&conf_file).unwrap();

        assert_eq!(conf.keepalive_interval, Duration::from_secs(30));
        assert_eq!(conf.resolution_cache_ttl, Duration::from_secs(30));
        assert_eq!(conf.session_idle_threshold, Duration::from_secs(65));
        assert_eq!(conf.bootstrap.namespace, "shellhub");
        assert_eq!(conf.bootstrap.max_devices, -1);
    }

    #[test]
    fn relative_paths_land_in_the_data_dir() {
        let conf_file = dto::ConfFile {
            log_file: Some(Utf8PathBuf::from("custom")),
            ..dto::ConfFile::default()
        };
        let conf = Conf::from_conf_file(&conf_file).unwrap();

        assert!(conf.log_file.as_str().ends_with("/custom"));
        assert!(conf.provisioner_key_file.as_str().ends_with("/provisioner.key"));
    }
}
