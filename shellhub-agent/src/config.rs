//! Environment-driven agent configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use url::Url;

const DEFAULT_KEEPALIVE_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_address: Url,
    pub tenant_id: String,
    pub private_key: PathBuf,
    pub keepalive_interval: Duration,
    pub preferred_hostname: Option<String>,
    /// Overrides the MAC address used in the identity tuple.
    pub preferred_identity: Option<String>,
    /// crypt(3) hash enabling single-user mode.
    pub single_user_password: Option<String>,
    pub log_level: String,
}

impl AgentConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let server_address = required_var("SHELLHUB_SERVER_ADDRESS")?
            .parse::<Url>()
            .context("SHELLHUB_SERVER_ADDRESS is not a valid URL")?;

        let tenant_id = required_var("SHELLHUB_TENANT_ID")?;

        let private_key = PathBuf::from(required_var("SHELLHUB_PRIVATE_KEY")?);

        let keepalive_interval = match optional_var("SHELLHUB_KEEPALIVE_INTERVAL") {
            Some(value) => Duration::from_secs(
                value
                    .parse::<u64>()
                    .context("SHELLHUB_KEEPALIVE_INTERVAL must be a number of seconds")?,
            ),
            None => Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
        };

        let preferred_hostname = optional_var("SHELLHUB_PREFERRED_HOSTNAME").map(|name| name.to_lowercase());
        let preferred_identity = optional_var("SHELLHUB_PREFERRED_IDENTITY");
        let single_user_password = optional_var("SHELLHUB_SINGLE_USER_PASSWORD");

        let log_level = optional_var("SHELLHUB_LOG_LEVEL").unwrap_or_else(|| "info".to_owned());
        match log_level.as_str() {
            "info" | "warning" | "error" | "debug" | "trace" => {}
            other => anyhow::bail!("SHELLHUB_LOG_LEVEL must be one of info|warning|error|debug|trace, got {other}"),
        }

        let config = Self {
            server_address,
            tenant_id,
            private_key,
            keepalive_interval,
            preferred_hostname,
            preferred_identity,
            single_user_password,
            log_level,
        };

        config.validate_mode()?;

        Ok(config)
    }

    fn validate_mode(&self) -> anyhow::Result<()> {
        #[cfg(unix)]
        {
            let is_root = nix::unistd::Uid::effective().is_root();

            // Root runs multi-user against the system accounts; a
            // single-user password there would silently shadow them.
            if is_root && self.single_user_password.is_some() {
                anyhow::bail!("SHELLHUB_SINGLE_USER_PASSWORD must not be set when running as root");
            }

            if !is_root && self.single_user_password.is_none() {
                anyhow::bail!("running unprivileged requires SHELLHUB_SINGLE_USER_PASSWORD");
            }
        }

        Ok(())
    }

    pub fn single_user(&self) -> bool {
        self.single_user_password.is_some()
    }

    /// http(s) endpoint for a given API path.
    pub fn api_url(&self, path: &str) -> anyhow::Result<Url> {
        self.server_address.join(path).context("invalid API path")
    }

    /// ws(s) endpoint for the uplink.
    pub fn ws_url(&self, path: &str) -> anyhow::Result<Url> {
        let mut url = self.api_url(path)?;

        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };

        url.set_scheme(scheme)
            .map_err(|()| anyhow::anyhow!("couldn't derive the websocket scheme"))?;

        Ok(url)
    }
}

fn required_var(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} is required"))
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn ws_url_follows_the_server_scheme() {
        let config = AgentConfig {
            server_address: "https://cloud.example.com".parse().unwrap(),
            tenant_id: "tenant".to_owned(),
            private_key: PathBuf::from("/tmp/key"),
            keepalive_interval: Duration::from_secs(30),
            preferred_hostname: None,
            preferred_identity: None,
            single_user_password: None,
            log_level: "info".to_owned(),
        };

        assert_eq!(config.ws_url("/ssh/connection").unwrap().as_str(), "wss://cloud.example.com/ssh/connection");

        let config = AgentConfig {
            server_address: "http://gateway:8080".parse().unwrap(),
            ..config
        };

        assert_eq!(config.ws_url("/ssh/connection").unwrap().as_str(), "ws://gateway:8080/ssh/connection");
    }
}
