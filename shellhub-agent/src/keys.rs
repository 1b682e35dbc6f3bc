//! Device key material and the identity tuple sent at authentication.

use std::path::Path;

use anyhow::Context as _;
use russh_keys::PublicKeyBase64 as _;
use shellhub_identity::PrivateKey;

use crate::config::AgentConfig;

pub struct DeviceKeys {
    pub private: PrivateKey,
    /// PEM of the public half, sent on authentication.
    pub public_pem: String,
    /// Legacy fingerprint over the SSH wire form.
    pub fingerprint: String,
    /// The same key, usable as the embedded SSH server host key.
    pub host_keypair: russh_keys::key::KeyPair,
}

/// Loads the device key, generating a 2048-bit RSA key at first run.
///
/// The key file is the only state the agent persists (mode 0600).
pub fn load_or_generate(path: &Path) -> anyhow::Result<DeviceKeys> {
    let private = if path.exists() {
        shellhub_identity::keys::load_key_file(path).context("couldn't read the device private key")?
    } else {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("couldn't create {}", parent.display()))?;
            }
        }

        let key = shellhub_identity::keys::generate_rsa_keypair().context("device key generation failed")?;
        shellhub_identity::keys::write_key_file(path, &key).context("couldn't persist the device private key")?;
        info!(path = %path.display(), "Generated a new device key");
        key
    };

    let private_pem = shellhub_identity::keys::to_pem(&private).context("couldn't encode the device key")?;

    let host_keypair =
        russh_keys::decode_secret_key(&private_pem, None).context("device key is not usable for SSH")?;

    let fingerprint = shellhub_identity::fingerprint::legacy(&host_keypair.public_key_bytes());

    let public = shellhub_identity::keys::public_key_of(&private).context("couldn't derive the public key")?;
    let public_pem = public.to_pem_str().context("couldn't encode the public key")?;

    Ok(DeviceKeys {
        private,
        public_pem,
        fingerprint,
        host_keypair,
    })
}

/// The immutable facts the device UID is derived from.
pub struct Identity {
    pub mac: String,
    pub hostname: String,
}

pub fn identity_of(config: &AgentConfig) -> anyhow::Result<Identity> {
    let mac = match &config.preferred_identity {
        Some(identity) => identity.clone(),
        None => mac_address::get_mac_address()
            .context("couldn't probe the MAC address")?
            .context("no usable network interface")?
            .to_string()
            .to_lowercase(),
    };

    let hostname = match &config.preferred_hostname {
        Some(hostname) => hostname.clone(),
        None => hostname::get()
            .context("couldn't read the hostname")?
            .to_string_lossy()
            .to_lowercase(),
    };

    Ok(Identity { mac, hostname })
}

/// Host facts reported on authentication.
pub fn device_info() -> crate::client::DeviceInfoDto {
    crate::client::DeviceInfoDto {
        os_id: std::env::consts::OS.to_owned(),
        os_name: std::env::consts::OS.to_owned(),
        arch: std::env::consts::ARCH.to_owned(),
        platform: "native".to_owned(),
        version: env!("CARGO_PKG_VERSION").to_owned(),
    }
}
