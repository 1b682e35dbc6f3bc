//! Token issuance and validation for the gateway HTTP plane.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use parking_lot::Mutex;
use shellhub_identity::token::{Claims, TokenError, TokenKind};
use shellhub_identity::{PrivateKey, PublicKey};
use shellhub_task::{ShutdownSignal, Task};
use uuid::Uuid;

/// Validity of freshly issued device tokens.
pub const DEVICE_TOKEN_VALIDITY_SECS: i64 = 30 * 24 * 3600;
/// Validity of user tokens.
pub const USER_TOKEN_VALIDITY_SECS: i64 = 72 * 3600;

/// The RSA keypair every token is signed with.
pub struct ProvisionerKey {
    private: PrivateKey,
    public: PublicKey,
}

impl ProvisionerKey {
    /// Loads the provisioner key, generating and persisting one at first
    /// boot.
    pub fn load_or_generate(path: &camino::Utf8Path) -> anyhow::Result<Self> {
        let private = if path.exists() {
            shellhub_identity::keys::load_key_file(path.as_std_path()).context("couldn't read provisioner key")?
        } else {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| format!("couldn't create {parent}"))?;
            }

            let key = shellhub_identity::keys::generate_rsa_keypair().context("provisioner key generation")?;
            shellhub_identity::keys::write_key_file(path.as_std_path(), &key)
                .context("couldn't persist provisioner key")?;
            info!(%path, "Generated a new provisioner key");
            key
        };

        let public = shellhub_identity::keys::public_key_of(&private).context("invalid provisioner key")?;

        Ok(Self { private, public })
    }

    pub fn from_private(private: PrivateKey) -> anyhow::Result<Self> {
        let public = shellhub_identity::keys::public_key_of(&private).context("invalid provisioner key")?;
        Ok(Self { private, public })
    }

    pub fn sign_device(&self, uid: &str, tenant: &str) -> Result<String, TokenError> {
        let claims = Claims::device(uid, tenant, DEVICE_TOKEN_VALIDITY_SECS);
        shellhub_identity::token::sign(&claims, &self.private)
    }

    pub fn sign_user(&self, user_id: &str, tenant: &str, role: &str) -> Result<String, TokenError> {
        let claims = Claims::user(user_id, tenant, role, USER_TOKEN_VALIDITY_SECS);
        shellhub_identity::token::sign(&claims, &self.private)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        shellhub_identity::token::verify(token, &self.public)
    }

    pub fn private(&self) -> &PrivateKey {
        &self.private
    }
}

#[derive(Clone)]
struct CacheEntry {
    claims: Claims,
    expires_at: i64,
}

/// Short-TTL cache of validated tokens, keyed by `jti`.
///
/// Also the hook for revocation: uncaching a `(tenant, user)` pair removes
/// its entries so the next request re-resolves membership from the store.
#[derive(Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<Uuid, CacheEntry>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, jti: Uuid) -> Option<Claims> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.entries
            .lock()
            .get(&jti)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.claims.clone())
    }

    pub fn put(&self, claims: Claims) {
        let entry = CacheEntry {
            expires_at: claims.exp,
            claims,
        };
        self.entries.lock().insert(entry.claims.jti, entry);
    }

    /// Drops every cached token of a user within a tenant, typically after
    /// a role change or removal.
    pub fn uncache_user(&self, tenant: &str, user_id: &str) {
        self.entries.lock().retain(|_, entry| {
            !(entry.claims.kind == TokenKind::User && entry.claims.tenant == tenant && entry.claims.sub == user_id)
        });
    }

    fn sweep(&self) {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        self.entries.lock().retain(|_, entry| entry.expires_at > now);
    }
}

/// Short-TTL cache of `(uid) → (name, namespace)` so re-authentication
/// doesn't hit the store on every keepalive cycle.
#[derive(Default)]
pub struct DeviceIdentityCache {
    entries: Mutex<HashMap<String, (String, String, tokio::time::Instant)>>,
}

impl DeviceIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uid: &str) -> Option<(String, String)> {
        let mut entries = self.entries.lock();

        match entries.get(uid) {
            Some((name, namespace, expires_at)) if *expires_at > tokio::time::Instant::now() => {
                Some((name.clone(), namespace.clone()))
            }
            Some(_) => {
                entries.remove(uid);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, uid: &str, name: &str, namespace: &str, ttl: Duration) {
        self.entries.lock().insert(
            uid.to_owned(),
            (name.to_owned(), namespace.to_owned(), tokio::time::Instant::now() + ttl),
        );
    }
}

pub struct CleanupTask {
    pub token_cache: std::sync::Arc<TokenCache>,
}

#[async_trait]
impl Task for CleanupTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "token cache cleanup";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        const TASK_INTERVAL: Duration = Duration::from_secs(60 * 15);

        debug!("Task started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(TASK_INTERVAL) => {}
                _ = shutdown_signal.wait() => {
                    break;
                }
            }

            self.token_cache.sweep();
        }

        debug!("Task terminated");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn provisioner() -> ProvisionerKey {
        let private = shellhub_identity::keys::generate_rsa_keypair().unwrap();
        ProvisionerKey::from_private(private).unwrap()
    }

    #[test]
    fn device_tokens_roundtrip() {
        let key = provisioner();

        let token = key.sign_device("uid-1", "tenant-1").unwrap();
        let claims = key.verify(&token).unwrap();

        assert_eq!(claims.kind, TokenKind::Device);
        assert_eq!(claims.sub, "uid-1");
        assert_eq!(claims.tenant, "tenant-1");
    }

    #[test]
    fn uncache_is_scoped_to_the_user() {
        let cache = TokenCache::new();

        let user = Claims::user("user-1", "tenant-1", "operator", 3600);
        let other = Claims::user("user-2", "tenant-1", "observer", 3600);
        let device = Claims::device("uid-1", "tenant-1", 3600);

        cache.put(user.clone());
        cache.put(other.clone());
        cache.put(device.clone());

        cache.uncache_user("tenant-1", "user-1");

        assert!(cache.get(user.jti).is_none());
        assert!(cache.get(other.jti).is_some());
        assert!(cache.get(device.jti).is_some());
    }

    #[test]
    fn expired_entries_are_swept() {
        let cache = TokenCache::new();

        let mut claims = Claims::device("uid-1", "tenant-1", 3600);
        claims.exp = time::OffsetDateTime::now_utc().unix_timestamp() - 1;
        let jti = claims.jti;
        cache.put(claims);

        assert!(cache.get(jti).is_none());

        cache.sweep();
        assert!(cache.entries.lock().is_empty());
    }
}
