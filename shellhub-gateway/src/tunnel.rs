//! The tunnel table: the single system-wide mutable of the gateway.
//!
//! Maps each device UID to at most one live tunnel. Registration displaces
//! any older entry (last-writer-wins, so agent restarts take over cleanly)
//! and the displaced engine is closed, which surfaces EOF to its sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shellhub_registry::Store;
use shellhub_task::{ShutdownSignal, Task};
use smol_str::SmolStr;
use tunnel_proxy::TunnelHandle;

/// Missing this many consecutive keepalive acks marks the device offline.
pub const KEEPALIVE_MISS_BUDGET: u32 = 2;

#[derive(Clone)]
struct TunnelEntry {
    handle: TunnelHandle,
    generation: u64,
}

struct CachedResolution {
    uid: String,
    tenant_id: String,
    expires_at: tokio::time::Instant,
}

#[derive(Clone, Default)]
pub struct TunnelTable {
    inner: Arc<TunnelTableInner>,
}

#[derive(Default)]
struct TunnelTableInner {
    entries: Mutex<HashMap<SmolStr, TunnelEntry>>,
    next_generation: Mutex<u64>,
    resolutions: Mutex<HashMap<(SmolStr, SmolStr), CachedResolution>>,
}

impl TunnelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tunnel, returning its generation and the displaced
    /// handle, if any. The caller closes the displaced engine outside the
    /// critical section.
    pub fn register(&self, uid: &str, handle: TunnelHandle) -> (u64, Option<TunnelHandle>) {
        let generation = {
            let mut next = self.inner.next_generation.lock();
            *next += 1;
            *next
        };

        let displaced = self
            .inner
            .entries
            .lock()
            .insert(SmolStr::new(uid), TunnelEntry { handle, generation });

        (generation, displaced.map(|entry| entry.handle))
    }

    /// Removes the entry only if it still belongs to `generation`, so a
    /// reconnected agent is not unregistered by its predecessor's teardown.
    pub fn unregister(&self, uid: &str, generation: u64) -> bool {
        let mut entries = self.inner.entries.lock();

        match entries.get(uid) {
            Some(entry) if entry.generation == generation => {
                entries.remove(uid);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, uid: &str) -> Option<TunnelHandle> {
        self.inner.entries.lock().get(uid).map(|entry| entry.handle.clone())
    }

    pub fn connected_count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    // ----- name resolution cache ----- //

    pub fn cache_resolution(&self, namespace: &str, device: &str, uid: &str, tenant_id: &str, ttl: Duration) {
        self.inner.resolutions.lock().insert(
            (SmolStr::new(namespace), SmolStr::new(device)),
            CachedResolution {
                uid: uid.to_owned(),
                tenant_id: tenant_id.to_owned(),
                expires_at: tokio::time::Instant::now() + ttl,
            },
        );
    }

    /// Fallback resolution used while the registry is unreachable.
    ///
    /// Returns `(uid, tenant_id)`.
    pub fn cached_resolution(&self, namespace: &str, device: &str) -> Option<(String, String)> {
        let key = (SmolStr::new(namespace), SmolStr::new(device));
        let mut resolutions = self.inner.resolutions.lock();

        match resolutions.get(&key) {
            Some(cached) if cached.expires_at > tokio::time::Instant::now() => {
                Some((cached.uid.clone(), cached.tenant_id.clone()))
            }
            Some(_) => {
                resolutions.remove(&key);
                None
            }
            None => None,
        }
    }
}

/// Per-tunnel keepalive prober.
///
/// Writes a keepalive every interval; after [`KEEPALIVE_MISS_BUDGET`]
/// missed acks the tunnel is torn down and the device marked offline.
pub struct TunnelKeepaliveTask {
    pub uid: String,
    pub generation: u64,
    pub handle: TunnelHandle,
    pub table: TunnelTable,
    pub store: Arc<dyn Store>,
    pub interval: Duration,
}

#[async_trait]
impl Task for TunnelKeepaliveTask {
    type Output = anyhow::Result<()>;

    const NAME: &'static str = "tunnel keepalive";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let mut seq: u64 = 0;
        let mut missed: u32 = 0;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                () = self.handle.closed() => {
                    debug!(device = %self.uid, "Tunnel engine is gone");
                    break;
                }
                _ = shutdown_signal.wait() => {
                    self.handle.close().await;
                    break;
                }
            }

            if self.handle.last_ack() >= seq {
                missed = 0;
                if self.store.device_heartbeat(&self.uid).await.is_err() {
                    debug!(device = %self.uid, "Heartbeat not recorded");
                }
            } else {
                missed += 1;
                debug!(device = %self.uid, missed, "Keepalive ack missing");

                if missed >= KEEPALIVE_MISS_BUDGET {
                    warn!(device = %self.uid, "Agent stopped answering keepalives");
                    self.handle.close().await;
                    break;
                }
            }

            seq += 1;
            if self.handle.keepalive(seq).await.is_err() {
                break;
            }
        }

        if self.table.unregister(&self.uid, self.generation) {
            if let Err(error) = self.store.device_set_online(&self.uid, false).await {
                warn!(device = %self.uid, %error, "Couldn't mark device offline");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_handle() -> (TunnelHandle, tunnel_proxy::TunnelProxy) {
        let (left, _right) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(left);
        let proxy = tunnel_proxy::TunnelProxy::new(Box::new(reader), Box::new(writer));
        (proxy.handle(), proxy)
    }

    #[tokio::test]
    async fn registration_displaces_the_previous_tunnel() {
        let table = TunnelTable::new();

        let (first, _first_proxy) = dummy_handle();
        let (second, _second_proxy) = dummy_handle();

        let (first_generation, displaced) = table.register("uid-1", first);
        assert!(displaced.is_none());

        let (second_generation, displaced) = table.register("uid-1", second);
        assert!(displaced.is_some());
        assert!(second_generation > first_generation);

        // The old generation can't unregister the new entry.
        assert!(!table.unregister("uid-1", first_generation));
        assert!(table.lookup("uid-1").is_some());

        assert!(table.unregister("uid-1", second_generation));
        assert!(table.lookup("uid-1").is_none());
    }

    #[tokio::test]
    async fn resolution_cache_expires() {
        let table = TunnelTable::new();

        table.cache_resolution("testspace", "dev01", "uid-1", "tenant-1", Duration::from_millis(20));
        assert_eq!(
            table.cached_resolution("testspace", "dev01"),
            Some(("uid-1".to_owned(), "tenant-1".to_owned()))
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(table.cached_resolution("testspace", "dev01").is_none());
    }
}
