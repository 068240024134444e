//! Execution-scoped SSH session cache.
//!
//! SSH sessions are expensive to establish and deployments run many command
//! units against the same host, so live sessions are cached per
//! `executionId~host` pair. A cache hit is never trusted blindly: transport
//! libraries do not reliably report half-open connections without an active
//! round trip, so every hit is probed with an inert command first and a stale
//! entry is atomically replaced with a fresh session.
//!
//! The cache takes one coarse lock over the whole map, held across session
//! creation for a missing or stale key. This serializes creation globally -
//! correctness over throughput at the call volumes involved - and guarantees
//! that two racing callers for the same key observe a single consistent
//! hand-off, never two different "current" sessions.
//!
//! WinRM sessions are short-lived by design and are not pooled here.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::config::SshSessionConfig;
use super::russh::SshSession;
use super::SessionResult;

/// A session the cache can hold: it must be probeable and disconnectable.
#[async_trait]
pub trait CachedSession: Send + Sync + 'static {
    /// Liveness check; an error marks the session stale.
    async fn probe(&self) -> SessionResult<()>;
    /// Best-effort disconnect.
    async fn disconnect(&self);
}

/// Factory the cache calls on a miss or on staleness.
#[async_trait]
pub trait SessionOpener: Send + Sync {
    /// Session type produced by this opener.
    type Session: CachedSession;

    /// Open a new authenticated session.
    async fn open(&self, config: &SshSessionConfig) -> SessionResult<Self::Session>;
}

/// Keyed cache of live sessions with probe-then-replace semantics.
///
/// Construct one per process and hand it to every caller by reference; the
/// single-instance invariant is the caller's composition, not hidden global
/// state.
pub struct SessionCache<O: SessionOpener> {
    opener: O,
    entries: Mutex<HashMap<String, Arc<O::Session>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    replacements: AtomicU64,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Probes that passed and reused the cached session.
    pub hits: u64,
    /// Keys that had no cached session.
    pub misses: u64,
    /// Stale sessions replaced after a failed probe.
    pub replacements: u64,
}

impl<O: SessionOpener> SessionCache<O> {
    /// Create a cache around the given opener.
    pub fn new(opener: O) -> Self {
        Self {
            opener,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            replacements: AtomicU64::new(0),
        }
    }

    /// Return the live session for the configuration's execution/host pair,
    /// opening or replacing one as needed.
    ///
    /// Staleness is recovered here transparently; the caller only ever sees
    /// added latency, not an error, unless the replacement itself fails.
    pub async fn get_or_create(
        &self,
        config: &SshSessionConfig,
    ) -> SessionResult<Arc<O::Session>> {
        let key = config.cache_key();
        let mut entries = self.entries.lock().await;

        if let Some(existing) = entries.get(&key).cloned() {
            match existing.probe().await {
                Ok(()) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(existing);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Cached session failed liveness probe, replacing");
                    self.replacements.fetch_add(1, Ordering::Relaxed);
                    entries.remove(&key);
                    let fresh = Arc::new(self.opener.open(config).await?);
                    entries.insert(key, Arc::clone(&fresh));
                    // The stale handle is disconnected off the hot path; its
                    // outcome does not matter.
                    tokio::spawn(async move { existing.disconnect().await });
                    return Ok(fresh);
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "No cached session, opening");
        let session = Arc::new(self.opener.open(config).await?);
        entries.insert(key, Arc::clone(&session));
        Ok(session)
    }

    /// Remove and disconnect the entry for one execution/host pair.
    ///
    /// A missing entry is logged, not an error.
    pub async fn evict_and_disconnect(&self, execution_id: &str, host: &str) {
        let key = cache_key(execution_id, host);
        let removed = self.entries.lock().await.remove(&key);
        match removed {
            Some(session) => {
                debug!(key = %key, "Evicting cached session");
                session.disconnect().await;
            }
            None => debug!(key = %key, "No cached session to evict"),
        }
    }

    /// Disconnect every cached session. Intended for process shutdown.
    pub async fn disconnect_all(&self) {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock().await;
            entries.drain().collect()
        };
        for (key, session) in drained {
            debug!(key = %key, "Disconnecting cached session");
            session.disconnect().await;
        }
    }

    /// Number of cached sessions.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// `true` when the cache holds no sessions.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            replacements: self.replacements.load(Ordering::Relaxed),
        }
    }
}

/// Cache key for one execution/host pair.
pub fn cache_key(execution_id: &str, host: &str) -> String {
    format!("{}~{}", execution_id, host.trim())
}

/// Opener producing real SSH sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshSessionOpener;

#[async_trait]
impl SessionOpener for SshSessionOpener {
    type Session = SshSession;

    async fn open(&self, config: &SshSessionConfig) -> SessionResult<Self::Session> {
        SshSession::open(config).await
    }
}

#[async_trait]
impl CachedSession for SshSession {
    async fn probe(&self) -> SessionResult<()> {
        SshSession::probe(self).await
    }

    async fn disconnect(&self) {
        SshSession::disconnect(self).await;
    }
}

/// The production cache type.
pub type SshSessionCache = SessionCache<SshSessionOpener>;

impl Default for SshSessionCache {
    fn default() -> Self {
        Self::new(SshSessionOpener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::SshCredentials;
    use crate::connection::SessionError;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    struct FakeSession {
        serial: usize,
        healthy: AtomicBool,
        disconnected: Arc<AtomicBool>,
    }

    impl FakeSession {
        fn mark_stale(&self) {
            self.healthy.store(false, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl CachedSession for FakeSession {
        async fn probe(&self) -> SessionResult<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(SessionError::Closed)
            }
        }

        async fn disconnect(&self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeOpener {
        opened: AtomicUsize,
        last_disconnected: Mutex<Vec<Arc<AtomicBool>>>,
    }

    #[async_trait]
    impl SessionOpener for FakeOpener {
        type Session = FakeSession;

        async fn open(&self, _config: &SshSessionConfig) -> SessionResult<FakeSession> {
            let serial = self.opened.fetch_add(1, Ordering::SeqCst);
            let disconnected = Arc::new(AtomicBool::new(false));
            self.last_disconnected
                .lock()
                .await
                .push(Arc::clone(&disconnected));
            Ok(FakeSession {
                serial,
                healthy: AtomicBool::new(true),
                disconnected,
            })
        }
    }

    fn config_for(execution_id: &str, host: &str) -> SshSessionConfig {
        SshSessionConfig::new(
            host,
            "deploy",
            SshCredentials::Password {
                password: "pw".into(),
            },
        )
        .execution_id(execution_id)
    }

    #[tokio::test]
    async fn repeated_lookups_return_the_same_session() {
        let cache = SessionCache::new(FakeOpener::default());
        let config = config_for("exec-1", "host-a");

        let first = cache.get_or_create(&config).await.unwrap();
        let second = cache.get_or_create(&config).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.stats().misses, 1);
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn failed_probe_swaps_in_a_fresh_session() {
        let cache = SessionCache::new(FakeOpener::default());
        let config = config_for("exec-1", "host-a");

        let first = cache.get_or_create(&config).await.unwrap();
        first.mark_stale();

        let second = cache.get_or_create(&config).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.serial, second.serial);
        assert_eq!(cache.stats().replacements, 1);

        // The replacement is now the entry for the key.
        let third = cache.get_or_create(&config).await.unwrap();
        assert!(Arc::ptr_eq(&second, &third));

        // The stale handle is disconnected off the hot path.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(first.disconnected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn keys_isolate_execution_host_pairs() {
        let cache = SessionCache::new(FakeOpener::default());

        let a = cache
            .get_or_create(&config_for("exec-1", "host-a"))
            .await
            .unwrap();
        let b = cache
            .get_or_create(&config_for("exec-2", "host-a"))
            .await
            .unwrap();
        let c = cache
            .get_or_create(&config_for("exec-1", "host-b"))
            .await
            .unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len().await, 3);
    }

    #[tokio::test]
    async fn evict_disconnects_and_tolerates_missing_entries() {
        let cache = SessionCache::new(FakeOpener::default());
        let config = config_for("exec-1", " host-a ");

        let session = cache.get_or_create(&config).await.unwrap();
        cache.evict_and_disconnect("exec-1", "host-a").await;
        assert!(session.disconnected.load(Ordering::SeqCst));
        assert!(cache.is_empty().await);

        // Evicting again is a logged no-op.
        cache.evict_and_disconnect("exec-1", "host-a").await;
    }

    #[tokio::test]
    async fn disconnect_all_drains_the_cache() {
        let cache = SessionCache::new(FakeOpener::default());
        let a = cache
            .get_or_create(&config_for("exec-1", "host-a"))
            .await
            .unwrap();
        let b = cache
            .get_or_create(&config_for("exec-1", "host-b"))
            .await
            .unwrap();

        cache.disconnect_all().await;
        assert!(cache.is_empty().await);
        assert!(a.disconnected.load(Ordering::SeqCst));
        assert!(b.disconnected.load(Ordering::SeqCst));
    }

    #[test]
    fn cache_key_trims_host() {
        assert_eq!(cache_key("exec-9", "  web-1  "), "exec-9~web-1");
    }
}
