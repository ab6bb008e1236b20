//! The global IP authentication cache (§4.1): records which client IPs have
//! recently cleared the global-password challenge, so the admission
//! controller does not re-challenge them on every request.
//!
//! Grounded on the reference codebase's generic [`crate::util::ttl_cache::TtlCache`],
//! wrapped in a `RwLock` for concurrent readers and a background sweeper
//! task, and on the upstream `IpAuthCache`'s reader-releases-before-expiry-check
//! discipline: `is_authenticated` copies the entry out from under the lock
//! before deciding whether it has expired.

use std::net::IpAddr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::logging::ErrorLogger;
use crate::util::ttl_cache::TtlCache;

const DEFAULT_AUTH_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// TTL-cached set of authenticated IPs, with a background sweeper.
pub struct IpAuthCache {
  cache: RwLock<TtlCache<IpAddr, Instant>>,
  auth_ttl: Duration,
}

impl IpAuthCache {
  pub(crate) fn new(auth_ttl: Duration) -> Self {
    Self {
      cache: RwLock::new(TtlCache::new(auth_ttl)),
      auth_ttl,
    }
  }

  pub async fn authenticate(&self, ip: IpAddr) {
    self.cache.write().await.insert(ip, Instant::now());
  }

  /// Matches the upstream discipline exactly: take the read lock only long
  /// enough to copy the cached timestamp, then check expiry afterward.
  pub async fn is_authenticated(&self, ip: IpAddr) -> bool {
    let entry = {
      let cache = self.cache.read().await;
      cache.get(&ip)
    };
    match entry {
      Some(authenticated_at) => authenticated_at.elapsed() <= self.auth_ttl,
      None => false,
    }
  }

  async fn sweep(&self) -> usize {
    self.cache.write().await.cleanup()
  }
}

static GLOBAL_CACHE: OnceLock<Arc<IpAuthCache>> = OnceLock::new();

/// Initializes the process-wide cache exactly once; later calls are no-ops.
/// Also spawns the background sweeper task on first initialization.
pub fn init_global(auth_ttl: Duration, cleanup_interval: Duration, logger: ErrorLogger) -> Arc<IpAuthCache> {
  GLOBAL_CACHE
    .get_or_init(|| {
      let cache = Arc::new(IpAuthCache::new(auth_ttl));
      if cleanup_interval > Duration::ZERO {
        let sweeper_cache = cache.clone();
        tokio::spawn(async move {
          let mut interval = tokio::time::interval(cleanup_interval);
          loop {
            interval.tick().await;
            let evicted = sweeper_cache.sweep().await;
            if evicted > 0 {
              logger.trace(format!("ip auth cache: evicted {evicted} expired entries")).await;
            }
          }
        });
      }
      cache
    })
    .clone()
}

/// Returns the singleton, lazily initializing it with defaults if no caller
/// has explicitly initialized it yet — a safety net for code paths outside
/// the normal startup wiring (matches the upstream `GetGlobalIpAuthCache`
/// fallback).
pub fn global() -> Arc<IpAuthCache> {
  init_global(DEFAULT_AUTH_TTL, DEFAULT_CLEANUP_INTERVAL, ErrorLogger::discard())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn authenticate_then_is_authenticated() {
    let cache = IpAuthCache::new(Duration::from_secs(5));
    let ip: IpAddr = "1.2.3.4".parse().unwrap();
    assert!(!cache.is_authenticated(ip).await);
    cache.authenticate(ip).await;
    assert!(cache.is_authenticated(ip).await);
  }

  #[tokio::test]
  async fn entry_expires_after_ttl() {
    let cache = IpAuthCache::new(Duration::from_millis(20));
    let ip: IpAddr = "5.6.7.8".parse().unwrap();
    cache.authenticate(ip).await;
    assert!(cache.is_authenticated(ip).await);
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(!cache.is_authenticated(ip).await);
  }

  #[tokio::test]
  async fn sweep_removes_expired_entries() {
    let cache = IpAuthCache::new(Duration::from_millis(10));
    let ip: IpAddr = "9.9.9.9".parse().unwrap();
    cache.authenticate(ip).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    cache.sweep().await;
    assert!(!cache.is_authenticated(ip).await);
  }
}
