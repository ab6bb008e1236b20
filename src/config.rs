//! The data model and the read-only seam to the (out-of-scope) persisted
//! configuration store.
//!
//! The store itself — how `Glob`/`Client`/`Tunnel`/`Host` are created,
//! edited, and durably saved — lives outside this crate's scope; it is
//! reached only through the [`ConfigStore`] trait. [`InMemoryConfigStore`]
//! is a minimal implementation used to wire a standalone listener and in
//! tests, mirroring how the reference codebase's proxy modules consume a
//! `ServerConfig` abstraction without owning configuration persistence.

use std::collections::HashMap;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::util::hostname_radix_tree::HostnameRadixTree;
use crate::util::ip_set::IpSet;

/// Global settings (`Glob` in the upstream data model): IP allow/deny lists
/// and the optional shared password gate.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Glob {
  pub black_ip_list: Vec<String>,
  pub white_ip_list: Vec<String>,
  pub global_password: String,
}

impl Glob {
  /// Pre-normalized view of the two IP lists, built once per snapshot
  /// rather than re-sorted on every admission check.
  pub fn compiled(&self) -> CompiledGlob {
    CompiledGlob {
      black_ips: IpSet::load_from_vec(&self.black_ip_list),
      white_ips: IpSet::load_from_vec(&self.white_ip_list),
      global_password: self.global_password.clone(),
    }
  }
}

/// `Glob`, with its IP lists pre-parsed into hash sets.
#[derive(Debug, Clone, Default)]
pub struct CompiledGlob {
  pub black_ips: IpSet,
  pub white_ips: IpSet,
  pub global_password: String,
}

impl CompiledGlob {
  pub fn password_required(&self) -> bool {
    !self.global_password.is_empty()
  }
}

/// Cumulative byte accounting, shared by `Client`, `Tunnel`, and `Host`.
#[derive(Debug, Default)]
pub struct Flow {
  pub inlet_flow: std::sync::atomic::AtomicU64,
  pub export_flow: std::sync::atomic::AtomicU64,
  /// MiB; `0` means unlimited.
  pub flow_limit_mib: u64,
}

impl Flow {
  pub fn add(&self, inlet: u64, export: u64) {
    self
      .inlet_flow
      .fetch_add(inlet, std::sync::atomic::Ordering::Relaxed);
    self
      .export_flow
      .fetch_add(export, std::sync::atomic::Ordering::Relaxed);
  }

  pub fn exceeded(&self) -> bool {
    if self.flow_limit_mib == 0 {
      return false;
    }
    let used = self.inlet_flow.load(std::sync::atomic::Ordering::Relaxed)
      + self.export_flow.load(std::sync::atomic::Ordering::Relaxed);
    (self.flow_limit_mib << 20) < used
  }
}

/// Implemented by every entity that carries a [`Flow`] counter (`Client`,
/// `Tunnel`, `Host`), so the copy pump can tap an arbitrary combination of
/// them (tunnel-only for TCP, tunnel+client+host for the vhost proxy)
/// without hand-wiring a different accounting path per front-end.
pub trait FlowOwner: Send + Sync {
  fn flow(&self) -> &Flow;
}

impl FlowOwner for Client {
  fn flow(&self) -> &Flow {
    &self.flow
  }
}

impl FlowOwner for Tunnel {
  fn flow(&self) -> &Flow {
    &self.flow
  }
}

impl FlowOwner for Host {
  fn flow(&self) -> &Flow {
    &self.flow
  }
}

/// A registered tunnel client.
#[derive(Debug)]
pub struct Client {
  pub id: u64,
  pub verify_key: String,
  /// `0` disables throttling.
  pub rate_limit_bytes_per_sec: u64,
  pub flow: Flow,
  pub max_connections: u64,
  connections_in_use: std::sync::atomic::AtomicU64,
  /// Informational cap on concurrently registered tunnels; enforced by the
  /// (out-of-scope) config store at tunnel-creation time, not by admission.
  pub max_tunnel_count: u64,
  pub black_ip_list: IpSet,
  pub basic_auth: Option<(String, String)>,
  pub crypt: bool,
  pub compress: bool,
}

impl Client {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    id: u64,
    verify_key: impl Into<String>,
    rate_limit_bytes_per_sec: u64,
    flow: Flow,
    max_connections: u64,
    max_tunnel_count: u64,
    black_ip_list: IpSet,
    basic_auth: Option<(String, String)>,
    crypt: bool,
    compress: bool,
  ) -> Self {
    Self {
      id,
      verify_key: verify_key.into(),
      rate_limit_bytes_per_sec,
      flow,
      max_connections,
      connections_in_use: std::sync::atomic::AtomicU64::new(0),
      max_tunnel_count,
      black_ip_list,
      basic_auth,
      crypt,
      compress,
    }
  }

  /// Mirrors the upstream `GetConn`/`AddConn` pair: an admitted connection
  /// claims one slot out of `max_connections` and releases it on close.
  /// `0` means unlimited.
  pub fn acquire_connection(&self) -> bool {
    if self.max_connections == 0 {
      return true;
    }
    loop {
      let current = self
        .connections_in_use
        .load(std::sync::atomic::Ordering::Acquire);
      if current >= self.max_connections {
        return false;
      }
      if self
        .connections_in_use
        .compare_exchange(
          current,
          current + 1,
          std::sync::atomic::Ordering::AcqRel,
          std::sync::atomic::Ordering::Acquire,
        )
        .is_ok()
      {
        return true;
      }
    }
  }

  pub fn release_connection(&self) {
    self
      .connections_in_use
      .fetch_update(
        std::sync::atomic::Ordering::AcqRel,
        std::sync::atomic::Ordering::Acquire,
        |v| Some(v.saturating_sub(1)),
      )
      .ok();
  }
}

/// Transport mode for a [`Tunnel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
  Tcp,
  HttpProxy,
}

/// A listener spec owned by a client: TCP passthrough or forward HTTP proxy.
pub struct Tunnel {
  pub id: u64,
  pub mode: TunnelMode,
  pub server_ip: String,
  pub port: u16,
  pub targets: Vec<String>,
  pub local_proxy: bool,
  pub client_id: u64,
  pub bypass_global_password: bool,
  pub flow: Flow,
}

impl Tunnel {
  pub fn random_target(&self) -> Option<&str> {
    if self.targets.is_empty() {
      return None;
    }
    let idx = rand::random_range(0..self.targets.len());
    Some(&self.targets[idx])
  }
}

/// A virtual-host routing entry owned by a client.
pub struct Host {
  pub id: u64,
  /// Literal name, or `*.suffix` wildcard, matched against the request Host header.
  pub host_pattern: String,
  pub path_location: Option<String>,
  pub scheme: HostScheme,
  pub targets: Vec<String>,
  pub header_rewrites: Vec<(String, String)>,
  pub host_rewrite: Option<String>,
  pub client_id: u64,
  pub cert_pem: Option<Vec<u8>>,
  pub key_pem: Option<Vec<u8>>,
  pub auto_https: bool,
  pub bypass_global_password: bool,
  pub use_cache: bool,
  pub flow: Flow,
}

impl Host {
  pub fn random_target(&self) -> Option<&str> {
    if self.targets.is_empty() {
      return None;
    }
    let idx = rand::random_range(0..self.targets.len());
    Some(&self.targets[idx])
  }

  pub fn matches_scheme(&self, is_tls: bool) -> bool {
    match self.scheme {
      HostScheme::Http => !is_tls,
      HostScheme::Https => is_tls,
      HostScheme::All => true,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostScheme {
  Http,
  Https,
  All,
}

/// Read-only seam between the proxy layer and the (out-of-scope) persisted
/// configuration store.
pub trait ConfigStore: Send + Sync {
  fn global(&self) -> CompiledGlob;
  fn find_host(&self, host_header: &str, path: &str, is_tls: bool) -> Option<std::sync::Arc<Host>>;
  fn client(&self, id: u64) -> Option<std::sync::Arc<Client>>;
  fn tunnel(&self, id: u64) -> Option<std::sync::Arc<Tunnel>>;
  /// All registered tunnel ids, for a standalone binary to spawn one
  /// front-end listener per tunnel at startup.
  fn tunnel_ids(&self) -> Vec<u64>;
}

/// A minimal in-process store backing a standalone listener and the test
/// suite. Hosts are indexed by a [`HostnameRadixTree`] for suffix/exact
/// matching exactly as the virtual-host lookup requires.
pub struct InMemoryConfigStore {
  glob: RwLock<Glob>,
  hosts_by_pattern: RwLock<HostnameRadixTree<std::sync::Arc<Host>>>,
  clients: RwLock<HashMap<u64, std::sync::Arc<Client>>>,
  tunnels: RwLock<HashMap<u64, std::sync::Arc<Tunnel>>>,
}

impl InMemoryConfigStore {
  pub fn new() -> Self {
    Self {
      glob: RwLock::new(Glob::default()),
      hosts_by_pattern: RwLock::new(HostnameRadixTree::new()),
      clients: RwLock::new(HashMap::new()),
      tunnels: RwLock::new(HashMap::new()),
    }
  }

  pub fn set_global(&self, glob: Glob) {
    *self.glob.write().unwrap() = glob;
  }

  pub fn add_client(&self, client: Client) {
    self
      .clients
      .write()
      .unwrap()
      .insert(client.id, std::sync::Arc::new(client));
  }

  pub fn add_tunnel(&self, tunnel: Tunnel) {
    self
      .tunnels
      .write()
      .unwrap()
      .insert(tunnel.id, std::sync::Arc::new(tunnel));
  }

  pub fn add_host(&self, host: Host) {
    let pattern = host.host_pattern.clone();
    self
      .hosts_by_pattern
      .write()
      .unwrap()
      .insert(pattern, std::sync::Arc::new(host));
  }
}

impl Default for InMemoryConfigStore {
  fn default() -> Self {
    Self::new()
  }
}

impl ConfigStore for InMemoryConfigStore {
  fn global(&self) -> CompiledGlob {
    self.glob.read().unwrap().compiled()
  }

  fn find_host(&self, host_header: &str, path: &str, is_tls: bool) -> Option<std::sync::Arc<Host>> {
    // Strip a port suffix the way the reference lookup strips `:port` before
    // matching against configured host patterns.
    let host_only = host_header.split(':').next().unwrap_or(host_header);
    let candidate = self.hosts_by_pattern.read().unwrap().get(host_only).cloned()?;
    if !candidate.matches_scheme(is_tls) {
      return None;
    }
    if let Some(location) = &candidate.path_location {
      if !path.starts_with(location.as_str()) {
        return None;
      }
    }
    Some(candidate)
  }

  fn client(&self, id: u64) -> Option<std::sync::Arc<Client>> {
    self.clients.read().unwrap().get(&id).cloned()
  }

  fn tunnel(&self, id: u64) -> Option<std::sync::Arc<Tunnel>> {
    self.tunnels.read().unwrap().get(&id).cloned()
  }

  fn tunnel_ids(&self) -> Vec<u64> {
    self.tunnels.read().unwrap().keys().copied().collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sample_client(id: u64) -> Client {
    Client::new(
      id,
      "k",
      0,
      Flow::default(),
      2,
      0,
      IpSet::new(),
      None,
      false,
      false,
    )
  }

  #[test]
  fn client_connection_quota_is_enforced_and_released() {
    let client = sample_client(1);
    assert!(client.acquire_connection());
    assert!(client.acquire_connection());
    assert!(!client.acquire_connection());
    client.release_connection();
    assert!(client.acquire_connection());
  }

  #[test]
  fn unlimited_connections_when_max_is_zero() {
    let mut client = sample_client(1);
    client.max_connections = 0;
    for _ in 0..1000 {
      assert!(client.acquire_connection());
    }
  }

  #[test]
  fn flow_exceeded_respects_limit_in_mib() {
    let flow = Flow {
      flow_limit_mib: 1,
      ..Default::default()
    };
    assert!(!flow.exceeded());
    flow.add(1024 * 1024 + 1, 0);
    assert!(flow.exceeded());
  }

  #[test]
  fn zero_flow_limit_means_unlimited() {
    let flow = Flow::default();
    flow.add(u64::MAX / 2, u64::MAX / 2);
    assert!(!flow.exceeded());
  }

  #[test]
  fn find_host_matches_exact_and_wildcard_and_respects_scheme() {
    let store = InMemoryConfigStore::new();
    store.add_host(Host {
      id: 1,
      host_pattern: "exact.example.com".into(),
      path_location: None,
      scheme: HostScheme::All,
      targets: vec!["127.0.0.1:8080".into()],
      header_rewrites: vec![],
      host_rewrite: None,
      client_id: 1,
      cert_pem: None,
      key_pem: None,
      auto_https: false,
      bypass_global_password: false,
      use_cache: false,
      flow: Flow::default(),
    });
    store.add_host(Host {
      id: 2,
      host_pattern: "*.wild.example.com".into(),
      path_location: None,
      scheme: HostScheme::Https,
      targets: vec!["127.0.0.1:8443".into()],
      header_rewrites: vec![],
      host_rewrite: None,
      client_id: 1,
      cert_pem: None,
      key_pem: None,
      auto_https: false,
      bypass_global_password: false,
      use_cache: false,
      flow: Flow::default(),
    });

    assert!(store.find_host("exact.example.com:8080", "/", false).is_some());
    assert!(store.find_host("nomatch.com", "/", false).is_none());
    assert!(store.find_host("a.wild.example.com", "/", true).is_some());
    // Scheme mismatch: the wildcard host requires TLS.
    assert!(store.find_host("a.wild.example.com", "/", false).is_none());
  }
}
