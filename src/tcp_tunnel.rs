//! The TCP tunnel front-end (§4.6): a plain passthrough listener bound per
//! `Tunnel`. Shares the admission pipeline with every other front-end (no
//! host lookup, no Basic auth — gate 6 only applies to HTTP-shaped traffic)
//! and, once admitted, opens one upstream link and runs the byte-for-byte
//! copy pump for the lifetime of the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;

use crate::auth::admission::{self, AdmitDecision, RouteAuthPolicy};
use crate::auth::ip_cache::IpAuthCache;
use crate::bridge::{Bridge, LinkKind, LinkSpec};
use crate::config::{Client, ConfigStore, FlowOwner, Tunnel};
use crate::listener;
use crate::logging::ErrorLogger;
use crate::pump::{self, FlowTap};

pub struct TcpTunnelServer {
  pub store: Arc<dyn ConfigStore>,
  pub bridge: Arc<dyn Bridge>,
  pub ip_auth_cache: Arc<IpAuthCache>,
  pub logger: ErrorLogger,
  pub tunnel_id: u64,
}

impl TcpTunnelServer {
  /// Binds the tunnel's configured listen address and serves connections
  /// until the returned future is dropped/aborted (there is no graceful
  /// shutdown signal in scope here; the caller owns the task handle).
  pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
    let tunnel = self
      .store
      .tunnel(self.tunnel_id)
      .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "tunnel not found"))?;
    let addr: SocketAddr = format!("{}:{}", tunnel.server_ip, tunnel.port)
      .parse()
      .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e}")))?;
    let tcp_listener = listener::bind(addr).await?;
    self
      .logger
      .notice(format!("tcp tunnel {}: listening on {addr}", self.tunnel_id))
      .await;

    let this = self.clone();
    listener::serve(tcp_listener, self.logger.clone(), move |stream, peer_addr| {
      let this = this.clone();
      async move {
        this.handle(stream, peer_addr).await;
      }
    })
    .await;
    Ok(())
  }

  async fn handle(&self, stream: TcpStream, peer_addr: SocketAddr) {
    let Some(tunnel) = self.store.tunnel(self.tunnel_id) else {
      return;
    };
    let Some(client) = self.store.client(tunnel.client_id) else {
      self.logger.notice("tcp tunnel: tunnel references unknown client").await;
      return;
    };
    let glob = self.store.global();
    let policy = RouteAuthPolicy {
      bypass_global_password: tunnel.bypass_global_password,
      check_basic_auth: false,
    };

    let decision = admission::admit(peer_addr.ip(), &glob, &client, policy);
    let whitelisted = matches!(decision, AdmitDecision::WhitelistBypass);
    match decision {
      AdmitDecision::WhitelistBypass | AdmitDecision::Admitted => {}
      AdmitDecision::NeedsPasswordCheck => {
        // §9 open question: raw TCP has no redirect target, so the password
        // gate just drops the connection, same as the upstream source.
        match admission::check_password(peer_addr.ip(), &self.ip_auth_cache).await {
          Ok(()) => {}
          Err(_) => return,
        }
      }
      AdmitDecision::Denied(reason) => {
        self
          .logger
          .trace(format!("tcp tunnel: admission denied for {}: {reason}", peer_addr.ip()))
          .await;
        return;
      }
    }

    // Gate 5: acquired exactly once for the life of this connection.
    // Whitelisted peers bypass it entirely (§4.2), so no guard is built —
    // there is nothing to release on their behalf.
    let release_guard = if whitelisted {
      None
    } else {
      match admission::acquire_slot(&client) {
        Ok(()) => Some(ConnectionGuard { client: &client }),
        Err(reason) => {
          self
            .logger
            .trace(format!("tcp tunnel: quota denied for {}: {reason}", peer_addr.ip()))
            .await;
          return;
        }
      }
    };

    let Some(target) = tunnel.random_target() else {
      self.logger.notice("tcp tunnel: no configured targets").await;
      drop(release_guard);
      return;
    };
    let link = LinkSpec {
      kind: LinkKind::Tcp,
      target_addr: target.to_string(),
      crypt: client.crypt,
      compress: client.compress,
      caller_addr: peer_addr.to_string(),
      local_proxy: tunnel.local_proxy,
    };
    let upstream = match self.bridge.send_link_info(client.id, link).await {
      Ok(stream) => stream,
      Err(err) => {
        self.logger.warn(format!("tcp tunnel: upstream open failed: {err}")).await;
        drop(release_guard);
        return;
      }
    };

    let tap = FlowTap::new(vec![
      Arc::new(tunnel_flow_owner(&tunnel)) as Arc<dyn FlowOwner>,
      client.clone() as Arc<dyn FlowOwner>,
    ]);
    pump::run(stream, upstream, tap, client.rate_limit_bytes_per_sec, self.logger.clone()).await;
    drop(release_guard);
  }
}

/// Releases the client's connection slot on drop, so every early-return
/// path above (no targets, upstream failure, pump completion) still frees
/// it exactly once. Only constructed once gate 5 has actually acquired a
/// slot — whitelisted connections never hold one.
struct ConnectionGuard<'a> {
  client: &'a Arc<Client>,
}

impl Drop for ConnectionGuard<'_> {
  fn drop(&mut self) {
    self.client.release_connection();
  }
}

/// A thin `Arc`-free handle tapping a tunnel's own `Flow`, since `Tunnel` is
/// already held behind an `Arc<Tunnel>` from the store and `FlowTap` wants
/// `Arc<dyn FlowOwner>` entries it can clone independently per direction.
fn tunnel_flow_owner(tunnel: &Arc<Tunnel>) -> TunnelFlowHandle {
  TunnelFlowHandle { tunnel: tunnel.clone() }
}

struct TunnelFlowHandle {
  tunnel: Arc<Tunnel>,
}

impl FlowOwner for TunnelFlowHandle {
  fn flow(&self) -> &crate::config::Flow {
    &self.tunnel.flow
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bridge::DirectDialBridge;
  use crate::config::{Flow, HostScheme, InMemoryConfigStore, TunnelMode};
  use crate::util::ip_set::IpSet;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener as TokioTcpListener;

  #[tokio::test]
  async fn admitted_connection_pumps_bytes_to_target() {
    let upstream_listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_addr = upstream_listener.local_addr().unwrap();
    let upstream_task = tokio::spawn(async move {
      let (mut sock, _) = upstream_listener.accept().await.unwrap();
      let mut buf = [0u8; 4];
      sock.read_exact(&mut buf).await.unwrap();
      sock.write_all(b"pong").await.unwrap();
    });

    let store = Arc::new(InMemoryConfigStore::new());
    store.add_client(Client::new(1, "k", 0, Flow::default(), 10, 0, IpSet::new(), None, false, false));
    store.add_tunnel(Tunnel {
      id: 1,
      mode: TunnelMode::Tcp,
      server_ip: "127.0.0.1".into(),
      port: 0,
      targets: vec![upstream_addr.to_string()],
      local_proxy: false,
      client_id: 1,
      bypass_global_password: false,
      flow: Flow::default(),
    });
    let _ = HostScheme::All; // silence unused-import lint if scheme ever becomes unused here

    let server = Arc::new(TcpTunnelServer {
      store: store.clone(),
      bridge: Arc::new(DirectDialBridge),
      ip_auth_cache: Arc::new(IpAuthCache::new(std::time::Duration::from_secs(60))),
      logger: ErrorLogger::discard(),
      tunnel_id: 1,
    });

    let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect_task = tokio::spawn(TcpStream::connect(addr));
    let (accepted, _) = listener.accept().await.unwrap();
    let mut client_sock = connect_task.await.unwrap().unwrap();
    let peer_addr: SocketAddr = "9.9.9.9:1234".parse().unwrap();

    let handle_task = tokio::spawn({
      let server = server.clone();
      async move {
        server.handle(accepted, peer_addr).await;
      }
    });

    client_sock.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client_sock.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
    drop(client_sock);

    upstream_task.await.unwrap();
    handle_task.await.unwrap();

    let client = store.client(1).unwrap();
    assert!(client.flow.inlet_flow.load(std::sync::atomic::Ordering::Relaxed) >= 4);
  }
}
