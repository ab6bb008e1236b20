//! The HTTP forward proxy front-end (§4.6, `mode=httpProxy`): reads one
//! request head off the socket, admits the connection (including HTTP Basic
//! auth, since this front-end is HTTP-shaped), then either tunnels opaque
//! bytes after a `CONNECT` handshake or forwards the absolute-URI request
//! as a single opaque TCP stream to the parsed target.
//!
//! This intentionally does not re-parse or rewrite anything past the first
//! request line the way the virtual-host proxy does (§4.4.1): a forward
//! proxy's client already addresses the real origin, so there is no
//! per-request host-rebinding state machine to run — one admission check,
//! one target, then the rest of the TCP stream is opaque.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::auth::admission::{self, AdmitDecision, RouteAuthPolicy};
use crate::auth::ip_cache::IpAuthCache;
use crate::bridge::{Bridge, LinkKind, LinkSpec};
use crate::config::{Client, ConfigStore, FlowOwner, Tunnel};
use crate::http1;
use crate::listener;
use crate::logging::ErrorLogger;
use crate::pump::{self, FlowTap};

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

pub struct ForwardProxyServer {
  pub store: Arc<dyn ConfigStore>,
  pub bridge: Arc<dyn Bridge>,
  pub ip_auth_cache: Arc<IpAuthCache>,
  pub logger: ErrorLogger,
  pub tunnel_id: u64,
}

impl ForwardProxyServer {
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
      .notice(format!("http forward proxy {}: listening on {addr}", self.tunnel_id))
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

  async fn handle(&self, mut stream: TcpStream, peer_addr: SocketAddr) {
    let Some(tunnel) = self.store.tunnel(self.tunnel_id) else {
      return;
    };
    let Some(client) = self.store.client(tunnel.client_id) else {
      self.logger.notice("forward proxy: tunnel references unknown client").await;
      return;
    };

    let glob = self.store.global();
    let policy = RouteAuthPolicy {
      bypass_global_password: tunnel.bypass_global_password,
      check_basic_auth: true,
    };

    let decision = admission::admit(peer_addr.ip(), &glob, &client, policy);
    let whitelisted = matches!(decision, AdmitDecision::WhitelistBypass);
    match decision {
      AdmitDecision::WhitelistBypass | AdmitDecision::Admitted => {}
      AdmitDecision::NeedsPasswordCheck => match admission::check_password(peer_addr.ip(), &self.ip_auth_cache).await {
        Ok(()) => {}
        Err(_) => return,
      },
      AdmitDecision::Denied(_) => return,
    }

    // Gate 5: acquired exactly once for the life of this connection.
    // Whitelisted peers bypass it entirely (§4.2); the guard is only built
    // once a slot is actually held, so its `Drop` never over-releases.
    let _release_guard = if whitelisted {
      None
    } else {
      match admission::acquire_slot(&client) {
        Ok(()) => Some(ConnectionGuard { client: &client }),
        Err(reason) => {
          self
            .logger
            .trace(format!("forward proxy: quota denied for {}: {reason}", peer_addr.ip()))
            .await;
          return;
        }
      }
    };

    let head = match http1::read_request_head(&mut stream, true).await {
      Ok(Some(head)) => head,
      _ => return,
    };

    if !whitelisted {
      let provided = admission::parse_basic_auth(http1::header_value(&head.headers, "authorization"));
      if admission::check_basic_auth(&client, provided).is_err() {
        let _ = http1::write_response(
          &mut stream,
          401,
          "Unauthorized",
          &[("WWW-Authenticate", "Basic realm=\"restricted\"".to_string())],
          b"401 Unauthorized",
        )
        .await;
        return;
      }
    }

    let target = match parse_target(&head) {
      Some(target) => target,
      None => {
        let _ = http1::write_response(&mut stream, 400, "Bad Request", &[], b"nps 404").await;
        return;
      }
    };

    let link = LinkSpec {
      kind: LinkKind::Tcp,
      target_addr: target,
      crypt: client.crypt,
      compress: client.compress,
      caller_addr: peer_addr.to_string(),
      local_proxy: tunnel.local_proxy,
    };
    let upstream = match self.bridge.send_link_info(client.id, link).await {
      Ok(stream) => stream,
      Err(err) => {
        self.logger.warn(format!("forward proxy: upstream open failed: {err}")).await;
        let _ = http1::write_response(&mut stream, 502, "Bad Gateway", &[], b"nps 404").await;
        return;
      }
    };

    if head.method.eq_ignore_ascii_case("CONNECT") {
      if stream.write_all(CONNECT_ESTABLISHED).await.is_err() {
        return;
      }
      // `head.leftover` may already hold client bytes sent right after the
      // CONNECT request without waiting for `200`; those must be replayed
      // onto the upstream stream rather than dropped.
      let tap = FlowTap::new(vec![
        Arc::new(TunnelFlowHandle { tunnel: tunnel.clone() }) as Arc<dyn FlowOwner>,
        client.clone() as Arc<dyn FlowOwner>,
      ]);
      let mut upstream = upstream;
      if !head.leftover.is_empty() && upstream.write_all(&head.leftover).await.is_err() {
        return;
      }
      pump::run(stream, upstream, tap, client.rate_limit_bytes_per_sec, self.logger.clone()).await;
    } else {
      // Absolute-URI request: replay the already-read request line/headers
      // onto the upstream connection verbatim, then pump the rest opaquely.
      let tap = FlowTap::new(vec![
        Arc::new(TunnelFlowHandle { tunnel: tunnel.clone() }) as Arc<dyn FlowOwner>,
        client.clone() as Arc<dyn FlowOwner>,
      ]);
      let mut rendered = format!("{} {} HTTP/1.{}\r\n", head.method, head.path, head.version);
      for (name, value) in &head.headers {
        rendered.push_str(name);
        rendered.push_str(": ");
        rendered.push_str(value);
        rendered.push_str("\r\n");
      }
      rendered.push_str("\r\n");
      rendered.push_str(&String::from_utf8_lossy(&head.leftover));
      let mut upstream = upstream;
      if upstream.write_all(rendered.as_bytes()).await.is_err() {
        return;
      }
      pump::run(stream, upstream, tap, client.rate_limit_bytes_per_sec, self.logger.clone()).await;
    }
  }
}

/// Releases the client's connection slot on drop, so every early-return
/// path above still frees it exactly once. Only constructed once gate 5 has
/// actually acquired a slot — whitelisted connections never hold one.
struct ConnectionGuard<'a> {
  client: &'a Arc<Client>,
}

impl Drop for ConnectionGuard<'_> {
  fn drop(&mut self) {
    self.client.release_connection();
  }
}

/// Extracts the dial target from a `CONNECT host:port` request line, or
/// from an absolute-URI request's `Host` header / URI authority otherwise.
fn parse_target(head: &http1::RequestHead) -> Option<String> {
  if head.method.eq_ignore_ascii_case("CONNECT") {
    return Some(head.path.clone());
  }
  if let Some(rest) = head.path.strip_prefix("http://").or_else(|| head.path.strip_prefix("https://")) {
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    if !authority.is_empty() {
      return Some(with_default_port(authority));
    }
  }
  http1::header_value(&head.headers, "host").map(with_default_port)
}

fn with_default_port(authority: &str) -> String {
  if authority.contains(':') {
    authority.to_string()
  } else {
    format!("{authority}:80")
  }
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

  fn head(method: &str, path: &str, headers: Vec<(&str, &str)>) -> http1::RequestHead {
    http1::RequestHead {
      method: method.to_string(),
      path: path.to_string(),
      version: 1,
      headers: headers.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
      leftover: Vec::new(),
    }
  }

  #[test]
  fn connect_target_is_the_request_path_verbatim() {
    let h = head("CONNECT", "example.com:443", vec![]);
    assert_eq!(parse_target(&h), Some("example.com:443".to_string()));
  }

  #[test]
  fn absolute_uri_target_is_extracted_from_path() {
    let h = head("GET", "http://example.com/index.html", vec![]);
    assert_eq!(parse_target(&h), Some("example.com:80".to_string()));
  }

  #[test]
  fn absolute_uri_with_explicit_port_is_preserved() {
    let h = head("GET", "http://example.com:8080/index.html", vec![]);
    assert_eq!(parse_target(&h), Some("example.com:8080".to_string()));
  }

  #[test]
  fn falls_back_to_host_header_for_origin_form_requests() {
    let h = head("GET", "/index.html", vec![("Host", "example.com")]);
    assert_eq!(parse_target(&h), Some("example.com:80".to_string()));
  }

  #[test]
  fn no_target_available_is_none() {
    let h = head("GET", "/index.html", vec![]);
    assert_eq!(parse_target(&h), None);
  }
}
