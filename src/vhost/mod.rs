//! The virtual-host HTTP reverse proxy (§4.4): the largest single component.
//! Dispatches by `Host` header, runs the shared admission pipeline per
//! request (since a keep-alive connection may rebind to a different host
//! mid-stream), and either forwards request/response pairs one at a time
//! (§4.4.1/§4.4.2) or, on a WebSocket upgrade, hands the connection off to
//! the raw byte [`crate::pump`] for its remaining lifetime.
//!
//! This hijacks the raw socket directly with `httparse` rather than routing
//! through a `hyper::service::Service`, since a `Service` abstracts away the
//! exact byte counts and the ability to swap the upstream mid-connection
//! that host-rebinding and flow accounting both need.

pub mod cache;

use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::auth::admission::{self, AdmitDecision, AdmissionDenied, RouteAuthPolicy};
use crate::auth::ip_cache::IpAuthCache;
use crate::bridge::{Bridge, LinkKind, LinkSpec};
use crate::config::{Client, ConfigStore, FlowOwner, Host};
use crate::http1::{self, BodyFraming};
use crate::logging::ErrorLogger;
use crate::pump::{self, FlowTap};

use cache::ResponseCache;

/// Caps how large a response body the cache will hold in memory while
/// populating; larger bodies are still forwarded, just never cached.
const MAX_CACHEABLE_BODY: u64 = 256 * 1024;

pub struct VhostProxyConfig {
  pub tolerate_method_corruption: bool,
  /// Port the standalone auth challenge listener (§4.3) is bound to, used
  /// to construct the password-gate redirect URL.
  pub web_port: u16,
  pub response_cache_capacity: usize,
}

pub struct VhostProxy {
  pub store: Arc<dyn ConfigStore>,
  pub bridge: Arc<dyn Bridge>,
  pub ip_auth_cache: Arc<IpAuthCache>,
  pub logger: ErrorLogger,
  pub config: VhostProxyConfig,
  cache: ResponseCache,
}

impl VhostProxy {
  pub fn new(
    store: Arc<dyn ConfigStore>,
    bridge: Arc<dyn Bridge>,
    ip_auth_cache: Arc<IpAuthCache>,
    logger: ErrorLogger,
    config: VhostProxyConfig,
  ) -> Self {
    let cache = ResponseCache::new(config.response_cache_capacity);
    Self {
      store,
      bridge,
      ip_auth_cache,
      logger,
      config,
      cache,
    }
  }
}

type UpstreamRead = tokio::io::ReadHalf<Box<dyn crate::bridge::UpstreamStream>>;
type UpstreamWrite = tokio::io::WriteHalf<Box<dyn crate::bridge::UpstreamStream>>;

/// Drives one accepted connection through `Init -> Admitted -> Upstreamed ->
/// Pumping <-> RebindHost -> Closed` until the client disconnects or an
/// unrecoverable error occurs. Generic over the downstream transport so the
/// same state machine serves both the plain-HTTP and the SNI/TLS listener.
pub async fn handle_connection<S>(proxy: Arc<VhostProxy>, stream: S, peer_ip: IpAddr, is_tls: bool)
where
  S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
  let (mut down_read, mut down_write) = tokio::io::split(stream);

  let mut current_host_id: Option<u64> = None;
  // Holds the current host-epoch's acquired connection slot, if any (§4.2
  // gate 5). Acquired at most once per bind to a given host, never per
  // keep-alive request; whitelisted epochs hold none. Rebinding to a
  // different host drops the old guard before acquiring a new one, and the
  // final drop at connection close releases whatever epoch was still open.
  let mut epoch_guard: Option<EpochGuard> = None;
  let mut up_read: Option<UpstreamRead> = None;
  let mut up_write: Option<UpstreamWrite> = None;

  loop {
    let head = match http1::read_request_head(&mut down_read, proxy.config.tolerate_method_corruption).await {
      Ok(Some(head)) => head,
      Ok(None) => break,
      Err(err) => {
        proxy.logger.trace(format!("vhost: request parse error: {err}")).await;
        break;
      }
    };

    let host_header = http1::header_value(&head.headers, "host").unwrap_or("").to_string();
    let is_challenge_path = head.path.starts_with("/nps_global_auth");
    proxy
      .logger
      .trace(format!("vhost: {} {} Host: {host_header}", head.method, head.path))
      .await;

    let host = match proxy.store.find_host(&host_header, &head.path, is_tls) {
      Some(host) => host,
      None => {
        proxy
          .logger
          .notice(format!("vhost: no host match for {host_header}{}", head.path))
          .await;
        let _ = http1::write_response(&mut down_write, 404, "Not Found", &[], b"nps 404").await;
        break;
      }
    };
    let client = match proxy.store.client(host.client_id) {
      Some(client) => client,
      None => {
        proxy.logger.notice("vhost: host references unknown client").await;
        break;
      }
    };

    let glob = proxy.store.global();
    let policy = RouteAuthPolicy {
      bypass_global_password: host.bypass_global_password || is_challenge_path,
      check_basic_auth: true,
    };

    let decision = admission::admit(peer_ip, &glob, &client, policy);
    let whitelisted = matches!(decision, AdmitDecision::WhitelistBypass);
    match decision {
      AdmitDecision::WhitelistBypass | AdmitDecision::Admitted => {}
      AdmitDecision::NeedsPasswordCheck => match admission::check_password(peer_ip, &proxy.ip_auth_cache).await {
        Ok(()) => {}
        Err(AdmissionDenied::PasswordRequired) => {
          let redirect = build_redirect_url(is_tls, &host_header, proxy.config.web_port, &head.path);
          let _ = http1::write_response(&mut down_write, 302, "Found", &[("Location", redirect)], b"").await;
          continue;
        }
        Err(_) => break,
      },
      AdmitDecision::Denied(_) => break,
    }

    if !whitelisted {
      let provided = admission::parse_basic_auth(http1::header_value(&head.headers, "authorization"));
      if admission::check_basic_auth(&client, provided).is_err() {
        let _ = http1::write_response(
          &mut down_write,
          401,
          "Unauthorized",
          &[("WWW-Authenticate", "Basic realm=\"restricted\"".to_string())],
          b"401 Unauthorized",
        )
        .await;
        break;
      }
    }

    if host.auto_https && !is_tls {
      let hostname = host_header.split(':').next().unwrap_or(&host_header);
      let location = format!("https://{hostname}{}", head.path);
      let _ = http1::write_response(&mut down_write, 301, "Moved Permanently", &[("Location", location)], b"").await;
      break;
    }

    if current_host_id != Some(host.id) {
      // Rebinding to a different host (or binding for the first time):
      // release whichever slot the previous epoch held, then acquire gate 5
      // exactly once for the new one. Whitelisted peers bypass gate 5
      // entirely and hold no slot (§4.2). From here on every exit path —
      // basic-auth failure on a *later* request against this same host,
      // bridge-open failure below, pump completion, or connection close —
      // releases via `epoch_guard`'s `Drop` rather than a manual call.
      epoch_guard = None;
      up_read = None;
      up_write = None;

      if !whitelisted {
        if let Err(reason) = admission::acquire_slot(&client) {
          proxy.logger.trace(format!("vhost: quota denied for {peer_ip}: {reason}")).await;
          break;
        }
        epoch_guard = Some(EpochGuard { client: client.clone() });
      }

      let target = match host.random_target() {
        Some(target) => target.to_string(),
        None => {
          proxy.logger.notice("vhost: host has no configured targets").await;
          let _ = http1::write_response(&mut down_write, 502, "Bad Gateway", &[], b"nps 404").await;
          break;
        }
      };
      let link = LinkSpec {
        kind: LinkKind::Http,
        target_addr: target,
        crypt: client.crypt,
        compress: client.compress,
        caller_addr: peer_ip.to_string(),
        local_proxy: false,
      };
      match proxy.bridge.send_link_info(client.id, link).await {
        Ok(stream) => {
          let (r, w) = tokio::io::split(stream);
          up_read = Some(r);
          up_write = Some(w);
          current_host_id = Some(host.id);
        }
        Err(err) => {
          proxy.logger.warn(format!("vhost: upstream open failed: {err}")).await;
          let _ = http1::write_response(&mut down_write, 502, "Bad Gateway", &[], b"nps 404").await;
          break;
        }
      }
    }

    let is_upgrade = http1::header_value(&head.headers, "upgrade").is_some_and(|v| !v.is_empty());
    if is_upgrade {
      let bytes_written = forward_request_head(&host, peer_ip, &head, up_write.as_mut().unwrap())
        .await
        .is_ok();
      if !bytes_written {
        break;
      }
      let req_framing = http1::body_framing(&head.headers, false);
      let mut req_body_bytes = 0u64;
      if http1::copy_body(
        &mut down_read,
        up_write.as_mut().unwrap(),
        req_framing,
        head.leftover,
        |n| req_body_bytes += n,
      )
      .await
      .is_err()
      {
        break;
      }

      let resp = match http1::read_response_head(up_read.as_mut().unwrap()).await {
        Ok(Some(resp)) => resp,
        _ => break,
      };
      if down_write.write_all(&resp.raw).await.is_err() {
        break;
      }

      if resp.status == 101 {
        if down_write.write_all(&resp.leftover).await.is_err() {
          break;
        }
        let tap = FlowTap::new(vec![
          client.clone() as Arc<dyn FlowOwner>,
          host.clone() as Arc<dyn FlowOwner>,
        ]);
        pump::run_halves(
          down_read,
          down_write,
          up_read.unwrap(),
          up_write.unwrap(),
          tap,
          client.rate_limit_bytes_per_sec,
          proxy.logger.clone(),
        )
        .await;
        return;
      }
      // Upgrade was declined upstream: treat the rest of this message like
      // an ordinary response and keep serving requests on this connection.
      let resp_framing = http1::body_framing(&resp.headers, true);
      let mut resp_body_bytes = 0u64;
      let _ = http1::copy_body(up_read.as_mut().unwrap(), &mut down_write, resp_framing, resp.leftover, |n| {
        resp_body_bytes += n
      })
      .await;
      client.flow.add(req_body_bytes, resp_body_bytes);
      host.flow.add(req_body_bytes, resp_body_bytes);
      continue;
    }

    let cache_key = host.use_cache.then(|| ResponseCache::key(&host.host_pattern, &head.path));
    if let Some(key) = &cache_key {
      if let Some(cached) = proxy.cache.get(key) {
        let req_framing = http1::body_framing(&head.headers, false);
        let _ = http1::copy_body(&mut down_read, &mut tokio::io::sink(), req_framing, head.leftover, |_| {}).await;
        if down_write.write_all(&cached).await.is_err() {
          break;
        }
        client.flow.add(0, cached.len() as u64);
        host.flow.add(0, cached.len() as u64);
        let keep_alive = http1::header_value(&head.headers, "connection").is_some_and(|v| !v.eq_ignore_ascii_case("close"));
        if !keep_alive {
          break;
        }
        continue;
      }
    }

    let request_head_bytes = match forward_request_head(&host, peer_ip, &head, up_write.as_mut().unwrap()).await {
      Ok(n) => n,
      Err(_) => break,
    };
    let req_framing = http1::body_framing(&head.headers, false);
    let mut req_body_bytes = 0u64;
    if http1::copy_body(
      &mut down_read,
      up_write.as_mut().unwrap(),
      req_framing,
      head.leftover,
      |n| req_body_bytes += n,
    )
    .await
    .is_err()
    {
      break;
    }
    let request_bytes = request_head_bytes + req_body_bytes;
    client.flow.add(request_bytes, 0);
    host.flow.add(request_bytes, 0);

    let resp = match http1::read_response_head(up_read.as_mut().unwrap()).await {
      Ok(Some(resp)) => resp,
      Ok(None) => {
        proxy.logger.trace("vhost: upstream closed without a response").await;
        break;
      }
      Err(err) => {
        proxy.logger.trace(format!("vhost: response parse error: {err}")).await;
        break;
      }
    };

    if down_write.write_all(&resp.raw).await.is_err() {
      break;
    }
    let mut response_bytes = resp.raw.len() as u64;

    let resp_framing = http1::body_framing(&resp.headers, true);
    let cache_control = http1::header_value(&resp.headers, "cache-control");
    let can_cache = cache_key.is_some()
      && ResponseCache::is_cacheable(resp.status, cache_control)
      && matches!(resp_framing, BodyFraming::ContentLength(n) if n <= MAX_CACHEABLE_BODY);

    if can_cache {
      let BodyFraming::ContentLength(total) = resp_framing else {
        unreachable!("can_cache only set for ContentLength framing")
      };
      let body = match http1::read_full_body(up_read.as_mut().unwrap(), resp.leftover, total).await {
        Ok(body) => body,
        Err(err) => {
          proxy.logger.trace(format!("vhost: response body read error: {err}")).await;
          break;
        }
      };
      if down_write.write_all(&body).await.is_err() {
        break;
      }
      response_bytes += body.len() as u64;
      let mut full = resp.raw.clone();
      full.extend_from_slice(&body);
      proxy.cache.insert(cache_key.unwrap(), full);
    } else {
      let mut body_bytes = 0u64;
      if http1::copy_body(up_read.as_mut().unwrap(), &mut down_write, resp_framing, resp.leftover, |n| {
        body_bytes += n
      })
      .await
      .is_err()
      {
        client.flow.add(0, response_bytes);
        host.flow.add(0, response_bytes);
        break;
      }
      response_bytes += body_bytes;
    }
    client.flow.add(0, response_bytes);
    host.flow.add(0, response_bytes);

    let keep_alive = http1::header_value(&resp.headers, "connection").is_some_and(|v| !v.eq_ignore_ascii_case("close"));
    if !keep_alive {
      break;
    }
  }

  // `epoch_guard` drops here (whatever epoch was still open), releasing its
  // slot exactly once regardless of which path above broke the loop.
}

/// Releases the client's gate-5 connection slot when the vhost connection's
/// current host-epoch ends — on rebind to a different host, or on final
/// connection close. Constructed only when a slot was actually acquired;
/// whitelisted epochs hold none (§4.2) and leave this `None`.
struct EpochGuard {
  client: Arc<Client>,
}

impl Drop for EpochGuard {
  fn drop(&mut self) {
    self.client.release_connection();
  }
}

/// Rewrites `Host` (if configured), applies the host's header-rewrite rules,
/// appends the true peer to `X-Forwarded-For`, and writes the resulting
/// request line + headers to `writer`. Returns the number of bytes written.
async fn forward_request_head(
  host: &Host,
  peer_ip: IpAddr,
  head: &http1::RequestHead,
  writer: &mut (impl AsyncWrite + Unpin),
) -> std::io::Result<u64> {
  let mut headers = head.headers.clone();
  if let Some(rewrite) = &host.host_rewrite {
    set_header(&mut headers, "Host", rewrite.clone());
  }
  for (name, value) in &host.header_rewrites {
    set_header(&mut headers, name, value.clone());
  }
  append_forwarded_for(&mut headers, peer_ip);

  let mut rendered = format!("{} {} HTTP/1.{}\r\n", head.method, head.path, head.version);
  for (name, value) in &headers {
    rendered.push_str(name);
    rendered.push_str(": ");
    rendered.push_str(value);
    rendered.push_str("\r\n");
  }
  rendered.push_str("\r\n");
  let bytes = rendered.into_bytes();
  let len = bytes.len() as u64;
  tokio::io::AsyncWriteExt::write_all(writer, &bytes).await?;
  Ok(len)
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: String) {
  match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
    Some(entry) => entry.1 = value,
    None => headers.push((name.to_string(), value)),
  }
}

fn append_forwarded_for(headers: &mut Vec<(String, String)>, peer_ip: IpAddr) {
  let peer = peer_ip.to_string();
  match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case("x-forwarded-for")) {
    Some(entry) => entry.1 = format!("{}, {peer}", entry.1),
    None => headers.push(("X-Forwarded-For".to_string(), peer)),
  }
}

/// Builds the password-gate redirect target (§4.3): `{scheme}://{hostname
/// with port stripped}:{web_port}/nps_global_auth?return_url={original}`.
fn build_redirect_url(is_tls: bool, host_header: &str, web_port: u16, original_path: &str) -> String {
  let scheme = if is_tls { "https" } else { "http" };
  let hostname = host_header.split(':').next().unwrap_or(host_header);
  let original_url = format!("{scheme}://{host_header}{original_path}");
  format!(
    "{scheme}://{hostname}:{web_port}/nps_global_auth?return_url={}",
    urlencoding::encode(&original_url)
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bridge::DirectDialBridge;
  use crate::config::{Flow, Host, HostScheme, InMemoryConfigStore};
  use crate::util::ip_set::IpSet;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::{TcpListener, TcpStream};

  /// Accepts one connection and answers every `\r\n\r\n`-terminated request
  /// on it with a fixed keep-alive 200, until the client disconnects —
  /// enough to drive several requests through the same upstream link,
  /// mirroring what a real origin does across a vhost host-epoch.
  async fn spawn_keep_alive_echo_upstream(responses: usize) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut sock, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 4096];
      for _ in 0..responses {
        loop {
          let n = sock.read(&mut buf).await.unwrap();
          assert!(n > 0, "upstream connection closed early");
          if buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
          }
        }
        sock
          .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: keep-alive\r\n\r\nok")
          .await
          .unwrap();
      }
    });
    addr
  }

  fn single_slot_client(id: u64) -> Client {
    Client::new(id, "k", 0, Flow::default(), 1, 0, IpSet::new(), None, false, false)
  }

  fn sample_host(id: u64, client_id: u64, target: std::net::SocketAddr) -> Host {
    Host {
      id,
      host_pattern: "app.example".into(),
      path_location: None,
      scheme: HostScheme::All,
      targets: vec![target.to_string()],
      header_rewrites: Vec::new(),
      host_rewrite: None,
      client_id,
      cert_pem: None,
      key_pem: None,
      auto_https: false,
      bypass_global_password: false,
      use_cache: false,
      flow: Flow::default(),
    }
  }

  /// The bug this guards against: two keep-alive requests to the same host
  /// on one connection must acquire the client's (single) connection slot
  /// only once, not once per request — otherwise the second request would
  /// spuriously hit `ConnLimit` against a `max_connections: 1` client.
  #[tokio::test]
  async fn keep_alive_requests_to_same_host_share_one_quota_slot() {
    let upstream_addr = spawn_keep_alive_echo_upstream(2).await;

    let store = Arc::new(InMemoryConfigStore::new());
    store.add_client(single_slot_client(1));
    store.add_host(sample_host(1, 1, upstream_addr));

    let proxy = Arc::new(VhostProxy::new(
      store,
      Arc::new(DirectDialBridge),
      Arc::new(IpAuthCache::new(std::time::Duration::from_secs(60))),
      ErrorLogger::discard(),
      VhostProxyConfig {
        tolerate_method_corruption: false,
        web_port: 9000,
        response_cache_capacity: 0,
      },
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect_task = tokio::spawn(TcpStream::connect(addr));
    let (accepted, _) = listener.accept().await.unwrap();
    let mut down = connect_task.await.unwrap().unwrap();
    let peer_ip: IpAddr = "9.9.9.9".parse().unwrap();

    let handle_task = tokio::spawn(handle_connection(proxy, accepted, peer_ip, false));

    let request = b"GET / HTTP/1.1\r\nHost: app.example\r\nConnection: keep-alive\r\n\r\n";
    let mut buf = vec![0u8; 4096];
    for _ in 0..2 {
      down.write_all(request).await.unwrap();
      let n = down.read(&mut buf).await.unwrap();
      let response = String::from_utf8_lossy(&buf[..n]);
      assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {response}");
    }
    drop(down);

    handle_task.await.unwrap();
  }

  #[test]
  fn redirect_url_strips_port_from_hostname_but_keeps_it_in_return_url() {
    let url = build_redirect_url(false, "app.example:8080", 9000, "/a?b=1");
    assert_eq!(
      url,
      format!(
        "http://app.example:9000/nps_global_auth?return_url={}",
        urlencoding::encode("http://app.example:8080/a?b=1")
      )
    );
  }

  #[test]
  fn https_redirect_uses_https_scheme_on_both_legs() {
    let url = build_redirect_url(true, "app.example", 9000, "/");
    assert!(url.starts_with("https://app.example:9000/nps_global_auth"));
    assert!(url.contains(&urlencoding::encode("https://app.example/").into_owned()));
  }

  #[test]
  fn set_header_overrides_existing_case_insensitively() {
    let mut headers = vec![("host".to_string(), "old".to_string())];
    set_header(&mut headers, "Host", "new".to_string());
    assert_eq!(headers, vec![("host".to_string(), "new".to_string())]);
  }

  #[test]
  fn append_forwarded_for_creates_header_when_absent() {
    let mut headers = Vec::new();
    append_forwarded_for(&mut headers, "1.2.3.4".parse().unwrap());
    assert_eq!(headers, vec![("X-Forwarded-For".to_string(), "1.2.3.4".to_string())]);
  }

  #[test]
  fn append_forwarded_for_appends_to_existing_chain() {
    let mut headers = vec![("X-Forwarded-For".to_string(), "9.9.9.9".to_string())];
    append_forwarded_for(&mut headers, "1.2.3.4".parse().unwrap());
    assert_eq!(
      headers,
      vec![("X-Forwarded-For".to_string(), "9.9.9.9, 1.2.3.4".to_string())]
    );
  }
}
