//! The bidirectional copy pump (§4.7): moves bytes between a downstream
//! socket and an upstream stream obtained from the bridge, metering both
//! directions onto every [`crate::config::FlowOwner`] the caller taps and
//! optionally throttling to a client's configured byte rate.
//!
//! Concurrency shape follows §5: the downstream->upstream direction runs on
//! the caller's task, the upstream->downstream direction is spawned onto its
//! own task, and the first side to finish (EOF or error) triggers the other
//! half to shut down so both sockets are closed before `run` returns.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::FlowOwner;
use crate::logging::ErrorLogger;

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Taps a set of entities' [`crate::config::Flow`] counters for one pump
/// run. Cheaply cloneable so the upstream->downstream task can carry its own
/// copy independent of the downstream->upstream direction.
#[derive(Clone)]
pub struct FlowTap {
  owners: Arc<Vec<Arc<dyn FlowOwner>>>,
}

impl FlowTap {
  pub fn new(owners: Vec<Arc<dyn FlowOwner>>) -> Self {
    Self {
      owners: Arc::new(owners),
    }
  }

  /// Downstream -> upstream bytes (`Flow::InletFlow` in the data model).
  fn add_inlet(&self, n: u64) {
    if n == 0 {
      return;
    }
    for owner in self.owners.iter() {
      owner.flow().add(n, 0);
    }
  }

  /// Upstream -> downstream bytes (`Flow::ExportFlow` in the data model).
  fn add_export(&self, n: u64) {
    if n == 0 {
      return;
    }
    for owner in self.owners.iter() {
      owner.flow().add(0, n);
    }
  }
}

/// A simple byte-rate limiter: a fixed-size allowance refilled once per
/// second. `0` means unlimited. Grounded on the same fixed-window-then-reset
/// shape as request-rate throttles elsewhere in the corpus, applied to byte
/// counts instead of request counts.
pub struct RateLimiter {
  bytes_per_sec: u64,
  window_started: Instant,
  used_in_window: u64,
}

impl RateLimiter {
  pub fn new(bytes_per_sec: u64) -> Self {
    Self {
      bytes_per_sec,
      window_started: Instant::now(),
      used_in_window: 0,
    }
  }

  pub fn unlimited() -> Self {
    Self::new(0)
  }

  /// Accounts for `n` bytes just transferred, sleeping if this pushes the
  /// current one-second window over budget.
  async fn throttle(&mut self, n: u64) {
    if self.bytes_per_sec == 0 {
      return;
    }
    let elapsed = self.window_started.elapsed();
    if elapsed >= Duration::from_secs(1) {
      self.window_started = Instant::now();
      self.used_in_window = 0;
    }
    self.used_in_window += n;
    if self.used_in_window > self.bytes_per_sec {
      tokio::time::sleep(Duration::from_secs(1).saturating_sub(elapsed)).await;
      self.window_started = Instant::now();
      self.used_in_window = 0;
    }
  }
}

/// Runs the bidirectional pump until either side closes or errors. Both
/// halves of both streams are guaranteed closed (via `shutdown`) before this
/// returns, satisfying the "both sides closed on return" invariant in §4.7.
pub async fn run(
  downstream: impl AsyncRead + AsyncWrite + Unpin + Send + 'static,
  upstream: Box<dyn crate::bridge::UpstreamStream>,
  tap: FlowTap,
  client_rate_limit_bytes_per_sec: u64,
  logger: ErrorLogger,
) {
  // Split each stream into owned read/write halves so one direction can be
  // driven from a spawned task while the other stays on the caller's task.
  let (down_read, down_write) = tokio::io::split(downstream);
  let (up_read, up_write) = tokio::io::split(upstream);
  run_halves(down_read, down_write, up_read, up_write, tap, client_rate_limit_bytes_per_sec, logger).await
}

/// The same pump, taking already-split halves. Used directly by the
/// virtual-host proxy's WebSocket upgrade delegate (§4.4), which has already
/// split the downstream socket to serialize HTTP requests on it and must
/// hand the same halves to the raw byte pump once the upgrade response is
/// forwarded, without rejoining them into a single stream first.
pub async fn run_halves(
  mut down_read: impl AsyncRead + Unpin + Send + 'static,
  mut down_write: impl AsyncWrite + Unpin + Send + 'static,
  mut up_read: impl AsyncRead + Unpin + Send + 'static,
  mut up_write: impl AsyncWrite + Unpin + Send + 'static,
  tap: FlowTap,
  client_rate_limit_bytes_per_sec: u64,
  logger: ErrorLogger,
) {
  let export_tap = tap.clone();
  let mut export_limiter = RateLimiter::new(client_rate_limit_bytes_per_sec);
  let mut inlet_limiter = RateLimiter::new(client_rate_limit_bytes_per_sec);

  let upstream_to_downstream = tokio::spawn(async move {
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
      let n = match up_read.read(&mut buf).await {
        Ok(0) => break,
        Ok(n) => n,
        Err(_) => break,
      };
      export_limiter.throttle(n as u64).await;
      if down_write.write_all(&buf[..n]).await.is_err() {
        break;
      }
      export_tap.add_export(n as u64);
    }
    let _ = down_write.shutdown().await;
  });

  let mut buf = vec![0u8; COPY_BUF_SIZE];
  loop {
    let n = match down_read.read(&mut buf).await {
      Ok(0) => break,
      Ok(n) => n,
      Err(err) => {
        logger.trace(format!("pump: downstream read error: {err}")).await;
        break;
      }
    };
    inlet_limiter.throttle(n as u64).await;
    if let Err(err) = up_write.write_all(&buf[..n]).await {
      logger.trace(format!("pump: upstream write error: {err}")).await;
      break;
    }
    tap.add_inlet(n as u64);
  }
  let _ = up_write.shutdown().await;

  // Dropping `down_read` (by returning) closes the downstream read half;
  // wait for the other direction to notice EOF/close and wind down too.
  let _ = upstream_to_downstream.await;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{Client, Flow, Host};
  use crate::util::ip_set::IpSet;
  use tokio::io::{duplex, AsyncReadExt as _, AsyncWriteExt as _};
  use tokio::net::{TcpListener, TcpStream};

  fn make_client() -> Arc<Client> {
    Arc::new(Client::new(1, "k", 0, Flow::default(), 10, 0, IpSet::new(), None, false, false))
  }

  #[tokio::test]
  async fn pumps_bytes_both_directions_and_meters_flow() {
    let client = make_client();
    let tap = FlowTap::new(vec![client.clone() as Arc<dyn FlowOwner>]);

    // Downstream: an in-memory duplex pair, one half driven by `run`, the
    // other by the test acting as "the real client socket".
    let (down_here, down_there) = duplex(1024);

    // Upstream: a real loopback listener standing in for the bridge, as
    // suggested by SPEC_FULL.md's test-tooling section.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let upstream_task = tokio::spawn(async move {
      let (mut sock, _) = listener.accept().await.unwrap();
      let mut buf = [0u8; 5];
      sock.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"hello");
      sock.write_all(b"world").await.unwrap();
    });
    let upstream_conn = TcpStream::connect(addr).await.unwrap();

    let pump_task = tokio::spawn(run(
      down_there,
      Box::new(upstream_conn),
      tap,
      0,
      ErrorLogger::discard(),
    ));

    let mut down_here = down_here;
    down_here.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    down_here.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");
    drop(down_here);

    upstream_task.await.unwrap();
    pump_task.await.unwrap();

    assert_eq!(client.flow.inlet_flow.load(std::sync::atomic::Ordering::Relaxed), 5);
    assert_eq!(client.flow.export_flow.load(std::sync::atomic::Ordering::Relaxed), 5);
  }

  #[test]
  fn flow_tap_adds_to_every_tapped_owner() {
    let client = Arc::new(Client::new(1, "k", 0, Flow::default(), 10, 0, IpSet::new(), None, false, false));
    let host = Arc::new(Host {
      id: 1,
      host_pattern: "a".into(),
      path_location: None,
      scheme: crate::config::HostScheme::All,
      targets: vec![],
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
    let tap = FlowTap::new(vec![client.clone() as Arc<dyn FlowOwner>, host.clone() as Arc<dyn FlowOwner>]);
    tap.add_inlet(10);
    tap.add_export(3);
    assert_eq!(client.flow.inlet_flow.load(std::sync::atomic::Ordering::Relaxed), 10);
    assert_eq!(host.flow.export_flow.load(std::sync::atomic::Ordering::Relaxed), 3);
  }
}
