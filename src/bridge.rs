//! The seam to the (out-of-scope) bridge: the multiplexer that carries
//! logical links to remote agents over a single control connection per
//! client. This crate only consumes [`Bridge`]; it never implements the
//! multiplexing itself.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport kind for a requested logical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
  Tcp,
  Http,
}

/// Specification for one logical stream to be opened through the bridge.
#[derive(Debug, Clone)]
pub struct LinkSpec {
  pub kind: LinkKind,
  pub target_addr: String,
  pub crypt: bool,
  pub compress: bool,
  /// The original caller's address, carried through for the remote agent's
  /// own access logging — not used for any local admission decision.
  pub caller_addr: String,
  pub local_proxy: bool,
}

/// A duplex byte stream to the chosen upstream target, as handed back by the
/// bridge. Object-safe so call sites can hold `Box<dyn UpstreamStream>`
/// regardless of the concrete transport (plain TCP, a multiplexed bridge
/// substream, or a test double).
pub trait UpstreamStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamStream for T {}

/// Opens logical links to a client's remote agent. Implemented by the
/// out-of-scope bridge; a direct-dial implementation is provided here for
/// standalone use and tests where no multiplexed agent exists.
#[async_trait]
pub trait Bridge: Send + Sync {
  async fn send_link_info(
    &self,
    client_id: u64,
    link: LinkSpec,
  ) -> anyhow::Result<Box<dyn UpstreamStream>>;
}

/// Dials the link target directly over TCP, bypassing any agent
/// multiplexing. Useful for local testing and for deployments that proxy
/// straight to a fixed backend rather than through a remote agent.
pub struct DirectDialBridge;

#[async_trait]
impl Bridge for DirectDialBridge {
  async fn send_link_info(
    &self,
    _client_id: u64,
    link: LinkSpec,
  ) -> anyhow::Result<Box<dyn UpstreamStream>> {
    let stream = tokio::net::TcpStream::connect(&link.target_addr).await?;
    Ok(Box::new(stream))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncWriteExt;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn direct_dial_bridge_connects_to_target() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut sock, _) = listener.accept().await.unwrap();
      sock.write_all(b"hello").await.unwrap();
    });

    let bridge = DirectDialBridge;
    let mut stream = bridge
      .send_link_info(
        1,
        LinkSpec {
          kind: LinkKind::Tcp,
          target_addr: addr.to_string(),
          crypt: false,
          compress: false,
          caller_addr: "1.2.3.4:5".into(),
          local_proxy: false,
        },
      )
      .await
      .unwrap();

    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
  }
}
