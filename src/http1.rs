//! Minimal raw HTTP/1.1 message framing shared by the virtual-host reverse
//! proxy (§4.4) and the HTTP forward proxy (§4.6).
//!
//! The vhost proxy hijacks the raw socket rather than going through hyper's
//! `Service` model (it needs to rebind the upstream mid-connection and tap
//! the exact byte count written, which a `Service` abstracts away), so both
//! front-ends parse just enough of the request/response head themselves —
//! using `httparse`, already in the dependency graph for this reason — and
//! otherwise treat bodies as opaque byte runs.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 64;

/// A parsed request head plus the exact bytes it spanned (needed to
/// reconstruct/rewrite the request line and headers before forwarding) and
/// any trailing bytes read past the head terminator (already-buffered body
/// data that must be replayed before continuing to stream the rest).
#[derive(Debug)]
pub struct RequestHead {
  pub method: String,
  pub path: String,
  pub version: u8,
  pub headers: Vec<(String, String)>,
  pub leftover: Vec<u8>,
}

#[derive(Debug)]
pub struct ResponseHead {
  pub version: u8,
  pub status: u16,
  pub reason: String,
  pub headers: Vec<(String, String)>,
  /// The exact bytes of the status line and headers (response heads are
  /// forwarded verbatim, never rewritten, unlike request heads).
  pub raw: Vec<u8>,
  pub leftover: Vec<u8>,
}

/// One tolerated input-corruption case (SPEC_FULL.md §4.4.1, §9): the first
/// byte of the method is sometimes dropped by the upstream byte source,
/// yielding `ET `/`OST ` instead of `GET `/`POST `. Gated behind a flag since
/// the rewrite is a tolerated quirk, not guaranteed-correct behavior.
pub fn tolerate_method_corruption(buf: &mut Vec<u8>) {
  if buf.starts_with(b"ET ") {
    buf.splice(0..0, *b"G");
  } else if buf.starts_with(b"OST ") {
    buf.splice(0..0, *b"P");
  }
}

/// Reads bytes from `reader` until a complete request head (request line +
/// headers + terminating blank line) has been buffered, then parses it.
/// Returns `Ok(None)` if the connection closed before any bytes arrived (the
/// ordinary end of a keep-alive connection); returns `Err` for a dirty close
/// mid-head or a head too large to be a legitimate request.
pub async fn read_request_head(
  reader: &mut (impl AsyncRead + Unpin),
  tolerate_method_corruption_quirk: bool,
) -> io::Result<Option<RequestHead>> {
  let mut buf = Vec::with_capacity(1024);
  let head_end = loop {
    if let Some(end) = find_head_end(&buf) {
      break end;
    }
    if buf.len() > MAX_HEAD_SIZE {
      return Err(io::Error::new(io::ErrorKind::InvalidData, "request head too large"));
    }
    let mut chunk = [0u8; 4096];
    let n = reader.read(&mut chunk).await?;
    if n == 0 {
      if buf.is_empty() {
        return Ok(None);
      }
      return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated request head"));
    }
    buf.extend_from_slice(&chunk[..n]);
  };

  if tolerate_method_corruption_quirk {
    tolerate_method_corruption(&mut buf);
  }
  // Re-scan: the quirk rewrite shifts the head end by one byte.
  let head_end = find_head_end(&buf).unwrap_or(head_end);
  let leftover = buf.split_off(head_end);

  let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
  let mut parsed = httparse::Request::new(&mut header_storage);
  match parsed
    .parse(&buf)
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
  {
    httparse::Status::Complete(_) => {}
    httparse::Status::Partial => {
      return Err(io::Error::new(io::ErrorKind::InvalidData, "incomplete request head"));
    }
  }

  let method = parsed.method.unwrap_or("").to_string();
  let path = parsed.path.unwrap_or("").to_string();
  let version = parsed.version.unwrap_or(1);
  let headers = parsed
    .headers
    .iter()
    .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
    .collect();

  Ok(Some(RequestHead {
    method,
    path,
    version,
    headers,
    leftover,
  }))
}

pub async fn read_response_head(reader: &mut (impl AsyncRead + Unpin)) -> io::Result<Option<ResponseHead>> {
  let mut buf = Vec::with_capacity(1024);
  loop {
    if let Some(head_end) = find_head_end(&buf) {
      let leftover = buf.split_off(head_end);
      let raw = buf.clone();
      let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
      let mut parsed = httparse::Response::new(&mut header_storage);
      match parsed
        .parse(&buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
      {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
          return Err(io::Error::new(io::ErrorKind::InvalidData, "incomplete response head"));
        }
      }
      let version = parsed.version.unwrap_or(1);
      let status = parsed.code.unwrap_or(502);
      let reason = parsed.reason.unwrap_or("").to_string();
      let headers = parsed
        .headers
        .iter()
        .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
        .collect();
      return Ok(Some(ResponseHead {
        version,
        status,
        reason,
        headers,
        raw,
        leftover,
      }));
    }
    if buf.len() > MAX_HEAD_SIZE {
      return Err(io::Error::new(io::ErrorKind::InvalidData, "response head too large"));
    }
    let mut chunk = [0u8; 4096];
    let n = reader.read(&mut chunk).await?;
    if n == 0 {
      if buf.is_empty() {
        return Ok(None);
      }
      return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated response head"));
    }
    buf.extend_from_slice(&chunk[..n]);
  }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
  buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// How a message body is framed, derived from its headers.
#[derive(Debug, Clone, Copy)]
pub enum BodyFraming {
  ContentLength(u64),
  Chunked,
  /// No declared length; for requests this means "no body". For responses
  /// read under HTTP/1.0 semantics or with neither header, the body runs
  /// until the connection closes.
  None,
  UntilClose,
}

pub fn body_framing(headers: &[(String, String)], is_response: bool) -> BodyFraming {
  if let Some(te) = header_value(headers, "transfer-encoding") {
    if te.to_ascii_lowercase().contains("chunked") {
      return BodyFraming::Chunked;
    }
  }
  if let Some(len) = header_value(headers, "content-length") {
    if let Ok(n) = len.trim().parse::<u64>() {
      return BodyFraming::ContentLength(n);
    }
  }
  if is_response {
    BodyFraming::UntilClose
  } else {
    BodyFraming::None
  }
}

/// Copies a message body from `reader` to `writer`, honoring `framing` and
/// accounting every byte written (including the leftover bytes already
/// buffered by the head reader) via `on_bytes`. Returns once the body is
/// fully forwarded.
pub async fn copy_body(
  reader: &mut (impl AsyncRead + Unpin),
  writer: &mut (impl AsyncWrite + Unpin),
  framing: BodyFraming,
  leftover: Vec<u8>,
  mut on_bytes: impl FnMut(u64),
) -> io::Result<()> {
  match framing {
    BodyFraming::None => {
      if !leftover.is_empty() {
        // A pipelined next request may already be sitting in `leftover`;
        // the caller is responsible for re-parsing it as the next head, so
        // a bodyless message must not consume it here. Forwarding nothing.
      }
      Ok(())
    }
    BodyFraming::ContentLength(total) => {
      let mut remaining = total;
      let mut leftover = leftover;
      if !leftover.is_empty() {
        let take = (leftover.len() as u64).min(remaining) as usize;
        writer.write_all(&leftover[..take]).await?;
        on_bytes(take as u64);
        remaining -= take as u64;
        leftover.drain(..take);
      }
      let mut buf = [0u8; 16 * 1024];
      while remaining > 0 {
        let want = (buf.len() as u64).min(remaining) as usize;
        let n = reader.read(&mut buf[..want]).await?;
        if n == 0 {
          return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated body"));
        }
        writer.write_all(&buf[..n]).await?;
        on_bytes(n as u64);
        remaining -= n as u64;
      }
      Ok(())
    }
    BodyFraming::UntilClose => {
      if !leftover.is_empty() {
        writer.write_all(&leftover).await?;
        on_bytes(leftover.len() as u64);
      }
      let mut buf = [0u8; 16 * 1024];
      loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
          return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        on_bytes(n as u64);
      }
    }
    BodyFraming::Chunked => copy_chunked_body(reader, writer, leftover, &mut on_bytes).await,
  }
}

/// Forwards a chunked body verbatim (chunk-size lines, chunk data, and the
/// terminating zero-size chunk with its trailers), since the pump only
/// needs faithful byte accounting, not decoded content.
async fn copy_chunked_body(
  reader: &mut (impl AsyncRead + Unpin),
  writer: &mut (impl AsyncWrite + Unpin),
  leftover: Vec<u8>,
  on_bytes: &mut impl FnMut(u64),
) -> io::Result<()> {
  let mut buf = leftover;
  loop {
    let line_end = read_until_crlf(reader, &mut buf).await?;
    let size_line = std::str::from_utf8(&buf[..line_end.saturating_sub(2)])
      .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 chunk size"))?;
    let size_str = size_line.split(';').next().unwrap_or("").trim();
    let size = u64::from_str_radix(size_str, 16)
      .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed chunk size"))?;

    writer.write_all(&buf[..line_end]).await?;
    on_bytes(line_end as u64);
    buf.drain(..line_end);

    if size == 0 {
      // Trailers: zero or more header lines followed by a blank line.
      loop {
        let trailer_end = read_until_crlf(reader, &mut buf).await?;
        writer.write_all(&buf[..trailer_end]).await?;
        on_bytes(trailer_end as u64);
        let is_blank = trailer_end == 2;
        buf.drain(..trailer_end);
        if is_blank {
          break;
        }
      }
      return Ok(());
    }

    let chunk_and_crlf = size as usize + 2;
    while buf.len() < chunk_and_crlf {
      let mut chunk = [0u8; 16 * 1024];
      let n = reader.read(&mut chunk).await?;
      if n == 0 {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated chunk"));
      }
      buf.extend_from_slice(&chunk[..n]);
    }
    writer.write_all(&buf[..chunk_and_crlf]).await?;
    on_bytes(chunk_and_crlf as u64);
    buf.drain(..chunk_and_crlf);
  }
}

/// Ensures `buf` contains at least one full CRLF-terminated line at its
/// front, reading more from `reader` as needed, and returns that line's
/// length (including the CRLF).
async fn read_until_crlf(reader: &mut (impl AsyncRead + Unpin), buf: &mut Vec<u8>) -> io::Result<usize> {
  loop {
    if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
      return Ok(pos + 2);
    }
    let mut chunk = [0u8; 4096];
    let n = reader.read(&mut chunk).await?;
    if n == 0 {
      return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated chunk line"));
    }
    buf.extend_from_slice(&chunk[..n]);
  }
}

/// Reads a full `Content-Length`-framed body into memory (used by the
/// response-cache population path, where the body must be held long enough
/// to both forward it and store a copy — everywhere else bodies are
/// streamed straight through via [`copy_body`]).
pub async fn read_full_body(
  reader: &mut (impl AsyncRead + Unpin),
  leftover: Vec<u8>,
  total: u64,
) -> io::Result<Vec<u8>> {
  let mut body = leftover;
  body.truncate(total as usize);
  while (body.len() as u64) < total {
    let mut chunk = [0u8; 16 * 1024];
    let want = chunk.len().min((total - body.len() as u64) as usize);
    let n = reader.read(&mut chunk[..want]).await?;
    if n == 0 {
      return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated body"));
    }
    body.extend_from_slice(&chunk[..n]);
  }
  Ok(body)
}

/// Writes a complete, self-contained HTTP/1.1 response (status line, headers
/// plus `Content-Length`, and body) to `writer`. Used for every response this
/// crate originates itself rather than forwards (redirects, canned failure
/// bodies, 401s) rather than proxied upstream responses.
pub async fn write_response(
  writer: &mut (impl AsyncWrite + Unpin),
  status: u16,
  reason: &str,
  headers: &[(&str, String)],
  body: &[u8],
) -> io::Result<()> {
  let mut head = format!("HTTP/1.1 {status} {reason}\r\n");
  for (name, value) in headers {
    head.push_str(&format!("{name}: {value}\r\n"));
  }
  head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
  writer.write_all(head.as_bytes()).await?;
  writer.write_all(body).await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn reads_simple_get_request_head() {
    let mut input: &[u8] = b"GET /a?b=1 HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n";
    let head = read_request_head(&mut input, true).await.unwrap().unwrap();
    assert_eq!(head.method, "GET");
    assert_eq!(head.path, "/a?b=1");
    assert_eq!(header_value(&head.headers, "host"), Some("example.com"));
    assert!(head.leftover.is_empty());
  }

  #[tokio::test]
  async fn keeps_leftover_bytes_past_the_head() {
    let mut input: &[u8] = b"POST /x HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc";
    let head = read_request_head(&mut input, true).await.unwrap().unwrap();
    assert_eq!(head.leftover, b"abc");
  }

  #[tokio::test]
  async fn clean_eof_before_any_bytes_is_none() {
    let mut input: &[u8] = b"";
    assert!(read_request_head(&mut input, true).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn method_corruption_quirk_restores_get_and_post() {
    let mut get_input: &[u8] = b"ET / HTTP/1.1\r\nHost: a\r\n\r\n";
    let head = read_request_head(&mut get_input, true).await.unwrap().unwrap();
    assert_eq!(head.method, "GET");

    let mut post_input: &[u8] = b"OST / HTTP/1.1\r\nHost: a\r\n\r\n";
    let head = read_request_head(&mut post_input, true).await.unwrap().unwrap();
    assert_eq!(head.method, "POST");
  }

  #[tokio::test]
  async fn method_corruption_quirk_disabled_leaves_malformed_request() {
    let mut input: &[u8] = b"ET / HTTP/1.1\r\nHost: a\r\n\r\n";
    let err = read_request_head(&mut input, false).await.unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::InvalidData);
  }

  #[tokio::test]
  async fn copies_content_length_body_including_leftover() {
    let head_and_body = b"ignored-head\r\n\r\nhello world";
    let mut reader: &[u8] = &head_and_body[14..][11..]; // nothing left to read after leftover
    let leftover = b"hello ".to_vec();
    let mut out = Vec::new();
    let mut total = 0u64;
    copy_body(
      &mut reader,
      &mut out,
      BodyFraming::ContentLength(11),
      leftover,
      |n| total += n,
    )
    .await
    .unwrap();
    assert_eq!(out, b"hello world");
    assert_eq!(total, 11);
  }

  #[tokio::test]
  async fn read_full_body_combines_leftover_and_remaining_bytes() {
    let mut reader: &[u8] = b"world";
    let body = read_full_body(&mut reader, b"hello ".to_vec(), 11).await.unwrap();
    assert_eq!(body, b"hello world");
  }

  #[tokio::test]
  async fn write_response_renders_status_line_headers_and_body() {
    let mut out = Vec::new();
    write_response(&mut out, 302, "Found", &[("Location", "https://a/x".to_string())], b"")
      .await
      .unwrap();
    let rendered = String::from_utf8(out).unwrap();
    assert!(rendered.starts_with("HTTP/1.1 302 Found\r\n"));
    assert!(rendered.contains("Location: https://a/x\r\n"));
    assert!(rendered.contains("Content-Length: 0\r\n\r\n"));
  }

  #[tokio::test]
  async fn copies_chunked_body_verbatim() {
    let chunked = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
    let mut reader: &[u8] = chunked;
    let mut out = Vec::new();
    let mut total = 0u64;
    copy_body(&mut reader, &mut out, BodyFraming::Chunked, Vec::new(), |n| total += n)
      .await
      .unwrap();
    assert_eq!(out, chunked);
    assert_eq!(total, chunked.len() as u64);
  }
}
