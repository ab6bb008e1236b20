//! The global-password challenge endpoint (§4.3): the one piece of the
//! (otherwise out-of-scope) web management UI this crate must serve itself,
//! since the admission controller's password gate redirects straight to it.
//!
//! `GET /nps_global_auth` renders the password form; `POST /nps_global_auth`
//! checks the submitted password against `Glob::global_password` and, on
//! success, authenticates the caller's IP in the shared [`IpAuthCache`]
//! before redirecting back to `return_url`.
//!
//! Served with `hyper::server::conn::http1` + `service_fn`, the same
//! building blocks the reference codebase's main listener uses
//! (`server.rs`), since this endpoint is ordinary request/response HTTP
//! with no need for the vhost proxy's raw-socket hijacking.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;

use crate::auth::ip_cache::IpAuthCache;
use crate::config::ConfigStore;
use crate::listener;
use crate::logging::ErrorLogger;

const CHALLENGE_PATH: &str = "/nps_global_auth";

pub struct ChallengeServer {
  pub store: Arc<dyn ConfigStore>,
  pub ip_auth_cache: Arc<IpAuthCache>,
  pub logger: ErrorLogger,
}

impl ChallengeServer {
  pub async fn run(self: Arc<Self>, bind_addr: SocketAddr) -> std::io::Result<()> {
    let tcp_listener = listener::bind(bind_addr).await?;
    self.logger.notice(format!("auth challenge endpoint: listening on {bind_addr}")).await;

    let this = self.clone();
    listener::serve(tcp_listener, self.logger.clone(), move |stream, peer_addr| {
      let this = this.clone();
      async move {
        let io = TokioIo::new(stream);
        let this2 = this.clone();
        let result = hyper::server::conn::http1::Builder::new()
          .serve_connection(
            io,
            service_fn(move |req| {
              let this = this2.clone();
              async move { Ok::<_, Infallible>(this.handle(req, peer_addr).await) }
            }),
          )
          .await;
        if let Err(err) = result {
          this.logger.trace(format!("challenge endpoint: connection error: {err}")).await;
        }
      }
    })
    .await;
    Ok(())
  }

  async fn handle(&self, req: Request<Incoming>, peer_addr: SocketAddr) -> Response<Full<Bytes>> {
    if !req.uri().path().starts_with(CHALLENGE_PATH) {
      return not_found();
    }
    match *req.method() {
      Method::GET => self.serve_form(req),
      Method::POST => self.handle_submit(req, peer_addr).await,
      _ => not_found(),
    }
  }

  fn serve_form(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let query = req.uri().query().unwrap_or("");
    let params = parse_form(query);
    let return_url = params.get("return_url").cloned().unwrap_or_default();
    let error = params.get("error").cloned();
    html_response(StatusCode::OK, &render_form(&return_url, error.as_deref()))
  }

  async fn handle_submit(&self, req: Request<Incoming>, peer_addr: SocketAddr) -> Response<Full<Bytes>> {
    let body = match req.into_body().collect().await {
      Ok(collected) => collected.to_bytes(),
      Err(_) => return bad_request(),
    };
    let params = parse_form(std::str::from_utf8(&body).unwrap_or(""));
    let return_url = params.get("return_url").cloned().unwrap_or_default();
    let submitted_password = params.get("password").cloned().unwrap_or_default();

    let glob = self.store.global();
    if !glob.password_required() || submitted_password == glob.global_password {
      if glob.password_required() {
        self.ip_auth_cache.authenticate(peer_addr.ip()).await;
      }
      return redirect(&return_url);
    }

    let retry = format!(
      "{CHALLENGE_PATH}?error={}&return_url={}",
      urlencoding::encode("密码错误"),
      urlencoding::encode(&return_url),
    );
    redirect(&retry)
  }
}

fn render_form(return_url: &str, error: Option<&str>) -> String {
  let error_html = match error {
    Some(message) => format!("<p class=\"error\">{}</p>", html_escape(message)),
    None => String::new(),
  };
  format!(
    "<!doctype html><html><head><meta charset=\"utf-8\"><title>Authentication required</title></head><body>\
     {error_html}\
     <form method=\"post\" action=\"{CHALLENGE_PATH}\">\
     <input type=\"hidden\" name=\"return_url\" value=\"{return_url}\">\
     <input type=\"password\" name=\"password\" placeholder=\"Password\">\
     <button type=\"submit\">Continue</button>\
     </form></body></html>",
    return_url = html_escape(return_url),
  )
}

fn html_escape(s: &str) -> String {
  s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

fn parse_form(input: &str) -> std::collections::HashMap<String, String> {
  input
    .split('&')
    .filter(|pair| !pair.is_empty())
    .filter_map(|pair| {
      let (key, value) = pair.split_once('=')?;
      let key = urlencoding::decode(key).ok()?.into_owned();
      let value = urlencoding::decode(value).ok()?.into_owned();
      Some((key, value))
    })
    .collect()
}

fn html_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
  Response::builder()
    .status(status)
    .header("Content-Type", "text/html; charset=utf-8")
    .body(Full::new(Bytes::from(body.to_string())))
    .unwrap()
}

fn redirect(location: &str) -> Response<Full<Bytes>> {
  Response::builder()
    .status(StatusCode::FOUND)
    .header("Location", location)
    .body(Full::new(Bytes::new()))
    .unwrap()
}

fn not_found() -> Response<Full<Bytes>> {
  Response::builder()
    .status(StatusCode::NOT_FOUND)
    .body(Full::new(Bytes::from_static(b"nps 404")))
    .unwrap()
}

fn bad_request() -> Response<Full<Bytes>> {
  Response::builder()
    .status(StatusCode::BAD_REQUEST)
    .body(Full::new(Bytes::new()))
    .unwrap()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_url_encoded_form_pairs() {
    let parsed = parse_form("password=s3cret&return_url=http%3A%2F%2Fa%2F");
    assert_eq!(parsed.get("password"), Some(&"s3cret".to_string()));
    assert_eq!(parsed.get("return_url"), Some(&"http://a/".to_string()));
  }

  #[test]
  fn renders_hidden_return_url_and_optional_error() {
    let html = render_form("http://a/", Some("密码错误"));
    assert!(html.contains("name=\"return_url\" value=\"http://a/\""));
    assert!(html.contains("密码错误"));
  }

  #[test]
  fn escapes_html_special_characters_in_return_url() {
    let html = render_form("\"><script>", None);
    assert!(!html.contains("<script>"));
    assert!(html.contains("&lt;script&gt;"));
  }
}
