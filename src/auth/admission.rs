//! The admission controller (§4.2): the ordered gate every front-end runs an
//! inbound connection through before dialing upstream.
//!
//! Gate order, strict and load-bearing (see `SPEC_FULL.md` §4.2 and the
//! upstream `ProcessTunnel`/`ProcessHttp`/`handleHttp`): global whitelist
//! (bypasses everything) → global blacklist → per-client blacklist → global
//! password → flow/connection quota → HTTP Basic auth.

use std::net::IpAddr;
use std::sync::Arc;

use crate::config::{Client, CompiledGlob};

use super::ip_cache::IpAuthCache;

// Note: `admit()` below decides only whether the password gate is *due*
// (comparing the route policy against `glob.password_required()`); the
// actual cache lookup is async and lives in `check_password`, called
// separately when `admit` returns `NeedsPasswordCheck`.

/// Why an admission attempt was denied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionDenied {
  #[error("ip is blacklisted")]
  Blacklisted,
  #[error("global password authentication required")]
  PasswordRequired,
  #[error("traffic exceeded")]
  FlowExceeded,
  #[error("connections exceed the current client limit")]
  ConnLimit,
  #[error("401 unauthorized")]
  BasicAuthFailed,
}

/// Per-route override of the global password gate (`Tunnel`/`Host` both
/// carry this flag independently).
#[derive(Debug, Clone, Copy)]
pub struct RouteAuthPolicy {
  pub bypass_global_password: bool,
  /// HTTP Basic auth is only meaningful on HTTP-shaped front-ends; TCP
  /// passthrough never evaluates it.
  pub check_basic_auth: bool,
}

/// Extracted `Authorization: Basic` credentials, if present and well-formed.
pub fn parse_basic_auth(header_value: Option<&str>) -> Option<(String, String)> {
  let value = header_value?;
  let encoded = value.strip_prefix("Basic ")?;
  let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded).ok()?;
  let decoded = String::from_utf8(decoded).ok()?;
  let (user, pass) = decoded.split_once(':')?;
  Some((user.to_string(), pass.to_string()))
}

/// Runs gates 1-4 (whitelist through global password). Gate 5 (flow/
/// connection quota) is a separate, explicit step — see [`acquire_slot`] —
/// since unlike gates 1-4 it is not safe to re-evaluate on every request of
/// a keep-alive connection: it mutates `Client`'s connection counter, and
/// must be paired 1:1 with a release. Gate 6 is [`check_basic_auth`].
pub fn admit(peer_ip: IpAddr, glob: &CompiledGlob, client: &Client, policy: RouteAuthPolicy) -> AdmitDecision {
  if glob.white_ips.contains(peer_ip) {
    return AdmitDecision::WhitelistBypass;
  }

  if glob.black_ips.contains(peer_ip) || client.black_ip_list.contains(peer_ip) {
    return AdmitDecision::Denied(AdmissionDenied::Blacklisted);
  }

  if !policy.bypass_global_password && glob.password_required() {
    return AdmitDecision::NeedsPasswordCheck;
  }

  AdmitDecision::Admitted
}

/// Gate 5: flow/connection quota. Callers must invoke this exactly once per
/// admitted connection "epoch" — once per TCP tunnel/forward-proxy
/// connection, or once per virtual-host keep-alive connection's bind to a
/// given host — and release the acquired slot exactly once in turn (a
/// `Drop`-based guard, as in `tcp_tunnel.rs`'s `ConnectionGuard`, is the
/// easiest way to guarantee that pairing). Never call this per HTTP request
/// inside a keep-alive loop: re-running it there acquires a slot that is
/// never matched by a release, permanently inflating the client's
/// connection count. Whitelisted connections (`AdmitDecision::WhitelistBypass`)
/// bypass this gate entirely and must not call it at all.
pub fn acquire_slot(client: &Client) -> Result<(), AdmissionDenied> {
  if client.flow.exceeded() {
    return Err(AdmissionDenied::FlowExceeded);
  }
  if !client.acquire_connection() {
    return Err(AdmissionDenied::ConnLimit);
  }
  Ok(())
}

/// Outcome of the synchronous portion of [`admit`]. `NeedsPasswordCheck`
/// defers to [`check_password`] since the IP-auth cache lookup is async.
#[derive(Debug)]
pub enum AdmitDecision {
  WhitelistBypass,
  Admitted,
  NeedsPasswordCheck,
  Denied(AdmissionDenied),
}

/// Completes gate 4 once the whitelist/blacklist gates have already passed.
/// Call this when [`admit`] returns [`AdmitDecision::NeedsPasswordCheck`].
/// Quota (gate 5) is not checked here; call [`acquire_slot`] separately.
pub async fn check_password(peer_ip: IpAddr, ip_auth_cache: &Arc<IpAuthCache>) -> Result<(), AdmissionDenied> {
  if ip_auth_cache.is_authenticated(peer_ip).await {
    return Ok(());
  }
  Err(AdmissionDenied::PasswordRequired)
}

/// Gate 6: HTTP Basic auth, evaluated only when the client configured
/// credentials (empty credentials disable the check entirely, matching the
/// upstream `auth()` helper's `u != "" && p != ""` guard).
pub fn check_basic_auth(client: &Client, provided: Option<(String, String)>) -> Result<(), AdmissionDenied> {
  match &client.basic_auth {
    None => Ok(()),
    Some((expected_user, expected_pass)) => {
      if expected_user.is_empty() && expected_pass.is_empty() {
        return Ok(());
      }
      match provided {
        Some((user, pass)) if &user == expected_user && &pass == expected_pass => Ok(()),
        _ => Err(AdmissionDenied::BasicAuthFailed),
      }
    }
  }
}
