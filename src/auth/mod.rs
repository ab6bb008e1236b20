//! The cross-cutting admission pipeline (§4.1-§4.3): the IP-authentication
//! cache and the gate sequence every front-end runs inbound connections
//! through before dialing upstream.

pub mod admission;
pub mod ip_cache;
