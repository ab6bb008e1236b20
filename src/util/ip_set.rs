use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr};

/// A pre-normalized set of IP addresses, used for both the global/per-client
/// blacklists and the global whitelist.
///
/// Built once from the literal address list at config load time rather than
/// re-sorting on every membership check.
#[derive(Debug, Clone, Default)]
pub struct IpSet {
  entries: HashSet<IpAddr>,
}

impl IpSet {
  pub fn new() -> Self {
    Self {
      entries: HashSet::new(),
    }
  }

  /// Builds a set from a list of literal IP strings, tolerating and skipping
  /// unparsable entries rather than failing the whole load.
  pub fn load_from_vec(ip_list: &[String]) -> Self {
    let mut entries = HashSet::with_capacity(ip_list.len());
    for ip_str in ip_list {
      match ip_str.as_str() {
        "localhost" => {
          entries.insert(Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 1).into());
        }
        _ => {
          if let Ok(ip) = ip_str.parse::<IpAddr>() {
            entries.insert(ip.to_canonical());
          }
        }
      }
    }
    Self { entries }
  }

  pub fn contains(&self, ip: IpAddr) -> bool {
    self.entries.contains(&ip.to_canonical())
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn membership() {
    let set = IpSet::load_from_vec(&["192.168.1.1".into(), "10.0.0.1".into()]);

    assert!(set.contains("192.168.1.1".parse().unwrap()));
    assert!(set.contains("10.0.0.1".parse().unwrap()));
    assert!(!set.contains("8.8.8.8".parse().unwrap()));
  }

  #[test]
  fn localhost_alias_matches_loopback_v6() {
    let set = IpSet::load_from_vec(&["localhost".into()]);
    assert!(set.contains("::1".parse().unwrap()));
  }

  #[test]
  fn ipv4_mapped_ipv6_canonicalizes_to_ipv4() {
    let set = IpSet::load_from_vec(&["10.0.0.1".into()]);
    assert!(set.contains("::ffff:10.0.0.1".parse().unwrap()));
  }

  #[test]
  fn unparsable_entries_are_skipped_not_fatal() {
    let set = IpSet::load_from_vec(&["not-an-ip".into(), "1.2.3.4".into()]);
    assert!(set.contains("1.2.3.4".parse().unwrap()));
    assert!(!set.contains("9.9.9.9".parse().unwrap()));
  }
}
