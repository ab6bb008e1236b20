//! The bounded response cache (§4.4.2): keyed by `{host}/{path}`, read on
//! the forward path before contacting upstream. Population policy is left a
//! tunable per §9's design note ("the source only reads from cache here");
//! this implementation populates from the upstream response when the host
//! opts in (`Host::use_cache`) and the response carries `Cache-Control:
//! public`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

struct Entry {
  bytes: Vec<u8>,
}

/// Fixed-capacity LRU, keyed by `{host_pattern}/{path}`.
pub struct ResponseCache {
  capacity: usize,
  entries: Mutex<(HashMap<String, Entry>, VecDeque<String>)>,
}

impl ResponseCache {
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      entries: Mutex::new((HashMap::new(), VecDeque::new())),
    }
  }

  pub fn key(host_pattern: &str, path: &str) -> String {
    format!("{host_pattern}/{path}")
  }

  pub fn get(&self, key: &str) -> Option<Vec<u8>> {
    if self.capacity == 0 {
      return None;
    }
    let mut guard = self.entries.lock().unwrap();
    let (map, order) = &mut *guard;
    let bytes = map.get(key)?.bytes.clone();
    order.retain(|k| k != key);
    order.push_back(key.to_string());
    Some(bytes)
  }

  pub fn insert(&self, key: String, bytes: Vec<u8>) {
    if self.capacity == 0 {
      return;
    }
    let mut guard = self.entries.lock().unwrap();
    let (map, order) = &mut *guard;
    if !map.contains_key(&key) && map.len() >= self.capacity {
      if let Some(evicted) = order.pop_front() {
        map.remove(&evicted);
      }
    }
    order.retain(|k| k != &key);
    order.push_back(key.clone());
    map.insert(key, Entry { bytes });
  }

  /// Whether a just-forwarded response is eligible for population: host
  /// opted in, response was a plain 200, and it advertised itself cacheable.
  pub fn is_cacheable(status: u16, cache_control: Option<&str>) -> bool {
    status == 200 && cache_control.is_some_and(|v| v.to_ascii_lowercase().contains("public"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stores_and_retrieves_by_composite_key() {
    let cache = ResponseCache::new(2);
    let key = ResponseCache::key("a.example", "/x");
    cache.insert(key.clone(), b"cached".to_vec());
    assert_eq!(cache.get(&key), Some(b"cached".to_vec()));
  }

  #[test]
  fn evicts_least_recently_used_when_over_capacity() {
    let cache = ResponseCache::new(2);
    cache.insert("a".into(), b"1".to_vec());
    cache.insert("b".into(), b"2".to_vec());
    // Touch "a" so "b" becomes the least-recently-used entry.
    assert!(cache.get("a").is_some());
    cache.insert("c".into(), b"3".to_vec());
    assert!(cache.get("b").is_none());
    assert!(cache.get("a").is_some());
    assert!(cache.get("c").is_some());
  }

  #[test]
  fn zero_capacity_disables_caching_entirely() {
    let cache = ResponseCache::new(0);
    cache.insert("a".into(), b"1".to_vec());
    assert!(cache.get("a").is_none());
  }

  #[test]
  fn cacheability_requires_200_and_public_cache_control() {
    assert!(ResponseCache::is_cacheable(200, Some("public, max-age=60")));
    assert!(!ResponseCache::is_cacheable(200, Some("private")));
    assert!(!ResponseCache::is_cacheable(200, None));
    assert!(!ResponseCache::is_cacheable(404, Some("public")));
  }
}
