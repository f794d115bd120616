//! Answer cache: keyed by `(qname, qtype)`, storing reply bytes ready to
//! replay verbatim except for the transaction id, with TTL-based expiry.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct DnsCacheEntry {
    reply_bytes: Vec<u8>,
    expires_at: Instant,
}

impl DnsCacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

type CacheKey = (String, u16);

/// A TTL-aware, capacity-bounded cache. Eviction beyond capacity is
/// insertion-order (oldest key evicted first) rather than true access-order
/// LRU: tracking per-read recency under a lock-free concurrent map would
/// need its own synchronization, and insertion order already bounds memory
/// the same way true LRU would for this workload's query pattern.
pub struct DnsCache {
    entries: DashMap<CacheKey, DnsCacheEntry>,
    order: Mutex<VecDeque<CacheKey>>,
    capacity: usize,
}

impl DnsCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, qname: &str, qtype: u16) -> Option<Vec<u8>> {
        let key = (qname.to_ascii_lowercase(), qtype);
        match self.entries.get(&key) {
            Some(entry) if !entry.is_expired() => Some(entry.reply_bytes.clone()),
            Some(_) => {
                drop(self.entries.remove(&key));
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, qname: &str, qtype: u16, reply_bytes: Vec<u8>, ttl: Duration) {
        let key = (qname.to_ascii_lowercase(), qtype);
        let entry = DnsCacheEntry { reply_bytes, expires_at: Instant::now() + ttl };
        let is_new = self.entries.insert(key.clone(), entry).is_none();
        if is_new {
            let mut order = self.order.lock().expect("dns cache order lock poisoned");
            order.push_back(key);
            while order.len() > self.capacity {
                if let Some(oldest) = order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.order.lock().expect("dns cache order lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get_round_trips_case_insensitively() {
        let cache = DnsCache::new(10);
        cache.insert("example.com", 1, vec![1, 2, 3], Duration::from_secs(60));
        assert_eq!(cache.get("example.com", 1), Some(vec![1, 2, 3]));
        assert_eq!(cache.get("EXAMPLE.com", 1), Some(vec![1, 2, 3]));
        assert_eq!(cache.get("example.com", 28), None);
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache = DnsCache::new(10);
        cache.insert("example.com", 1, vec![1], Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("example.com", 1), None);
    }

    #[test]
    fn capacity_evicts_oldest_insertion() {
        let cache = DnsCache::new(2);
        cache.insert("a.com", 1, vec![1], Duration::from_secs(60));
        cache.insert("b.com", 1, vec![2], Duration::from_secs(60));
        cache.insert("c.com", 1, vec![3], Duration::from_secs(60));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a.com", 1), None);
        assert!(cache.get("b.com", 1).is_some());
        assert!(cache.get("c.com", 1).is_some());
    }

    #[test]
    fn clear_empties_cache() {
        let cache = DnsCache::new(10);
        cache.insert("a.com", 1, vec![1], Duration::from_secs(60));
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}
