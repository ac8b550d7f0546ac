//! Strongly-typed TTL caches for resolved routing state
//!
//! The gateway keeps two independent caches: a long-TTL one mapping
//! repository clone URLs to resolved namespaces, and a medium-TTL one
//! mapping session/idled cookie values to routing records. Both are safe
//! for concurrent access from request handlers; absence of an entry is
//! always a valid state and triggers re-resolution upstream.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// A denormalized routing record derived from a resolved namespace.
///
/// Owned exclusively by whichever cache entry holds it; replaced on
/// re-resolution, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    /// API URL of the cluster hosting the pod
    pub cluster_url: String,
    /// Pod/namespace name within the cluster
    pub namespace: String,
    /// Backend route host the pod is served on
    pub route: String,
    /// URL scheme for the backend route
    pub scheme: String,
}

impl CacheItem {
    /// Base URL of the backend route
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme, self.route)
    }
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A concurrent key-value cache with per-cache TTL.
///
/// Entries expire lazily on read; [`purge_expired`](Self::purge_expired)
/// sweeps the rest. Population races between workers resolving the same
/// missing key are tolerated, last writer wins.
pub struct TtlCache<V: Clone> {
    entries: DashMap<String, Entry<V>>,
    ttl: Duration,
}

impl<V: Clone> TtlCache<V> {
    /// Create a new cache whose entries live for `ttl` after insertion
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Look up a key, dropping the entry if it has expired
    pub fn get(&self, key: &str) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => {
                if entry.expires_at > Instant::now() {
                    return Some(entry.value.clone());
                }
                true
            }
            None => false,
        };

        if expired {
            self.entries.remove(key);
            debug!(key, "Cache entry expired on read");
        }
        None
    }

    /// Insert or replace an entry, stamping a fresh expiry
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.entries.insert(
            key.into(),
            Entry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Remove an entry. Returns true if one was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop all entries whose TTL has elapsed
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Number of entries currently held (including not-yet-purged expired ones)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(ns: &str) -> CacheItem {
        CacheItem {
            cluster_url: "https://api.cluster1.example.com".to_string(),
            namespace: ns.to_string(),
            route: format!("jenkins-{}.cluster1.example.com", ns),
            scheme: "https".to_string(),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("abc123", item("acme-jenkins"));

        let got = cache.get("abc123").expect("entry present");
        assert_eq!(got.namespace, "acme-jenkins");
        assert_eq!(got.url(), "https://jenkins-acme-jenkins.cluster1.example.com");
    }

    #[test]
    fn test_missing_key_is_none() {
        let cache: TtlCache<CacheItem> = TtlCache::new(Duration::from_secs(60));
        assert!(cache.get("nope").is_none());
    }

    #[test]
    fn test_expired_entry_dropped_on_read() {
        let cache = TtlCache::new(Duration::from_millis(0));
        cache.insert("abc123", item("acme-jenkins"));

        assert!(cache.get("abc123").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_entry() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("abc123", item("acme-jenkins"));
        cache.insert("abc123", item("other-jenkins"));

        assert_eq!(cache.get("abc123").unwrap().namespace, "other-jenkins");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("abc123", item("acme-jenkins"));

        assert!(cache.remove("abc123"));
        assert!(!cache.remove("abc123"));
        assert!(cache.get("abc123").is_none());
    }

    #[test]
    fn test_purge_expired() {
        let cache = TtlCache::new(Duration::from_millis(0));
        cache.insert("a", item("a"));
        cache.insert("b", item("b"));

        cache.purge_expired();
        assert!(cache.is_empty());
    }
}
