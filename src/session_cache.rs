//! Bounded cache of per-session bandwidth
//!
//! When a stream disappears from a snapshot its final bitrate may already be
//! gone from the server's reporting. This cache remembers the last known
//! bitrate per session id so the departure handler can still size the hold.
//! Stale entries are swept on every write; when the soft cap is exceeded the
//! oldest entries are evicted first.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

const DEFAULT_MAX_ENTRIES: usize = 1000;
const DEFAULT_MAX_AGE_SECS: i64 = 3600;

#[derive(Clone, Debug)]
struct CacheEntry {
    bitrate_mbps: f64,
    stored_at: DateTime<Utc>,
}

/// Bounded session-id to last-known-bitrate map
#[derive(Debug)]
pub struct SessionBandwidthCache {
    entries: HashMap<String, CacheEntry>,
    max_entries: usize,
    max_age: Duration,
}

impl Default for SessionBandwidthCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES, DEFAULT_MAX_AGE_SECS)
    }
}

impl SessionBandwidthCache {
    /// Create a cache with an entry cap and a maximum entry age in seconds
    pub fn new(max_entries: usize, max_age_secs: i64) -> Self {
        Self {
            entries: HashMap::new(),
            max_entries,
            max_age: Duration::seconds(max_age_secs),
        }
    }

    /// Record the latest bitrate for a session.
    ///
    /// Sweeps stale entries and enforces the entry cap before inserting.
    pub fn store(&mut self, session_id: &str, bitrate_mbps: f64, now: DateTime<Utc>) {
        self.sweep(now);
        self.entries.insert(
            session_id.to_string(),
            CacheEntry {
                bitrate_mbps,
                stored_at: now,
            },
        );
    }

    /// Last known bitrate for a session, if still cached
    pub fn get(&self, session_id: &str) -> Option<f64> {
        self.entries.get(session_id).map(|e| e.bitrate_mbps)
    }

    /// Drop a session's entry (after its departure has been handled)
    pub fn remove(&mut self, session_id: &str) -> Option<f64> {
        self.entries.remove(session_id).map(|e| e.bitrate_mbps)
    }

    /// Number of cached sessions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no sessions are cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn sweep(&mut self, now: DateTime<Utc>) {
        let max_age = self.max_age;
        self.entries.retain(|session_id, entry| {
            let fresh = now - entry.stored_at <= max_age;
            if !fresh {
                tracing::debug!(session_id = %session_id, "dropped stale session bandwidth entry");
            }
            fresh
        });

        // Evict oldest entries when over the cap
        if self.entries.len() > self.max_entries {
            let excess = self.entries.len() - self.max_entries;
            let mut by_age: Vec<(String, DateTime<Utc>)> = self
                .entries
                .iter()
                .map(|(id, e)| (id.clone(), e.stored_at))
                .collect();
            by_age.sort_by_key(|(_, stored_at)| *stored_at);
            for (session_id, _) in by_age.into_iter().take(excess) {
                self.entries.remove(&session_id);
                tracing::warn!(session_id = %session_id, "evicted session bandwidth entry at size cap");
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn base_time() -> DateTime<Utc> {
        "2025-06-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_store_and_get() {
        let mut cache = SessionBandwidthCache::default();
        cache.store("s1", 28.5, base_time());
        assert_eq!(cache.get("s1"), Some(28.5));
        assert_eq!(cache.get("s2"), None);
    }

    #[test]
    fn test_store_overwrites() {
        let mut cache = SessionBandwidthCache::default();
        let now = base_time();
        cache.store("s1", 10.0, now);
        cache.store("s1", 24.0, now + Duration::seconds(5));
        assert_eq!(cache.get("s1"), Some(24.0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stale_entries_swept_on_write() {
        let mut cache = SessionBandwidthCache::new(100, 3600);
        let now = base_time();
        cache.store("old", 5.0, now);
        // An hour and a bit later, writing any entry sweeps the stale one
        cache.store("new", 7.0, now + Duration::seconds(3601));
        assert_eq!(cache.get("old"), None);
        assert_eq!(cache.get("new"), Some(7.0));
    }

    #[test]
    fn test_lru_eviction_at_cap() {
        let mut cache = SessionBandwidthCache::new(3, 3600);
        let now = base_time();
        cache.store("a", 1.0, now);
        cache.store("b", 2.0, now + Duration::seconds(1));
        cache.store("c", 3.0, now + Duration::seconds(2));
        cache.store("d", 4.0, now + Duration::seconds(3));

        // "a" was oldest and the cap is 3
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("d"), Some(4.0));
    }

    #[test]
    fn test_remove_returns_bitrate() {
        let mut cache = SessionBandwidthCache::default();
        cache.store("s1", 12.0, base_time());
        assert_eq!(cache.remove("s1"), Some(12.0));
        assert_eq!(cache.remove("s1"), None);
        assert!(cache.is_empty());
    }
}
