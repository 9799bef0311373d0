//! Short-TTL response cache (C10, spec §4.10), keyed by query shape rather
//! than by entity id — e.g. `"engines"`, `"streams:active"`, `"vpn_status"`.
//! Grounded on the same cache-entry/TTL shape as `ace_docker::cache`,
//! generalized from one fixed value type to an arbitrary `serde_json::Value`
//! per key, since each query shape serializes to a different response body.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::Mutex;

struct CacheEntry {
    value: Value,
    cached_at: Instant,
}

pub struct ResponseCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.lock().await;
        let entry = entries.get(key)?;
        if entry.cached_at.elapsed() > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    pub async fn put(&self, key: impl Into<String>, value: Value) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drops every cached response. Called on any engine add/remove,
    /// forwarded-engine change, or emergency mode transition, since every
    /// one of those can change the shape of a cached list or status view.
    pub async fn invalidate_all(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn invalidate(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn expired_entry_is_not_returned() {
        let cache = ResponseCache::new(Duration::from_millis(10));
        cache.put("engines", json!({"count": 1})).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get("engines").await.is_none());
    }

    #[tokio::test]
    async fn invalidate_all_clears_every_key() {
        let cache = ResponseCache::new(Duration::from_secs(5));
        cache.put("engines", json!([])).await;
        cache.put("vpn_status", json!({})).await;
        cache.invalidate_all().await;
        assert!(cache.get("engines").await.is_none());
        assert!(cache.get("vpn_status").await.is_none());
    }
}
