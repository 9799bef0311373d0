//! Short-TTL cache for container inspect results, to cut down on redundant
//! Docker API calls from the health monitor and autoscaler during a single
//! scheduling tick.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bollard::models::ContainerInspectResponse;
use tokio::sync::RwLock;

struct CacheEntry {
    data: ContainerInspectResponse,
    timestamp: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.timestamp.elapsed() > ttl
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub inspect_ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            inspect_ttl: Duration::from_secs(5),
            max_entries: 2000,
        }
    }
}

pub struct ContainerCache {
    inspect_cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    config: CacheConfig,
}

impl ContainerCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inspect_cache: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub async fn get_inspect(&self, container: &str) -> Option<ContainerInspectResponse> {
        let cache = self.inspect_cache.read().await;
        cache.get(container).and_then(|entry| {
            if entry.is_expired(self.config.inspect_ttl) {
                None
            } else {
                Some(entry.data.clone())
            }
        })
    }

    pub async fn put_inspect(&self, container: &str, data: ContainerInspectResponse) {
        let mut cache = self.inspect_cache.write().await;
        if cache.len() >= self.config.max_entries {
            cache.retain(|_, entry| !entry.is_expired(self.config.inspect_ttl));
        }
        cache.insert(
            container.to_owned(),
            CacheEntry {
                data,
                timestamp: Instant::now(),
            },
        );
    }

    pub async fn invalidate(&self, container: &str) {
        self.inspect_cache.write().await.remove(container);
    }

    pub async fn cleanup_expired(&self) {
        let ttl = self.config.inspect_ttl;
        self.inspect_cache
            .write()
            .await
            .retain(|_, entry| !entry.is_expired(ttl));
    }
}

static CONTAINER_CACHE: once_cell::sync::Lazy<ContainerCache> =
    once_cell::sync::Lazy::new(|| ContainerCache::new(CacheConfig::default()));

pub fn get_container_cache() -> &'static ContainerCache {
    &CONTAINER_CACHE
}

pub fn start_cache_cleanup_task() {
    tokio::spawn(async {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            CONTAINER_CACHE.cleanup_expired().await;
        }
    });
}
