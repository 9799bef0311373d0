//! State Store (C4, spec §4.4) — the single source of truth for engines,
//! streams, and forwarded-engine assignments.
//!
//! All mutation funnels through one `tokio::sync::Mutex<Inner>` (`state_lock`
//! in spec §5). No public method calls another public method while holding
//! the guard; shared logic lives in private functions over `&mut Inner`.
//! Side effects that must happen outside the lock (proxy-hook calls, port
//! release) are collected as plain data while the guard is held and executed
//! only after it drops — spec §9 calls this out explicitly, since Rust has
//! no reentrant mutex and several callers (C11, C6) would otherwise need to
//! re-enter a state operation from inside one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::warn;

use ace_net::PortAllocator;
use ace_types::{Engine, Stream, StreamStatSnapshot, StreamStatus};

use crate::error::{Result, StateError};
use crate::events::{StreamEndedEvent, StreamStartedEvent};
use crate::proxy_hook::ProxyHookRegistry;

/// Snapshots kept per stream before the oldest are dropped. The history is
/// diagnostic, not authoritative — the live stream record is — so this is
/// a bound on memory, not a correctness constraint.
const MAX_STAT_SNAPSHOTS_PER_STREAM: usize = 500;

struct Inner {
    engines: HashMap<String, Engine>,
    streams: HashMap<String, Stream>,
    /// vpn_container -> forwarded engine's container_id.
    forwarded: HashMap<String, String>,
    stats: HashMap<String, Vec<StreamStatSnapshot>>,
}

impl Inner {
    fn new() -> Self {
        Self {
            engines: HashMap::new(),
            streams: HashMap::new(),
            forwarded: HashMap::new(),
            stats: HashMap::new(),
        }
    }

    fn find_engine_by_host_port(&self, host: &str, port: u16) -> Option<String> {
        self.engines
            .values()
            .find(|e| e.host == host && e.port == port)
            .map(|e| e.container_id.clone())
    }

    fn active_stream_count(&self, engine_container_id: &str) -> usize {
        self.streams
            .values()
            .filter(|s| {
                s.engine_container_id == engine_container_id && s.status == StreamStatus::Started
            })
            .count()
    }
}

/// Outcome of `on_stream_ended`, carrying the side effects the caller must
/// run after the lock is released.
pub struct StreamEndedOutcome {
    pub stream_id: String,
    pub proxy_key: String,
    /// `true` when the owning engine now has zero active streams, so the
    /// Engine Health Monitor (C7) may consider it for cache cleanup.
    pub engine_now_idle: bool,
    /// `true` when the stream was already `Ended` before this call — a
    /// replayed `stream_ended` is a no-op, not a second transition (spec
    /// §4.9 ordering guarantee).
    pub already_ended: bool,
}

pub struct StateStore {
    inner: Mutex<Inner>,
    ports: Arc<PortAllocator>,
    hooks: ProxyHookRegistry,
    /// Streams per engine beyond which `on_stream_started` rejects a
    /// genuinely new stream. A replay of an already-open stream never
    /// counts against this, since it replaces its own slot rather than
    /// taking a new one. Mirrors `AceConfig.replicas.max_streams_per_engine`
    /// so C4's enforcement and C6's lookahead math never desync.
    max_streams_per_engine: usize,
}

impl StateStore {
    pub fn new(ports: Arc<PortAllocator>, hooks: ProxyHookRegistry, max_streams_per_engine: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            ports,
            hooks,
            max_streams_per_engine,
        }
    }

    pub async fn on_stream_started(&self, event: StreamStartedEvent) -> Result<Stream> {
        let stream_id = Stream::derive_id(
            &event.labels,
            &event.stream.key,
            &event.session.playback_session_id,
        );
        let now = Utc::now();

        let mut inner = self.inner.lock().await;

        let container_id = match &event.container_id {
            Some(id) if inner.engines.contains_key(id) => id.clone(),
            _ => match inner.find_engine_by_host_port(&event.engine.host, event.engine.port) {
                Some(id) => id,
                None => {
                    let id = event
                        .container_id
                        .clone()
                        .unwrap_or_else(|| format!("{}:{}", event.engine.host, event.engine.port));
                    let engine = Engine::new(
                        id.clone(),
                        id.clone(),
                        event.engine.host.clone(),
                        event.engine.port,
                    );
                    inner.engines.insert(id.clone(), engine);
                    id
                }
            },
        };

        let is_replay = inner.streams.contains_key(&stream_id);
        if !is_replay && inner.active_stream_count(&container_id) >= self.max_streams_per_engine {
            return Err(StateError::EngineAtCapacity(container_id));
        }

        let stream = Stream {
            id: stream_id.clone(),
            engine_container_id: container_id.clone(),
            key_type: event.stream.key_type,
            key: event.stream.key.clone(),
            playback_session_id: event.session.playback_session_id.clone(),
            stat_url: event.session.stat_url.clone(),
            command_url: event.session.command_url.clone(),
            is_live: event.session.is_live,
            started_at: now,
            ended_at: None,
            status: StreamStatus::Started,
            labels: event.labels.clone(),
        };
        inner.streams.insert(stream_id, stream.clone());

        if let Some(engine) = inner.engines.get_mut(&container_id) {
            engine.last_stream_usage = now;
            engine.last_seen = now;
        }

        Ok(stream)
    }

    pub async fn on_stream_ended(&self, event: StreamEndedEvent) -> Result<StreamEndedOutcome> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let stream_id = match (&event.stream_id, &event.container_id) {
            (Some(id), _) => id.clone(),
            (None, Some(container_id)) => inner
                .streams
                .values()
                .find(|s| {
                    s.engine_container_id == *container_id && s.status == StreamStatus::Started
                })
                .map(|s| s.id.clone())
                .ok_or_else(|| StateError::StreamNotFound(container_id.clone()))?,
            (None, None) => {
                return Err(StateError::StreamNotFound("<unspecified>".to_string()));
            }
        };

        let stream = inner
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| StateError::StreamNotFound(stream_id.clone()))?;
        let already_ended = stream.status == StreamStatus::Ended;
        if !already_ended {
            stream.end(now);
        }
        let proxy_key = stream.key.clone();
        let engine_id = stream.engine_container_id.clone();

        let engine_now_idle = inner.active_stream_count(&engine_id) == 0;
        drop(inner);

        if !already_ended {
            self.hooks.notify_stream_ended(&proxy_key).await;
        }

        Ok(StreamEndedOutcome {
            stream_id,
            proxy_key,
            engine_now_idle,
            already_ended,
        })
    }

    /// Registers a just-started engine (provisioner step 6, spec §4.5).
    /// When `engine.forwarded` is set, re-validates the forwarded-per-vpn
    /// invariant at insertion time rather than trusting the provisioner's
    /// earlier read, since another provisioner may have won the race in
    /// between.
    pub async fn register_engine(&self, engine: Engine) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if engine.forwarded {
            if let Some(vpn) = &engine.vpn_container {
                if let Some(existing) = inner.forwarded.get(vpn) {
                    if existing != &engine.container_id {
                        return Err(StateError::ForwardedAlreadyAssigned(vpn.clone()));
                    }
                }
                inner
                    .forwarded
                    .insert(vpn.clone(), engine.container_id.clone());
            }
        }
        inner.engines.insert(engine.container_id.clone(), engine);
        Ok(())
    }

    pub async fn set_forwarded_engine(
        &self,
        vpn_container: &str,
        container_id: &str,
        p2p_port: u32,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.forwarded.get(vpn_container) {
            if existing != container_id {
                return Err(StateError::ForwardedAlreadyAssigned(
                    vpn_container.to_string(),
                ));
            }
        }
        let engine = inner
            .engines
            .get_mut(container_id)
            .ok_or_else(|| StateError::EngineNotFound(container_id.to_string()))?;
        engine.forwarded = true;
        engine.p2p_port = Some(p2p_port);
        inner
            .forwarded
            .insert(vpn_container.to_string(), container_id.to_string());
        Ok(())
    }

    pub async fn has_forwarded_engine(&self, vpn_container: &str) -> bool {
        self.inner.lock().await.forwarded.contains_key(vpn_container)
    }

    pub async fn get_forwarded_engine_for_vpn(&self, vpn_container: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .forwarded
            .get(vpn_container)
            .cloned()
    }

    /// Removes an engine and cascades: all of its active streams end
    /// (proxy-notified), its forwarded slot clears if it held one, and its
    /// port returns to the pool. Returns the ended stream keys so the
    /// caller can observe what was torn down.
    pub async fn remove_engine(&self, container_id: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        let engine = inner
            .engines
            .remove(container_id)
            .ok_or_else(|| StateError::EngineNotFound(container_id.to_string()))?;

        let mut ended_keys = Vec::new();
        for stream in inner.streams.values_mut() {
            if stream.engine_container_id == container_id && stream.status == StreamStatus::Started
            {
                stream.end(now);
                ended_keys.push(stream.key.clone());
            }
        }

        if let Some(vpn) = &engine.vpn_container {
            if inner.forwarded.get(vpn) == Some(&container_id.to_string()) {
                inner.forwarded.remove(vpn);
            }
        }

        drop(inner);

        for key in &ended_keys {
            self.hooks.notify_stream_ended(key).await;
        }

        if let Some(vpn) = &engine.vpn_container {
            self.ports.release(vpn, engine.port).await;
        } else {
            self.ports.release(ace_net::GLOBAL_POOL, engine.port).await;
        }

        Ok(ended_keys)
    }

    pub async fn list_engines(&self) -> Vec<Engine> {
        self.inner.lock().await.engines.values().cloned().collect()
    }

    pub async fn get_engine(&self, container_id: &str) -> Result<Engine> {
        self.inner
            .lock()
            .await
            .engines
            .get(container_id)
            .cloned()
            .ok_or_else(|| StateError::EngineNotFound(container_id.to_string()))
    }

    pub async fn list_streams(&self) -> Vec<Stream> {
        self.inner.lock().await.streams.values().cloned().collect()
    }

    pub async fn get_stream(&self, stream_id: &str) -> Result<Stream> {
        self.inner
            .lock()
            .await
            .streams
            .get(stream_id)
            .cloned()
            .ok_or_else(|| StateError::StreamNotFound(stream_id.to_string()))
    }

    /// Records the outcome of a C7 liveness probe.
    pub async fn record_health_check(
        &self,
        container_id: &str,
        status: ace_types::HealthStatus,
        at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let engine = inner
            .engines
            .get_mut(container_id)
            .ok_or_else(|| StateError::EngineNotFound(container_id.to_string()))?;
        engine.health_status = status;
        engine.last_health_check = at;
        Ok(())
    }

    /// Records a completed C7 cache purge, including the freed-bytes
    /// estimate the caller measured before and after the purge.
    pub async fn record_cache_cleanup(
        &self,
        container_id: &str,
        cache_size_bytes: u64,
        at: chrono::DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let engine = inner
            .engines
            .get_mut(container_id)
            .ok_or_else(|| StateError::EngineNotFound(container_id.to_string()))?;
        engine.last_cache_cleanup = at;
        engine.cache_size_bytes = cache_size_bytes;
        Ok(())
    }

    /// Appends one stat sample for `snapshot.stream_id`, dropping the oldest
    /// once the per-stream history exceeds [`MAX_STAT_SNAPSHOTS_PER_STREAM`].
    pub async fn record_stat_snapshot(&self, snapshot: StreamStatSnapshot) {
        let mut inner = self.inner.lock().await;
        let history = inner.stats.entry(snapshot.stream_id.clone()).or_default();
        history.push(snapshot);
        if history.len() > MAX_STAT_SNAPSHOTS_PER_STREAM {
            let overflow = history.len() - MAX_STAT_SNAPSHOTS_PER_STREAM;
            history.drain(0..overflow);
        }
    }

    /// Stat history for one stream, optionally cut off at `since`.
    pub async fn list_stat_snapshots(
        &self,
        stream_id: &str,
        since: Option<chrono::DateTime<Utc>>,
    ) -> Vec<StreamStatSnapshot> {
        let inner = self.inner.lock().await;
        let Some(history) = inner.stats.get(stream_id) else {
            return Vec::new();
        };
        match since {
            Some(cutoff) => history.iter().filter(|s| s.ts >= cutoff).cloned().collect(),
            None => history.clone(),
        }
    }

    /// Upserts an engine discovered during rehydration (spec §7 startup
    /// reindex). When two live containers both carry the forwarded label
    /// for the same VPN, the first one encountered wins and the rest are
    /// demoted — the reindex walks containers in listing order, so this is
    /// deterministic only up to Docker's own listing order, which is the
    /// same guarantee the live assignment path gives.
    pub async fn rehydrate_engine(&self, engine: Engine) {
        let mut inner = self.inner.lock().await;
        if engine.forwarded {
            if let Some(vpn) = &engine.vpn_container {
                if inner.forwarded.contains_key(vpn) {
                    warn!(
                        container_id = %engine.container_id,
                        vpn,
                        "second forwarded engine found for vpn during rehydration, demoting"
                    );
                    let mut engine = engine;
                    engine.forwarded = false;
                    engine.p2p_port = None;
                    inner.engines.insert(engine.container_id.clone(), engine);
                    return;
                }
                inner
                    .forwarded
                    .insert(vpn.clone(), engine.container_id.clone());
            }
        }
        inner.engines.insert(engine.container_id.clone(), engine);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EngineRef, EndReason, SessionInfo, StreamKey};
    use ace_net::PortRange;
    use ace_types::KeyType;

    fn store() -> StateStore {
        let ranges = HashMap::from([(
            ace_net::GLOBAL_POOL.to_string(),
            PortRange { lo: 40000, hi: 40009 },
        )]);
        let ports = Arc::new(PortAllocator::new(ranges, 20));
        StateStore::new(ports, ProxyHookRegistry::new(), 40)
    }

    fn started_event(container_id: &str, key: &str, session: &str) -> StreamStartedEvent {
        StreamStartedEvent {
            container_id: Some(container_id.to_string()),
            engine: EngineRef {
                host: container_id.to_string(),
                port: 6878,
            },
            stream: StreamKey {
                key_type: KeyType::Infohash,
                key: key.to_string(),
            },
            session: SessionInfo {
                playback_session_id: session.to_string(),
                stat_url: "http://engine/stat".to_string(),
                command_url: "http://engine/cmd".to_string(),
                is_live: false,
            },
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn on_stream_started_creates_engine_on_first_sight() {
        let store = store();
        let stream = store
            .on_stream_started(started_event("eng-1", "hash1", "sess-1"))
            .await
            .unwrap();
        assert_eq!(stream.engine_container_id, "eng-1");
        assert_eq!(store.list_engines().await.len(), 1);
    }

    #[tokio::test]
    async fn replaying_same_stream_does_not_count_twice() {
        let store = store();
        store
            .on_stream_started(started_event("eng-1", "hash1", "sess-1"))
            .await
            .unwrap();
        store
            .on_stream_started(started_event("eng-1", "hash1", "sess-1"))
            .await
            .unwrap();
        assert_eq!(store.list_streams().await.len(), 1);
    }

    #[tokio::test]
    async fn on_stream_ended_flips_status_and_notifies_hooks() {
        let store = store();
        let stream = store
            .on_stream_started(started_event("eng-1", "hash1", "sess-1"))
            .await
            .unwrap();
        let outcome = store
            .on_stream_ended(StreamEndedEvent {
                container_id: None,
                stream_id: Some(stream.id.clone()),
                reason: EndReason::Explicit,
            })
            .await
            .unwrap();
        assert!(outcome.engine_now_idle);
        let ended = store.get_stream(&stream.id).await.unwrap();
        assert_eq!(ended.status, StreamStatus::Ended);
    }

    #[tokio::test]
    async fn replaying_stream_ended_is_a_noop() {
        let store = store();
        let stream = store
            .on_stream_started(started_event("eng-1", "hash1", "sess-1"))
            .await
            .unwrap();
        let first = store
            .on_stream_ended(StreamEndedEvent {
                container_id: None,
                stream_id: Some(stream.id.clone()),
                reason: EndReason::Explicit,
            })
            .await
            .unwrap();
        assert!(!first.already_ended);

        let second = store
            .on_stream_ended(StreamEndedEvent {
                container_id: None,
                stream_id: Some(stream.id.clone()),
                reason: EndReason::Explicit,
            })
            .await
            .unwrap();
        assert!(second.already_ended);
    }

    #[tokio::test]
    async fn remove_engine_cascades_streams_and_releases_port() {
        let store = store();
        store
            .on_stream_started(started_event("eng-1", "hash1", "sess-1"))
            .await
            .unwrap();
        {
            let mut inner = store.inner.lock().await;
            inner.engines.get_mut("eng-1").unwrap().port = 40000;
        }
        store.ports.reserve_specific(ace_net::GLOBAL_POOL, 40000).await.unwrap();

        let ended = store.remove_engine("eng-1").await.unwrap();
        assert_eq!(ended.len(), 1);
        assert_eq!(store.ports.total_reserved().await, 0);
        assert!(store.get_engine("eng-1").await.is_err());
    }

    #[tokio::test]
    async fn forwarded_assignment_is_exclusive_per_vpn() {
        let store = store();
        store
            .on_stream_started(started_event("eng-1", "hash1", "sess-1"))
            .await
            .unwrap();
        store
            .on_stream_started(started_event("eng-2", "hash2", "sess-2"))
            .await
            .unwrap();
        {
            let mut inner = store.inner.lock().await;
            inner.engines.get_mut("eng-1").unwrap().vpn_container = Some("vpn1".to_string());
            inner.engines.get_mut("eng-2").unwrap().vpn_container = Some("vpn1".to_string());
        }

        store.set_forwarded_engine("vpn1", "eng-1", 51000).await.unwrap();
        let err = store
            .set_forwarded_engine("vpn1", "eng-2", 51001)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::ForwardedAlreadyAssigned(_)));
    }
}
