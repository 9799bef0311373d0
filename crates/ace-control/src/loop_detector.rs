//! Stream Loop Detector (C8, spec §4.8).
//!
//! Every `LOOP_CHECK_INTERVAL_S`, polls `stat_url` for each live started
//! stream; a stream whose `live_last` has stalled past the threshold is
//! stopped and its content key blocklisted. A separate sweep retires old
//! blocklist entries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ace_state::{EndReason, StateStore, StreamEndedEvent};
use ace_types::StreamStatSnapshot;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy)]
pub struct LoopDetectorConfig {
    pub enabled: bool,
    pub threshold: chrono::Duration,
    /// 0 means indefinite retention.
    pub retention: chrono::Duration,
}

#[derive(Debug, Default, Deserialize)]
struct StatResponse {
    live_last: Option<i64>,
    #[serde(default)]
    peers: u32,
    #[serde(default)]
    speed_down: u64,
    #[serde(default)]
    speed_up: u64,
    #[serde(default)]
    downloaded: u64,
    #[serde(default)]
    uploaded: u64,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct LoopEntry {
    pub stream_id: String,
    pub key: String,
    pub detected_at: DateTime<Utc>,
}

/// Content keys whose streams were stopped for looping. Readers-many,
/// writers-one: the proxy consults this on every playback request.
pub struct LoopingStreams {
    entries: RwLock<HashMap<String, LoopEntry>>,
}

impl LoopingStreams {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, key: String, stream_id: String, at: DateTime<Utc>) {
        self.entries.write().await.insert(
            key.clone(),
            LoopEntry {
                stream_id,
                key,
                detected_at: at,
            },
        );
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn snapshot(&self) -> Vec<LoopEntry> {
        self.entries.read().await.values().cloned().collect()
    }

    /// Drops entries older than `retention`; a zero retention means
    /// "indefinite" and this is a no-op.
    pub async fn sweep(&self, retention: chrono::Duration, now: DateTime<Utc>) {
        if retention <= chrono::Duration::zero() {
            return;
        }
        self.entries
            .write()
            .await
            .retain(|_, entry| now - entry.detected_at <= retention);
    }
}

impl Default for LoopingStreams {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StreamLoopDetector {
    state: Arc<StateStore>,
    looping: Arc<LoopingStreams>,
    client: Client,
    config: LoopDetectorConfig,
}

impl StreamLoopDetector {
    pub fn new(state: Arc<StateStore>, looping: Arc<LoopingStreams>, config: LoopDetectorConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client config is valid");
        Self {
            state,
            looping,
            client,
            config,
        }
    }

    pub async fn run_cycle(&self) -> usize {
        if !self.config.enabled {
            return 0;
        }

        let now = Utc::now();
        let mut stopped = 0;
        for stream in self.state.list_streams().await {
            if stream.status != ace_types::StreamStatus::Started || !stream.is_live {
                continue;
            }

            let stat = match self.fetch_stat(&stream.stat_url).await {
                Some(s) => s,
                None => continue,
            };
            self.state
                .record_stat_snapshot(StreamStatSnapshot {
                    stream_id: stream.id.clone(),
                    ts: now,
                    peers: stat.peers,
                    speed_down: stat.speed_down,
                    speed_up: stat.speed_up,
                    downloaded: stat.downloaded,
                    uploaded: stat.uploaded,
                    status: stat.status.clone(),
                })
                .await;

            let Some(live_last) = stat.live_last.and_then(|secs| DateTime::from_timestamp(secs, 0))
            else {
                continue;
            };

            if now - live_last <= self.config.threshold {
                continue;
            }

            if let Err(e) = self.client.post(&stream.command_url).send().await {
                warn!(stream_id = %stream.id, error = %e, "loop detector command_url stop failed, will retry next cycle");
                continue;
            }

            match self
                .state
                .on_stream_ended(StreamEndedEvent {
                    container_id: None,
                    stream_id: Some(stream.id.clone()),
                    reason: EndReason::LoopDetected,
                })
                .await
            {
                Ok(_) => {
                    self.looping.insert(stream.key.clone(), stream.id.clone(), now).await;
                    info!(stream_id = %stream.id, key = %stream.key, "stream ended for looping, added to blocklist");
                    stopped += 1;
                }
                Err(e) => warn!(stream_id = %stream.id, error = %e, "failed to end looping stream"),
            }
        }

        self.looping.sweep(self.config.retention, now).await;
        stopped
    }

    async fn fetch_stat(&self, stat_url: &str) -> Option<StatResponse> {
        let resp = self.client.get(stat_url).send().await.ok()?;
        resp.json().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweep_removes_entries_past_retention() {
        let looping = LoopingStreams::new();
        let old = Utc::now() - chrono::Duration::hours(2);
        looping.insert("key1".to_string(), "s1".to_string(), old).await;

        looping.sweep(chrono::Duration::minutes(30), Utc::now()).await;
        assert!(!looping.contains("key1").await);
    }

    #[tokio::test]
    async fn zero_retention_keeps_entries_indefinitely() {
        let looping = LoopingStreams::new();
        let old = Utc::now() - chrono::Duration::days(30);
        looping.insert("key1".to_string(), "s1".to_string(), old).await;

        looping.sweep(chrono::Duration::zero(), Utc::now()).await;
        assert!(looping.contains("key1").await);
    }

    #[tokio::test]
    async fn fresh_entry_survives_a_sweep() {
        let looping = LoopingStreams::new();
        looping.insert("key1".to_string(), "s1".to_string(), Utc::now()).await;
        looping.sweep(chrono::Duration::minutes(30), Utc::now()).await;
        assert!(looping.contains("key1").await);
    }
}
