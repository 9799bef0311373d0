use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    ContentId,
    Infohash,
    Url,
    Magnet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Started,
    Ended,
}

/// A live or ended stream bound to an engine.
///
/// `id` is `key | playback_session_id` unless the originating event carried
/// a `stream_id` label, in which case the labeled id is used verbatim (see
/// `labels::STREAM_ID`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    pub id: String,
    pub engine_container_id: String,
    pub key_type: KeyType,
    pub key: String,
    pub playback_session_id: String,
    pub stat_url: String,
    pub command_url: String,
    pub is_live: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: StreamStatus,
    pub labels: HashMap<String, String>,
}

impl Stream {
    /// Derives the canonical stream id for an incoming event, per spec §3:
    /// the `stream_id` label wins if present, else `key | playback_session_id`.
    pub fn derive_id(
        labels: &HashMap<String, String>,
        key: &str,
        playback_session_id: &str,
    ) -> String {
        if let Some(id) = labels.get(crate::labels::STREAM_ID) {
            id.clone()
        } else {
            format!("{key}|{playback_session_id}")
        }
    }

    pub fn end(&mut self, at: DateTime<Utc>) {
        self.status = StreamStatus::Ended;
        self.ended_at = Some(at);
    }
}

/// Append-only statistics sample for a single stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatSnapshot {
    pub stream_id: String,
    pub ts: DateTime<Utc>,
    pub peers: u32,
    pub speed_down: u64,
    pub speed_up: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_id_from_key_and_session_when_no_label() {
        let labels = HashMap::new();
        let id = Stream::derive_id(&labels, "abc123", "sess-1");
        assert_eq!(id, "abc123|sess-1");
    }

    #[test]
    fn prefers_stream_id_label_when_present() {
        let mut labels = HashMap::new();
        labels.insert(crate::labels::STREAM_ID.to_string(), "explicit-id".to_string());
        let id = Stream::derive_id(&labels, "abc123", "sess-1");
        assert_eq!(id, "explicit-id");
    }
}
