use std::collections::HashMap;

use ace_types::KeyType;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct EngineRef {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamKey {
    pub key_type: KeyType,
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub playback_session_id: String,
    pub stat_url: String,
    pub command_url: String,
    pub is_live: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamStartedEvent {
    pub container_id: Option<String>,
    pub engine: EngineRef,
    pub stream: StreamKey,
    pub session: SessionInfo,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Explicit,
    LoopDetected,
    EngineRemoved,
    Manual,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamEndedEvent {
    pub container_id: Option<String>,
    pub stream_id: Option<String>,
    pub reason: EndReason,
}
