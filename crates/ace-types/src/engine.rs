use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl Default for HealthStatus {
    fn default() -> Self {
        HealthStatus::Unknown
    }
}

/// A streaming-engine container, keyed by `container_id`.
///
/// Invariants enforced by `ace-state::store`, not by this type itself:
/// - `container_id` is the primary key.
/// - for each VPN, at most one engine has `forwarded = true`.
/// - `port` is unique across engines sharing the same VPN (or globally in
///   `VPN_MODE=none`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Engine {
    pub container_id: String,
    pub container_name: String,
    /// Address reachable by the proxy: the VPN sidecar name when bound to a
    /// VPN, otherwise the container name.
    pub host: String,
    pub port: u16,
    pub labels: HashMap<String, String>,
    pub vpn_container: Option<String>,
    pub forwarded: bool,
    pub p2p_port: Option<u32>,
    pub health_status: HealthStatus,
    pub last_health_check: DateTime<Utc>,
    pub last_stream_usage: DateTime<Utc>,
    pub last_cache_cleanup: DateTime<Utc>,
    pub cache_size_bytes: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Engine {
    pub fn new(container_id: String, container_name: String, host: String, port: u16) -> Self {
        let now = Utc::now();
        Self {
            container_id,
            container_name,
            host,
            port,
            labels: HashMap::new(),
            vpn_container: None,
            forwarded: false,
            p2p_port: None,
            health_status: HealthStatus::Unknown,
            last_health_check: now,
            last_stream_usage: now,
            last_cache_cleanup: now,
            cache_size_bytes: 0,
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn with_vpn(mut self, vpn_container: impl Into<String>) -> Self {
        self.vpn_container = Some(vpn_container.into());
        self
    }

    pub fn with_forwarded(mut self, p2p_port: u32) -> Self {
        self.forwarded = true;
        self.p2p_port = Some(p2p_port);
        self
    }
}
