//! Process configuration (spec §6). Loaded the way `vpn-identity::config`
//! loads `IdentityConfig`: if `ACE_CONFIG_PATH` is set, read and parse it as
//! TOML; otherwise build every field from environment variables with
//! explicit defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use ace_types::{EngineVariantOverride, StreamMode, VpnMode};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub min_replicas: usize,
    pub max_replicas: usize,
    pub max_active_replicas: usize,
    pub max_streams_per_engine: usize,
    pub auto_delete: bool,
    pub engine_grace_period_s: u64,
    pub autoscale_interval_s: u64,
    pub health_check_interval_s: u64,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            min_replicas: 2,
            max_replicas: 50,
            max_active_replicas: 50,
            max_streams_per_engine: 5,
            auto_delete: true,
            engine_grace_period_s: 300,
            autoscale_interval_s: 30,
            health_check_interval_s: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnConfig {
    pub mode: VpnMode,
    pub container: Option<String>,
    pub container_2: Option<String>,
    pub api_port: u16,
    pub port_range_1: (u16, u16),
    pub port_range_2: (u16, u16),
    pub port_cache_ttl_s: u64,
    pub stabilization_s: u64,
    pub unhealthy_restart_timeout_s: u64,
}

impl Default for VpnConfig {
    fn default() -> Self {
        Self {
            mode: VpnMode::None,
            container: None,
            container_2: None,
            api_port: 8000,
            port_range_1: (40000, 40999),
            port_range_2: (41000, 41999),
            port_cache_ttl_s: 60,
            stabilization_s: 120,
            unhealthy_restart_timeout_s: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDetectionConfig {
    pub enabled: bool,
    pub threshold_s: u64,
    pub check_interval_s: u64,
    pub retention_minutes: u64,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_s: 3600,
            check_interval_s: 60,
            retention_minutes: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub timeout_s: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout_s: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    pub mode: bool,
    pub log_dir: PathBuf,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            mode: false,
            log_dir: PathBuf::from("./debug-traces"),
        }
    }
}

/// Proxy-facing stream transport (supplemented runtime-mutable config,
/// spec §3 "Configuration entity"). `ace-server` seeds `RuntimeConfig` from
/// this at startup; subsequent changes happen through `/scale`-adjacent
/// admin endpoints rather than by re-reading this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamModeConfig {
    pub mode: StreamMode,
}

impl Default for StreamModeConfig {
    fn default() -> Self {
        Self { mode: StreamMode::Ts }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineVariantOverrides {
    #[serde(default)]
    pub by_name: HashMap<String, EngineVariantOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub auth_token: Option<String>,
    pub provisioning_rate_limit_per_minute: u32,
    pub ts_proxy_url: Option<String>,
    pub hls_proxy_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            auth_token: None,
            provisioning_rate_limit_per_minute: 60,
            ts_proxy_url: None,
            hls_proxy_url: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AceConfig {
    pub server: ServerConfig,
    pub replicas: ReplicaConfig,
    pub vpn: VpnConfig,
    pub loop_detection: LoopDetectionConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub debug: DebugConfig,
    pub stream_mode: StreamModeConfig,
    pub variant_overrides: EngineVariantOverrides,
}

fn env_var<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

impl AceConfig {
    /// Loads from `ACE_CONFIG_PATH` (TOML) if set, else from environment
    /// variables named per spec §6, falling back to the `Default` values
    /// above for anything unset.
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(path) = std::env::var("ACE_CONFIG_PATH") {
            let raw = std::fs::read_to_string(&path)?;
            return Ok(toml::from_str(&raw)?);
        }
        Ok(Self::from_env())
    }

    fn from_env() -> Self {
        let default = Self::default();

        let vpn_mode = match std::env::var("VPN_MODE").as_deref() {
            Ok("single") => VpnMode::Single,
            Ok("redundant") => VpnMode::Redundant,
            _ => VpnMode::None,
        };

        Self {
            server: ServerConfig {
                bind_address: std::env::var("ACE_BIND_ADDRESS")
                    .unwrap_or(default.server.bind_address),
                port: env_var("ACE_PORT", default.server.port),
                auth_token: std::env::var("ACE_AUTH_TOKEN").ok(),
                provisioning_rate_limit_per_minute: env_var(
                    "ACE_PROVISIONING_RATE_LIMIT_PER_MINUTE",
                    default.server.provisioning_rate_limit_per_minute,
                ),
                ts_proxy_url: std::env::var("ACE_TS_PROXY_URL").ok(),
                hls_proxy_url: std::env::var("ACE_HLS_PROXY_URL").ok(),
            },
            replicas: ReplicaConfig {
                min_replicas: env_var("MIN_REPLICAS", default.replicas.min_replicas),
                max_replicas: env_var("MAX_REPLICAS", default.replicas.max_replicas),
                max_active_replicas: env_var(
                    "MAX_ACTIVE_REPLICAS",
                    default.replicas.max_active_replicas,
                ),
                max_streams_per_engine: env_var(
                    "MAX_STREAMS_PER_ENGINE",
                    default.replicas.max_streams_per_engine,
                ),
                auto_delete: env_bool("AUTO_DELETE", default.replicas.auto_delete),
                engine_grace_period_s: env_var(
                    "ENGINE_GRACE_PERIOD_S",
                    default.replicas.engine_grace_period_s,
                ),
                autoscale_interval_s: env_var(
                    "AUTOSCALE_INTERVAL_S",
                    default.replicas.autoscale_interval_s,
                ),
                health_check_interval_s: env_var(
                    "HEALTH_CHECK_INTERVAL_S",
                    default.replicas.health_check_interval_s,
                ),
            },
            vpn: VpnConfig {
                mode: vpn_mode,
                container: std::env::var("VPN_CONTAINER").ok(),
                container_2: std::env::var("VPN_CONTAINER_2").ok(),
                api_port: env_var("VPN_API_PORT", default.vpn.api_port),
                port_range_1: parse_range(
                    "VPN_PORT_RANGE_1",
                    default.vpn.port_range_1,
                ),
                port_range_2: parse_range(
                    "VPN_PORT_RANGE_2",
                    default.vpn.port_range_2,
                ),
                port_cache_ttl_s: env_var(
                    "VPN_PORT_CACHE_TTL_S",
                    default.vpn.port_cache_ttl_s,
                ),
                stabilization_s: env_var("VPN_STABILIZATION_S", default.vpn.stabilization_s),
                unhealthy_restart_timeout_s: env_var(
                    "VPN_UNHEALTHY_RESTART_TIMEOUT_S",
                    default.vpn.unhealthy_restart_timeout_s,
                ),
            },
            loop_detection: LoopDetectionConfig {
                enabled: env_bool(
                    "STREAM_LOOP_DETECTION_ENABLED",
                    default.loop_detection.enabled,
                ),
                threshold_s: env_var(
                    "STREAM_LOOP_DETECTION_THRESHOLD_S",
                    default.loop_detection.threshold_s,
                ),
                check_interval_s: env_var(
                    "STREAM_LOOP_CHECK_INTERVAL_S",
                    default.loop_detection.check_interval_s,
                ),
                retention_minutes: env_var(
                    "STREAM_LOOP_RETENTION_MINUTES",
                    default.loop_detection.retention_minutes,
                ),
            },
            circuit_breaker: CircuitBreakerConfig {
                threshold: env_var("CIRCUIT_BREAKER_THRESHOLD", default.circuit_breaker.threshold),
                timeout_s: env_var(
                    "CIRCUIT_BREAKER_TIMEOUT_S",
                    default.circuit_breaker.timeout_s,
                ),
            },
            debug: DebugConfig {
                mode: env_bool("DEBUG_MODE", default.debug.mode),
                log_dir: std::env::var("DEBUG_LOG_DIR")
                    .map(PathBuf::from)
                    .unwrap_or(default.debug.log_dir),
            },
            stream_mode: default.stream_mode,
            variant_overrides: default.variant_overrides,
        }
    }

    pub fn vpn_names(&self) -> Vec<String> {
        match self.vpn.mode {
            VpnMode::None => Vec::new(),
            VpnMode::Single => self.vpn.container.iter().cloned().collect(),
            VpnMode::Redundant => [&self.vpn.container, &self.vpn.container_2]
                .into_iter()
                .flatten()
                .cloned()
                .collect(),
        }
    }
}

fn parse_range(key: &str, default: (u16, u16)) -> (u16, u16) {
    match std::env::var(key) {
        Ok(v) => {
            let mut parts = v.splitn(2, '-');
            match (parts.next().and_then(|a| a.parse().ok()), parts.next().and_then(|b| b.parse().ok())) {
                (Some(lo), Some(hi)) => (lo, hi),
                _ => default,
            }
        }
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_min_replicas_at_least_one() {
        let config = AceConfig::default();
        assert!(config.replicas.min_replicas >= 1);
    }

    #[test]
    fn vpn_names_empty_in_none_mode() {
        let config = AceConfig::default();
        assert!(config.vpn_names().is_empty());
    }
}
