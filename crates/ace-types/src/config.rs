use serde::{Deserialize, Serialize};

/// Operating mode for the VPN layer (spec §6, `VPN_MODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VpnMode {
    None,
    Single,
    Redundant,
}

/// Proxy-facing stream transport mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamMode {
    Ts,
    Hls,
}

/// The runtime-mutable configuration subset named in spec §3: stream mode,
/// loop detection toggles, and engine-variant overrides are the only
/// pieces of configuration that change after startup without a restart.
/// Everything else in spec §6 is process-lifetime immutable and lives in
/// `ace-server::config::AceConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub stream_mode: StreamMode,
    pub loop_detection_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            stream_mode: StreamMode::Ts,
            loop_detection_enabled: true,
        }
    }
}
