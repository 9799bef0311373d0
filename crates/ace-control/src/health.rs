//! Engine Health Monitor (C7, spec §4.7).
//!
//! Runs every `HEALTH_CHECK_INTERVAL_S`. For each engine: probes its HTTP
//! port for liveness, and — if it currently has no active streams and a
//! cleanup is due — runs a cache-purge `exec` inside the container.

use std::sync::Arc;
use std::time::Duration;

use ace_docker::ContainerDriver;
use ace_net::VpnHealthMonitor;
use ace_state::StateStore;
use ace_types::HealthStatus;
use chrono::Utc;
use reqwest::Client;
use tracing::{debug, warn};

/// Containers purge their cache on this fixed command; the monitor measures
/// stdout length before and after as a rough freed-bytes estimate.
const CACHE_PURGE_CMD: &[&str] = &["sh", "-c", "rm -rf /tmp/ace-cache/* 2>/dev/null; echo done"];

#[derive(Debug, Clone, Copy)]
pub struct HealthMonitorConfig {
    pub probe_timeout: Duration,
    pub cache_cleanup_interval: chrono::Duration,
}

#[derive(Debug, Clone, Default)]
pub struct HealthCycleOutcome {
    pub probed: usize,
    pub healthy: usize,
    pub cache_cleanups: usize,
}

pub struct EngineHealthMonitor {
    state: Arc<StateStore>,
    driver: Arc<ContainerDriver>,
    vpn_health: Arc<VpnHealthMonitor>,
    client: Client,
    config: HealthMonitorConfig,
}

impl EngineHealthMonitor {
    pub fn new(
        state: Arc<StateStore>,
        driver: Arc<ContainerDriver>,
        vpn_health: Arc<VpnHealthMonitor>,
        config: HealthMonitorConfig,
    ) -> Self {
        let client = Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .expect("reqwest client config is valid");
        Self {
            state,
            driver,
            vpn_health,
            client,
            config,
        }
    }

    pub async fn run_cycle(&self) -> HealthCycleOutcome {
        if self.vpn_health.is_emergency().await {
            return HealthCycleOutcome::default();
        }

        let engines = self.state.list_engines().await;
        let streams = self.state.list_streams().await;
        let mut outcome = HealthCycleOutcome::default();

        for engine in engines {
            outcome.probed += 1;
            let healthy = self.probe_engine(&engine).await;
            if healthy {
                outcome.healthy += 1;
            }
            let now = Utc::now();
            let status = if healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            };
            if let Err(e) = self.state.record_health_check(&engine.container_id, status, now).await {
                warn!(container_id = %engine.container_id, error = %e, "failed to record health check, engine likely removed mid-cycle");
                continue;
            }

            let active_streams = streams
                .iter()
                .filter(|s| {
                    s.engine_container_id == engine.container_id
                        && s.status == ace_types::StreamStatus::Started
                })
                .count();

            let cleanup_due =
                now - engine.last_cache_cleanup > self.config.cache_cleanup_interval;
            if active_streams == 0 && cleanup_due {
                if self.purge_cache(&engine.container_id).await {
                    outcome.cache_cleanups += 1;
                }
            }
        }

        outcome
    }

    async fn probe_engine(&self, engine: &ace_types::Engine) -> bool {
        let url = format!("http://{}:{}/webui/api/service?method=get_status", engine.host, engine.port);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                debug!(container_id = %engine.container_id, status = %resp.status(), "engine probe returned non-success");
                false
            }
            Err(e) => {
                debug!(container_id = %engine.container_id, error = %e, "engine probe failed");
                false
            }
        }
    }

    async fn purge_cache(&self, container_id: &str) -> bool {
        let pre_size = self
            .driver
            .exec(container_id, vec!["sh", "-c", "du -sb /tmp/ace-cache 2>/dev/null | cut -f1"])
            .await
            .ok()
            .and_then(|o| o.stdout.trim().parse::<u64>().ok())
            .unwrap_or(0);

        match self.driver.exec(container_id, CACHE_PURGE_CMD.to_vec()).await {
            Ok(output) if output.exit_code == 0 => {
                if let Err(e) = self
                    .state
                    .record_cache_cleanup(container_id, pre_size, Utc::now())
                    .await
                {
                    warn!(container_id, error = %e, "failed to record cache cleanup");
                }
                true
            }
            Ok(output) => {
                warn!(container_id, exit_code = output.exit_code, stderr = %output.stderr, "cache purge exited non-zero");
                false
            }
            Err(e) => {
                warn!(container_id, error = %e, "cache purge exec failed");
                false
            }
        }
    }
}
