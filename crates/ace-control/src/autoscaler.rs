//! Autoscaler (C6, spec §4.6).
//!
//! Runs on its own timer (`AUTOSCALE_INTERVAL_S`) and keeps at least
//! `MIN_REPLICAS` free (zero-stream) engines provisioned, lookahead-starts
//! one more engine when any engine is one stream short of its cap, and
//! reaps engines that have sat idle past `ENGINE_GRACE_PERIOD_S`.

use std::sync::Arc;
use std::time::Duration;

use ace_net::VpnHealthMonitor;
use ace_state::{ResponseCache, StateStore};
use ace_types::Engine;
use chrono::Utc;
use tracing::{info, warn};

use crate::provisioner::{AceProvisionRequest, Provisioner};

#[derive(Debug, Clone, Copy)]
pub struct AutoscalerConfig {
    pub min_replicas: usize,
    pub max_active_replicas: usize,
    pub max_streams_per_engine: usize,
    pub grace_period: chrono::Duration,
    pub interval: Duration,
    pub auto_delete: bool,
}

impl AutoscalerConfig {
    /// `MIN_REPLICAS >= 1` is a hard precondition (spec §4.6).
    pub fn validated(self) -> Self {
        assert!(self.min_replicas >= 1, "MIN_REPLICAS must be >= 1");
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct AutoscaleOutcome {
    pub started: usize,
    pub start_failures: usize,
    pub reaped: usize,
}

pub struct Autoscaler {
    state: Arc<StateStore>,
    provisioner: Arc<Provisioner>,
    vpn_health: Arc<VpnHealthMonitor>,
    config: AutoscalerConfig,
    cache: Arc<ResponseCache>,
}

impl Autoscaler {
    pub fn new(
        state: Arc<StateStore>,
        provisioner: Arc<Provisioner>,
        vpn_health: Arc<VpnHealthMonitor>,
        config: AutoscalerConfig,
        cache: Arc<ResponseCache>,
    ) -> Self {
        Self {
            state,
            provisioner,
            vpn_health,
            config: config.validated(),
            cache,
        }
    }

    /// One autoscale cycle (spec §4.6 steps 1-6). Skips entirely while
    /// Emergency Mode is active, except at initial startup when `initial`
    /// is true (so a cold-started system still gets its first batch of free
    /// engines before any health cycle has run).
    pub async fn run_cycle(&self, initial: bool) -> AutoscaleOutcome {
        if self.vpn_health.is_emergency().await && !initial {
            return AutoscaleOutcome::default();
        }

        let engines = self.state.list_engines().await;
        let streams = self.state.list_streams().await;
        let free_count = engines
            .iter()
            .filter(|e| self.active_stream_count(e, &streams) == 0)
            .count();
        let total_running = engines.len();

        let mut desired = self.config.min_replicas.saturating_sub(free_count);
        let capacity_left = self.config.max_active_replicas.saturating_sub(total_running);
        if total_running >= self.config.max_active_replicas {
            warn!(
                total_running,
                cap = self.config.max_active_replicas,
                "autoscaler at max active replicas, skipping new starts"
            );
            desired = 0;
        } else {
            desired = desired.min(capacity_left);
        }

        let lookahead_triggered = free_count == 0
            && engines.iter().any(|e| {
                self.active_stream_count(e, &streams) >= self.config.max_streams_per_engine.saturating_sub(1)
            });
        if lookahead_triggered && desired == 0 && capacity_left > 0 {
            desired = 1;
        }

        let mut outcome = AutoscaleOutcome::default();
        for _ in 0..desired {
            match self
                .provisioner
                .provision_acestream(AceProvisionRequest::default())
                .await
            {
                Ok(response) => {
                    info!(container_id = %response.container_id, "autoscaler started free engine");
                    outcome.started += 1;
                }
                Err(e) => {
                    warn!(error = %e, "autoscaler provision attempt failed");
                    outcome.start_failures += 1;
                }
            }
        }

        outcome.reaped = self.garbage_collect(free_count).await;
        if outcome.started > 0 || outcome.reaped > 0 {
            self.cache.invalidate_all().await;
        }
        outcome
    }

    fn active_stream_count(&self, engine: &Engine, streams: &[ace_types::Stream]) -> usize {
        streams
            .iter()
            .filter(|s| {
                s.engine_container_id == engine.container_id
                    && s.status == ace_types::StreamStatus::Started
            })
            .count()
    }

    /// Reaps engines idle past the grace period, never dropping below
    /// `MIN_REPLICAS` free engines (spec §4.6 step 6).
    async fn garbage_collect(&self, mut free_count: usize) -> usize {
        if !self.config.auto_delete {
            return 0;
        }

        let now = Utc::now();
        let engines = self.state.list_engines().await;
        let streams = self.state.list_streams().await;
        let mut reaped = 0;

        for engine in &engines {
            if free_count <= self.config.min_replicas {
                break;
            }
            if self.active_stream_count(engine, &streams) != 0 {
                continue;
            }
            let idle_for = now - engine.last_stream_usage;
            if idle_for <= self.config.grace_period {
                continue;
            }
            match self.state.remove_engine(&engine.container_id).await {
                Ok(_) => {
                    reaped += 1;
                    free_count -= 1;
                    info!(container_id = %engine.container_id, "autoscaler reaped idle engine");
                }
                Err(e) => warn!(container_id = %engine.container_id, error = %e, "gc remove_engine failed, will retry next cycle"),
            }
        }

        reaped
    }

    /// Stream-to-engine selection policy (spec §4.6, GLOSSARY "Layer
    /// filling"): among engines under capacity, pick the least-loaded one,
    /// breaking ties in favor of the forwarded engine. Exposed so the proxy
    /// query surface (C9) and the autoscaler share one definition.
    pub fn select_engine_for_stream(engines: &[(Engine, usize)], max_streams: usize) -> Option<String> {
        engines
            .iter()
            .filter(|(_, load)| *load < max_streams)
            .min_by(|(a, load_a), (b, load_b)| {
                load_a
                    .cmp(load_b)
                    .then_with(|| b.forwarded.cmp(&a.forwarded))
            })
            .map(|(engine, _)| engine.container_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(id: &str, forwarded: bool) -> Engine {
        let mut e = Engine::new(id.to_string(), id.to_string(), "host".to_string(), 1000);
        e.forwarded = forwarded;
        e
    }

    #[test]
    fn select_engine_picks_least_loaded() {
        let engines = vec![(engine("a", false), 3), (engine("b", false), 1)];
        let picked = Autoscaler::select_engine_for_stream(&engines, 5);
        assert_eq!(picked, Some("b".to_string()));
    }

    #[test]
    fn select_engine_breaks_ties_toward_forwarded() {
        let engines = vec![(engine("a", false), 2), (engine("b", true), 2)];
        let picked = Autoscaler::select_engine_for_stream(&engines, 5);
        assert_eq!(picked, Some("b".to_string()));
    }

    #[test]
    fn select_engine_excludes_full_engines() {
        let engines = vec![(engine("a", false), 5)];
        let picked = Autoscaler::select_engine_for_stream(&engines, 5);
        assert_eq!(picked, None);
    }

    #[test]
    #[should_panic(expected = "MIN_REPLICAS")]
    fn zero_min_replicas_is_rejected() {
        AutoscalerConfig {
            min_replicas: 0,
            max_active_replicas: 10,
            max_streams_per_engine: 5,
            grace_period: chrono::Duration::seconds(60),
            interval: Duration::from_secs(30),
            auto_delete: true,
        }
        .validated();
    }
}
