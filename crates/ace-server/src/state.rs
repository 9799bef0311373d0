//! Process-wide `AppState`: constructs every component from `AceConfig` and
//! owns the periodic workers, following `vpn-identity::service::IdentityService`'s
//! role as the one place that wires storage, sub-services, and background
//! tasks together behind an `Arc`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ace_control::{
    Autoscaler, AutoscalerConfig, DebugTraceSink, EngineHealthMonitor, HealthMonitorConfig,
    LoopDetectorConfig, LoopingStreams, Provisioner, StreamLoopDetector, VpnPollWorker, VpnTarget,
};
use ace_docker::ContainerDriver;
use ace_net::{PortAllocator, PortRange, VpnHealthMonitor, VpnProbe, GLOBAL_POOL};
use ace_state::{CircuitBreakerRegistry, ProxyHookRegistry, ResponseCache, StateStore};
use ace_types::{EngineVariant, RuntimeConfig};
use tokio::sync::RwLock;
use tracing::info;

use crate::config::AceConfig;
use crate::metrics::AceMetrics;
use crate::proxy_hooks::HttpProxyHook;
use crate::rate_limit::ProvisioningLimiter;

#[derive(Clone)]
pub struct AppState(pub Arc<Inner>);

pub struct Inner {
    pub config: AceConfig,
    pub state: Arc<StateStore>,
    pub ports: Arc<PortAllocator>,
    pub vpn_health: Arc<VpnHealthMonitor>,
    pub driver: Arc<ContainerDriver>,
    pub provisioner: Arc<Provisioner>,
    pub autoscaler: Arc<Autoscaler>,
    pub engine_health: Arc<EngineHealthMonitor>,
    pub loop_detector: Arc<StreamLoopDetector>,
    pub looping_streams: Arc<LoopingStreams>,
    pub circuit: Arc<CircuitBreakerRegistry>,
    pub cache: Arc<ResponseCache>,
    pub trace: Arc<DebugTraceSink>,
    pub metrics: Arc<AceMetrics>,
    pub rate_limiter: Arc<ProvisioningLimiter>,
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn build(config: AceConfig) -> anyhow::Result<Self> {
        let vpn_names = config.vpn_names();

        let mut ranges = HashMap::new();
        match config.vpn.mode {
            ace_types::VpnMode::None => {
                ranges.insert(
                    GLOBAL_POOL.to_string(),
                    PortRange {
                        lo: config.vpn.port_range_1.0,
                        hi: config.vpn.port_range_1.1,
                    },
                );
            }
            ace_types::VpnMode::Single => {
                if let Some(name) = vpn_names.first() {
                    ranges.insert(
                        name.clone(),
                        PortRange {
                            lo: config.vpn.port_range_1.0,
                            hi: config.vpn.port_range_1.1,
                        },
                    );
                }
            }
            ace_types::VpnMode::Redundant => {
                let specs = [config.vpn.port_range_1, config.vpn.port_range_2];
                for (name, range) in vpn_names.iter().zip(specs) {
                    ranges.insert(name.clone(), PortRange { lo: range.0, hi: range.1 });
                }
            }
        }
        let ports = Arc::new(PortAllocator::new(ranges, config.replicas.max_active_replicas));

        let vpn_health = Arc::new(VpnHealthMonitor::new(
            config.vpn.mode,
            &vpn_names,
            Duration::from_secs(config.vpn.stabilization_s),
            Duration::from_secs(config.vpn.port_cache_ttl_s),
        ));

        let mut hooks = ProxyHookRegistry::new();
        if let Some(url) = &config.server.ts_proxy_url {
            hooks.register(Arc::new(HttpProxyHook::ts(url.clone())));
        }
        if let Some(url) = &config.server.hls_proxy_url {
            hooks.register(Arc::new(HttpProxyHook::hls(url.clone())));
        }

        let state = Arc::new(StateStore::new(
            ports.clone(),
            hooks,
            config.replicas.max_streams_per_engine,
        ));
        let cache = Arc::new(ResponseCache::new(Duration::from_secs(3)));
        let driver = Arc::new(ContainerDriver::new());
        let circuit = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker.threshold,
            Duration::from_secs(config.circuit_breaker.timeout_s),
        ));

        let mut variant = EngineVariant::new("acestream", "acestream/engine:latest");
        if let Some(template) = config.variant_overrides.by_name.get(&variant.name).cloned() {
            variant.apply_override(template);
        }
        let provisioner = Arc::new(Provisioner::new(
            driver.clone(),
            ports.clone(),
            state.clone(),
            vpn_health.clone(),
            circuit.clone(),
            variant,
            config.replicas.max_active_replicas,
        ));

        let autoscaler = Arc::new(Autoscaler::new(
            state.clone(),
            provisioner.clone(),
            vpn_health.clone(),
            AutoscalerConfig {
                min_replicas: config.replicas.min_replicas,
                max_active_replicas: config.replicas.max_active_replicas,
                max_streams_per_engine: config.replicas.max_streams_per_engine,
                grace_period: chrono::Duration::seconds(config.replicas.engine_grace_period_s as i64),
                interval: Duration::from_secs(config.replicas.autoscale_interval_s),
                auto_delete: config.replicas.auto_delete,
            },
            cache.clone(),
        ));

        let engine_health = Arc::new(EngineHealthMonitor::new(
            state.clone(),
            driver.clone(),
            vpn_health.clone(),
            HealthMonitorConfig {
                probe_timeout: Duration::from_secs(5),
                cache_cleanup_interval: chrono::Duration::minutes(10),
            },
        ));

        let looping_streams = Arc::new(LoopingStreams::new());
        let loop_detector = Arc::new(StreamLoopDetector::new(
            state.clone(),
            looping_streams.clone(),
            LoopDetectorConfig {
                enabled: config.loop_detection.enabled,
                threshold: chrono::Duration::seconds(config.loop_detection.threshold_s as i64),
                retention: chrono::Duration::minutes(config.loop_detection.retention_minutes as i64),
            },
        ));

        let trace = Arc::new(DebugTraceSink::start(
            config.debug.mode,
            config.debug.log_dir.clone(),
            uuid::Uuid::new_v4().to_string(),
        ));

        let metrics = Arc::new(AceMetrics::new()?);
        let rate_limiter = Arc::new(ProvisioningLimiter::new(
            config.server.provisioning_rate_limit_per_minute,
        ));
        let runtime_config = Arc::new(RwLock::new(RuntimeConfig {
            stream_mode: config.stream_mode.mode,
            loop_detection_enabled: config.loop_detection.enabled,
        }));

        Ok(Self(Arc::new(Inner {
            config,
            state,
            ports,
            vpn_health,
            driver,
            provisioner,
            autoscaler,
            engine_health,
            loop_detector,
            looping_streams,
            circuit,
            cache,
            trace,
            metrics,
            rate_limiter,
            runtime_config,
            started_at: chrono::Utc::now(),
        })))
    }

    /// Spawns every periodic worker (spec §5: "Periodic workers ... run on
    /// independent timers"). Each worker stops on the next tick after
    /// `shutdown` is set to `true`.
    pub fn spawn_background_tasks(&self, shutdown: tokio::sync::watch::Receiver<bool>) {
        self.spawn_autoscaler(shutdown.clone());
        self.spawn_engine_health(shutdown.clone());
        self.spawn_loop_detector(shutdown.clone());
        self.spawn_vpn_poll(shutdown);
    }

    fn spawn_autoscaler(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                inner.config.replicas.autoscale_interval_s.max(1),
            ));
            let mut initial = true;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = inner.autoscaler.run_cycle(initial).await;
                        initial = false;
                        info!(started = outcome.started, reaped = outcome.reaped, "autoscale cycle complete");
                    }
                    _ = shutdown.changed() => if *shutdown.borrow() { break; }
                }
            }
        });
    }

    fn spawn_engine_health(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                inner.config.replicas.health_check_interval_s.max(1),
            ));
            loop {
                tokio::select! {
                    _ = ticker.tick() => { inner.engine_health.run_cycle().await; }
                    _ = shutdown.changed() => if *shutdown.borrow() { break; }
                }
            }
        });
    }

    fn spawn_loop_detector(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let inner = self.0.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                inner.config.loop_detection.check_interval_s.max(1),
            ));
            loop {
                tokio::select! {
                    _ = ticker.tick() => { inner.loop_detector.run_cycle().await; }
                    _ = shutdown.changed() => if *shutdown.borrow() { break; }
                }
            }
        });
    }

    fn spawn_vpn_poll(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        if self.0.vpn_health.mode() == ace_types::VpnMode::None {
            return;
        }
        let inner = self.0.clone();
        let targets: Vec<VpnTarget> = inner
            .config
            .vpn_names()
            .into_iter()
            .map(|name| VpnTarget { name, api_port: inner.config.vpn.api_port })
            .collect();
        let worker = Arc::new(VpnPollWorker::new(
            inner.driver.clone(),
            inner.vpn_health.clone(),
            inner.state.clone(),
            inner.provisioner.clone(),
            VpnProbe::new(Duration::from_secs(5)),
            targets,
            inner.cache.clone(),
        ));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                inner.config.replicas.health_check_interval_s.max(1),
            ));
            loop {
                tokio::select! {
                    _ = ticker.tick() => { worker.run_cycle().await; }
                    _ = shutdown.changed() => if *shutdown.borrow() { break; }
                }
            }
        });
    }
}
