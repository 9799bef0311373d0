//! VPN Poll Worker — the timer-driven orchestrator around C2 (spec §4.2,
//! §5). `ace_net::VpnHealthMonitor` is a pure state machine; this module
//! calls it once per VPN per tick and reacts to whatever `VpnEvent`s come
//! back: an emergency transition evicts every engine bound to the failed
//! VPN (spec §8 property 8), and a forwarded-port change replaces the
//! forwarded engine on the VPN that reported it (spec §8 scenario S5).

use std::sync::Arc;
use std::time::Instant;

use ace_docker::ContainerDriver;
use ace_net::{VpnEvent, VpnHealthMonitor, VpnProbe};
use ace_state::{ResponseCache, StateStore};
use tracing::{info, warn};

use crate::provisioner::{AceProvisionRequest, Provisioner};

#[derive(Debug, Clone)]
pub struct VpnTarget {
    pub name: String,
    pub api_port: u16,
}

pub struct VpnPollWorker {
    driver: Arc<ContainerDriver>,
    vpn_health: Arc<VpnHealthMonitor>,
    state: Arc<StateStore>,
    provisioner: Arc<Provisioner>,
    probe: VpnProbe,
    targets: Vec<VpnTarget>,
    cache: Arc<ResponseCache>,
}

impl VpnPollWorker {
    pub fn new(
        driver: Arc<ContainerDriver>,
        vpn_health: Arc<VpnHealthMonitor>,
        state: Arc<StateStore>,
        provisioner: Arc<Provisioner>,
        probe: VpnProbe,
        targets: Vec<VpnTarget>,
        cache: Arc<ResponseCache>,
    ) -> Self {
        Self {
            driver,
            vpn_health,
            state,
            provisioner,
            probe,
            targets,
            cache,
        }
    }

    /// One probe cycle across every configured VPN target.
    pub async fn run_cycle(&self) {
        let now = Instant::now();
        for target in &self.targets {
            let running = self
                .driver
                .inspect(&target.name)
                .await
                .ok()
                .and_then(|c| c.state)
                .and_then(|s| s.running)
                .unwrap_or(false);

            let observed = self.probe.probe(&target.name, target.api_port, running).await;
            match self.vpn_health.record_observation(&target.name, observed, now).await {
                Ok(events) => {
                    for event in events {
                        self.handle_event(event).await;
                    }
                }
                Err(e) => warn!(vpn = %target.name, error = %e, "vpn observation rejected"),
            }
        }
    }

    async fn handle_event(&self, event: VpnEvent) {
        match event {
            VpnEvent::EnteredEmergency { failed_vpn, healthy_vpn } => {
                warn!(failed_vpn, healthy_vpn, "vpn entered emergency mode, evicting its engines");
                let mut evicted_any = false;
                for engine in self.state.list_engines().await {
                    if engine.vpn_container.as_deref() == Some(failed_vpn.as_str()) {
                        match self.state.remove_engine(&engine.container_id).await {
                            Ok(_) => evicted_any = true,
                            Err(e) => warn!(container_id = %engine.container_id, error = %e, "failed to evict engine during emergency transition"),
                        }
                    }
                }
                if evicted_any {
                    self.cache.invalidate_all().await;
                }
            }
            VpnEvent::ExitedEmergency { recovered_vpn } => {
                info!(recovered_vpn, "vpn exited emergency mode");
                self.cache.invalidate_all().await;
            }
            VpnEvent::StabilizationStarted { vpn } => {
                info!(vpn, "vpn entered stabilization window");
            }
            VpnEvent::PortChanged { vpn, new_port } => {
                info!(vpn, new_port, "vpn forwarded port changed, replacing forwarded engine");
                let Some(old_container_id) = self.state.get_forwarded_engine_for_vpn(&vpn).await else {
                    return;
                };
                if let Err(e) = self.state.remove_engine(&old_container_id).await {
                    warn!(container_id = %old_container_id, error = %e, "failed to remove stale forwarded engine");
                    return;
                }
                self.cache.invalidate_all().await;
                match self
                    .provisioner
                    .provision_acestream(AceProvisionRequest::default())
                    .await
                {
                    Ok(response) => {
                        info!(container_id = %response.container_id, "replacement forwarded engine provisioned");
                        self.cache.invalidate_all().await;
                    }
                    Err(e) => warn!(vpn, error = %e, "failed to provision replacement forwarded engine"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ace_net::{PortAllocator, PortRange, GLOBAL_POOL};
    use ace_state::{CircuitBreakerRegistry, ProxyHookRegistry};
    use ace_types::{Engine, EngineVariant, VpnMode};
    use std::collections::HashMap;
    use std::time::Duration;

    fn worker(names: &[&str]) -> VpnPollWorker {
        let vpn_names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let vpn_health = Arc::new(VpnHealthMonitor::new(
            VpnMode::Redundant,
            &vpn_names,
            Duration::from_secs(120),
            Duration::from_secs(60),
        ));
        let mut ranges = HashMap::new();
        for name in &vpn_names {
            ranges.insert(name.clone(), PortRange { lo: 40000, hi: 40009 });
        }
        ranges.insert(GLOBAL_POOL.to_string(), PortRange { lo: 41000, hi: 41009 });
        let ports = Arc::new(PortAllocator::new(ranges, 100));
        let state = Arc::new(StateStore::new(ports.clone(), ProxyHookRegistry::new(), 40));
        let circuit = Arc::new(CircuitBreakerRegistry::new(3, Duration::from_secs(30)));
        let variant = EngineVariant::new("acestream", "acestream/engine:latest");
        let provisioner = Arc::new(Provisioner::new(
            Arc::new(ContainerDriver::default()),
            ports,
            state.clone(),
            vpn_health.clone(),
            circuit,
            variant,
            100,
        ));
        VpnPollWorker::new(
            Arc::new(ContainerDriver::default()),
            vpn_health,
            state,
            provisioner,
            VpnProbe::new(Duration::from_secs(1)),
            vpn_names.iter().map(|n| VpnTarget { name: n.clone(), api_port: 8000 }).collect(),
            Arc::new(ResponseCache::new(Duration::from_secs(3))),
        )
    }

    async fn seed_engine(worker: &VpnPollWorker, id: &str, vpn: &str) {
        let mut engine = Engine::new(id.to_string(), id.to_string(), vpn.to_string(), 40000);
        engine = engine.with_vpn(vpn.to_string());
        worker.state.register_engine(engine).await.unwrap();
    }

    #[tokio::test]
    async fn entered_emergency_evicts_engines_bound_to_failed_vpn() {
        let worker = worker(&["vpn1", "vpn2"]);
        seed_engine(&worker, "eng-vpn1", "vpn1").await;
        seed_engine(&worker, "eng-vpn2", "vpn2").await;

        worker
            .handle_event(VpnEvent::EnteredEmergency {
                failed_vpn: "vpn1".to_string(),
                healthy_vpn: "vpn2".to_string(),
            })
            .await;

        assert!(worker.state.get_engine("eng-vpn1").await.is_err());
        assert!(worker.state.get_engine("eng-vpn2").await.is_ok());
    }

    #[tokio::test]
    async fn port_changed_without_existing_forwarded_engine_is_a_noop() {
        let worker = worker(&["vpn1"]);
        seed_engine(&worker, "eng-vpn1", "vpn1").await;

        worker
            .handle_event(VpnEvent::PortChanged {
                vpn: "vpn1".to_string(),
                new_port: 12345,
            })
            .await;

        assert!(worker.state.get_engine("eng-vpn1").await.is_ok());
    }
}
