//! Provisioner (C5, spec §4.5).
//!
//! Lock ordering when multiple are taken: `vpn_assignment_lock -> state_lock
//! -> port_lock`. `state_lock` (owned by `ace_state::StateStore`) is never
//! held across a container driver call — every await on
//! `ContainerDriver::create_and_start` happens after this module's own
//! locks have already been released.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use ace_docker::{ContainerDriver, ContainerSpec};
use ace_net::{PortAllocator, VpnHealthMonitor, GLOBAL_POOL};
use ace_state::{Admission, CircuitBreakerRegistry, StateStore};
use ace_types::labels;
use ace_types::{Engine, EngineVariant, VpnMode};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::error::{ControlError, Result};

pub const CIRCUIT_CLASS: &str = "provisioning";

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct AceProvisionRequest {
    pub image: Option<String>,
    pub labels: HashMap<String, String>,
    pub env: Option<Vec<String>>,
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ProvisionResponse {
    pub container_id: String,
    pub host: String,
    pub host_http_port: u16,
    pub container_http_port: u16,
    pub container_https_port: Option<u16>,
    pub forwarded: bool,
    pub p2p_port: Option<u32>,
}

const CONTAINER_HTTP_PORT: u16 = 6878;
const CONTAINER_HTTPS_PORT: u16 = 6879;

pub struct Provisioner {
    driver: Arc<ContainerDriver>,
    ports: Arc<PortAllocator>,
    state: Arc<StateStore>,
    vpn_health: Arc<VpnHealthMonitor>,
    circuit: Arc<CircuitBreakerRegistry>,
    variant: EngineVariant,
    max_active_replicas: usize,
    /// `vpn_assignment_lock`: guards VPN selection and the pending-count
    /// map. Held only for selection and counter mutation, never across a
    /// container driver call (spec §5).
    pending: Mutex<HashMap<String, i64>>,
}

impl Provisioner {
    pub fn new(
        driver: Arc<ContainerDriver>,
        ports: Arc<PortAllocator>,
        state: Arc<StateStore>,
        vpn_health: Arc<VpnHealthMonitor>,
        circuit: Arc<CircuitBreakerRegistry>,
        variant: EngineVariant,
        max_active_replicas: usize,
    ) -> Self {
        Self {
            driver,
            ports,
            state,
            vpn_health,
            circuit,
            variant,
            max_active_replicas,
            pending: Mutex::new(HashMap::new()),
        }
    }

    #[instrument(skip(self, request), fields(vpn = tracing::field::Empty))]
    pub async fn provision_acestream(
        &self,
        request: AceProvisionRequest,
    ) -> Result<ProvisionResponse> {
        if !self.variant.enabled {
            return Err(ControlError::NoVpnAvailable);
        }

        if matches!(
            self.circuit.admit(CIRCUIT_CLASS).await,
            Admission::Rejected
        ) {
            return Err(ControlError::CircuitOpen(CIRCUIT_CLASS.to_string()));
        }

        if self.state.list_engines().await.len() >= self.max_active_replicas {
            return Err(ControlError::AtCapacity);
        }

        let now = Instant::now();
        let vpn = match self.select_vpn(now).await {
            Ok(vpn) => vpn,
            Err(e) => {
                self.circuit.record_failure(CIRCUIT_CLASS).await;
                return Err(e);
            }
        };
        tracing::Span::current().record("vpn", vpn.as_str());

        match self.provision_on_vpn(&request, &vpn, now).await {
            Ok(response) => {
                self.circuit.record_success(CIRCUIT_CLASS).await;
                Ok(response)
            }
            Err(e) => {
                self.decrement_pending(&vpn).await;
                self.circuit.record_failure(CIRCUIT_CLASS).await;
                Err(e)
            }
        }
    }

    /// VPN selection (spec §4.5 step 2), concurrency-safe via `pending`: a
    /// selection and its counter increment happen atomically under the same
    /// lock acquisition, so two concurrent provisioners never pick the same
    /// least-loaded VPN based on stale counts.
    async fn select_vpn(&self, now: Instant) -> Result<String> {
        match self.vpn_health.mode() {
            VpnMode::None => {
                let mut pending = self.pending.lock().await;
                *pending.entry(GLOBAL_POOL.to_string()).or_insert(0) += 1;
                Ok(GLOBAL_POOL.to_string())
            }
            VpnMode::Single | VpnMode::Redundant => {
                let eligible = self.vpn_health.eligible_vpns(now).await;
                if eligible.is_empty() {
                    return Err(ControlError::NoVpnAvailable);
                }

                let mut pending = self.pending.lock().await;
                let mut candidates: Vec<String> = eligible;
                candidates.sort();

                let mut best: Option<(String, i64)> = None;
                for vpn in candidates {
                    let engines_in_state = self.state.list_engines().await;
                    let in_state_count = engines_in_state
                        .iter()
                        .filter(|e| e.vpn_container.as_deref() == Some(vpn.as_str()))
                        .count() as i64;
                    let pending_count = *pending.get(&vpn).unwrap_or(&0);
                    let load = in_state_count + pending_count;
                    if best.as_ref().map(|(_, l)| load < *l).unwrap_or(true) {
                        best = Some((vpn, load));
                    }
                }

                let (vpn, _) = best.ok_or(ControlError::NoVpnAvailable)?;
                *pending.entry(vpn.clone()).or_insert(0) += 1;
                Ok(vpn)
            }
        }
    }

    async fn decrement_pending(&self, vpn: &str) {
        let mut pending = self.pending.lock().await;
        if let Some(count) = pending.get_mut(vpn) {
            *count -= 1;
        }
    }

    async fn provision_on_vpn(
        &self,
        request: &AceProvisionRequest,
        vpn: &str,
        now: Instant,
    ) -> Result<ProvisionResponse> {
        let port = match request.host_port {
            Some(p) => {
                self.ports.reserve_specific(vpn, p).await?;
                p
            }
            None => self.ports.reserve(vpn).await?,
        };

        let already_forwarded = self.state.has_forwarded_engine(vpn).await;
        let p2p_port = if already_forwarded {
            None
        } else {
            self.vpn_health.cached_forwarded_port(vpn, now).await
        };
        let forwarded = p2p_port.is_some();

        let container_name = format!("ace-engine-{}", uuid::Uuid::new_v4());
        let mut container_labels = request.labels.clone();
        container_labels.insert(labels::MANAGED.to_string(), "true".to_string());
        if vpn != GLOBAL_POOL {
            container_labels.insert(labels::VPN_CONTAINER.to_string(), vpn.to_string());
        }
        container_labels.insert(
            labels::FORWARDED.to_string(),
            forwarded.to_string(),
        );
        container_labels.insert(labels::HOST_HTTP_PORT.to_string(), port.to_string());

        let mut env = request.env.clone().unwrap_or_default();
        env.push(self.variant.render_http_flag(CONTAINER_HTTP_PORT));
        if let Some(https_flag) = self.variant.render_https_flag(CONTAINER_HTTPS_PORT) {
            env.push(https_flag);
        }
        if let Some(p2p) = p2p_port {
            if let Some(p2p_flag) = self.variant.render_p2p_flag(p2p) {
                env.push(p2p_flag);
            }
        }
        for (k, v) in &self.variant.default_params {
            env.push(format!("{k}={v}"));
        }

        let mut port_bindings = HashMap::new();
        port_bindings.insert(port, CONTAINER_HTTP_PORT);

        let spec = ContainerSpec {
            name: container_name.clone(),
            image: request.image.clone().unwrap_or_else(|| self.variant.image.clone()),
            env,
            cmd: Vec::new(),
            port_bindings,
            labels: container_labels,
            network_mode_container: if vpn != GLOBAL_POOL {
                Some(vpn.to_string())
            } else {
                None
            },
        };

        let container_id = match self.driver.create_and_start(spec).await {
            Ok(id) => id,
            Err(e) => {
                self.ports.release(vpn, port).await;
                return Err(e.into());
            }
        };

        let host = if vpn != GLOBAL_POOL {
            vpn.to_string()
        } else {
            container_name.clone()
        };

        let mut engine = Engine::new(container_id.clone(), container_name, host.clone(), port);
        if vpn != GLOBAL_POOL {
            engine = engine.with_vpn(vpn.to_string());
        }
        if let Some(p2p) = p2p_port {
            engine = engine.with_forwarded(p2p);
        }
        engine.labels = request.labels.clone();

        if let Err(e) = self.state.register_engine(engine).await {
            warn!(container_id = %container_id, error = %e, "failed to register newly started engine, rolling back");
            let _ = self.driver.stop(&container_id, Some(5)).await;
            self.ports.release(vpn, port).await;
            return Err(e.into());
        }

        self.decrement_pending(vpn).await;
        info!(container_id = %container_id, vpn, port, forwarded, "engine provisioned");

        Ok(ProvisionResponse {
            container_id,
            host,
            host_http_port: port,
            container_http_port: CONTAINER_HTTP_PORT,
            container_https_port: self.variant.https_port_template.as_ref().map(|_| CONTAINER_HTTPS_PORT),
            forwarded,
            p2p_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ace_net::PortRange;
    use ace_state::ProxyHookRegistry;
    use std::collections::HashMap as Map;
    use std::time::Duration;

    fn provisioner(mode: VpnMode, vpns: &[&str]) -> Provisioner {
        let names: Vec<String> = vpns.iter().map(|s| s.to_string()).collect();
        let vpn_health = Arc::new(VpnHealthMonitor::new(
            mode,
            &names,
            Duration::from_secs(120),
            Duration::from_secs(60),
        ));
        let mut ranges = Map::new();
        for name in &names {
            ranges.insert(name.clone(), PortRange { lo: 40000, hi: 40009 });
        }
        if ranges.is_empty() {
            ranges.insert(GLOBAL_POOL.to_string(), PortRange { lo: 40000, hi: 40009 });
        }
        let ports = Arc::new(PortAllocator::new(ranges, 100));
        let state = Arc::new(StateStore::new(ports.clone(), ProxyHookRegistry::new(), 40));
        let circuit = Arc::new(CircuitBreakerRegistry::new(3, Duration::from_secs(30)));
        let variant = EngineVariant::new("acestream", "acestream/engine:latest");
        Provisioner::new(
            Arc::new(ContainerDriver::default()),
            ports,
            state,
            vpn_health,
            circuit,
            variant,
            100,
        )
    }

    #[tokio::test]
    async fn select_vpn_errors_when_none_eligible() {
        let p = provisioner(VpnMode::Redundant, &["vpn1", "vpn2"]);
        let err = p.select_vpn(Instant::now()).await.unwrap_err();
        assert!(matches!(err, ControlError::NoVpnAvailable));
    }

    #[tokio::test]
    async fn select_vpn_picks_lowest_pending_load_under_concurrent_selection() {
        let p = provisioner(VpnMode::Redundant, &["vpn1", "vpn2"]);
        p.vpn_health
            .record_observation("vpn1", ace_net::ObservedVpn { running: true, tunnel_healthy: true, forwarded_port: None }, Instant::now())
            .await
            .unwrap();
        p.vpn_health
            .record_observation("vpn2", ace_net::ObservedVpn { running: true, tunnel_healthy: true, forwarded_port: None }, Instant::now())
            .await
            .unwrap();

        let now = Instant::now();
        let first = p.select_vpn(now).await.unwrap();
        let second = p.select_vpn(now).await.unwrap();
        assert_ne!(first, second, "two concurrent selections should balance across VPNs via pending counts");
    }

    #[tokio::test]
    async fn none_mode_always_uses_global_pool() {
        let p = provisioner(VpnMode::None, &[]);
        let vpn = p.select_vpn(Instant::now()).await.unwrap();
        assert_eq!(vpn, GLOBAL_POOL);
    }
}
