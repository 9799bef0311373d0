//! VPN Health Monitor (C2, spec §4.2).
//!
//! Tracks per-VPN liveness and the cached forwarded P2P port, drives
//! Emergency Mode transitions in `redundant` mode, and enforces the
//! per-VPN stabilization window after a healthy transition.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ace_types::VpnMode;
use tracing::{info, warn};

use crate::error::{NetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnRunState {
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnHealthState {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Copy)]
pub enum StabilizationState {
    Stable,
    Stabilizing(Instant),
}

impl StabilizationState {
    fn is_stabilizing(&self, now: Instant) -> bool {
        matches!(self, StabilizationState::Stabilizing(until) if now < *until)
    }
}

/// What a single probe cycle observed about one VPN. `forwarded_port =
/// None` while `tunnel_healthy = true` means the control API answered with
/// a 4xx/5xx-plus-JSON "no forwarded port available" response — degraded,
/// not failed (spec §4.2 Failure modes).
#[derive(Debug, Clone)]
pub struct ObservedVpn {
    pub running: bool,
    pub tunnel_healthy: bool,
    pub forwarded_port: Option<u32>,
}

#[derive(Debug, Clone)]
struct VpnState {
    run: VpnRunState,
    health: VpnHealthState,
    stabilization: StabilizationState,
    forwarded_port: Option<u32>,
    forwarded_port_cached_at: Option<Instant>,
}

impl VpnState {
    fn fresh() -> Self {
        Self {
            run: VpnRunState::Stopped,
            health: VpnHealthState::Unknown,
            stabilization: StabilizationState::Stable,
            forwarded_port: None,
            forwarded_port_cached_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmergencyState {
    pub failed_vpn: String,
    pub healthy_vpn: String,
    pub entered_at: Instant,
}

/// System-wide actions the caller (autoscaler, provisioner, state store)
/// must take in response to an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpnEvent {
    EnteredEmergency { failed_vpn: String, healthy_vpn: String },
    ExitedEmergency { recovered_vpn: String },
    StabilizationStarted { vpn: String },
    PortChanged { vpn: String, new_port: u32 },
}

pub struct VpnHealthMonitor {
    mode: VpnMode,
    states: tokio::sync::Mutex<HashMap<String, VpnState>>,
    emergency: tokio::sync::Mutex<Option<EmergencyState>>,
    stabilization: Duration,
    port_cache_ttl: Duration,
}

impl VpnHealthMonitor {
    pub fn new(mode: VpnMode, vpn_names: &[String], stabilization: Duration, port_cache_ttl: Duration) -> Self {
        let states = vpn_names
            .iter()
            .map(|name| (name.clone(), VpnState::fresh()))
            .collect();
        Self {
            mode,
            states: tokio::sync::Mutex::new(states),
            emergency: tokio::sync::Mutex::new(None),
            stabilization,
            port_cache_ttl,
        }
    }

    pub fn mode(&self) -> VpnMode {
        self.mode
    }

    /// Feeds one probe cycle's observation for `vpn` into the state
    /// machine and returns whatever system-wide events it produced.
    ///
    /// This is the only mutating entry point — call it once per VPN per
    /// health-check tick.
    pub async fn record_observation(&self, vpn: &str, observed: ObservedVpn, now: Instant) -> Result<Vec<VpnEvent>> {
        let mut events = Vec::new();
        let mut states = self.states.lock().await;
        let state = states
            .get_mut(vpn)
            .ok_or_else(|| NetError::UnknownVpn(vpn.to_string()))?;

        let was_healthy = state.health == VpnHealthState::Healthy;
        state.run = if observed.running {
            VpnRunState::Running
        } else {
            VpnRunState::Stopped
        };
        state.health = if !observed.running {
            VpnHealthState::Unhealthy
        } else if observed.tunnel_healthy {
            VpnHealthState::Healthy
        } else {
            VpnHealthState::Unhealthy
        };
        let is_healthy_now = state.health == VpnHealthState::Healthy;

        if was_healthy && !is_healthy_now {
            warn!(vpn, "vpn transitioned healthy -> unhealthy");
            if self.mode == VpnMode::Redundant {
                drop(states);
                if let Some(healthy_vpn) = self.other_healthy_vpn(vpn).await {
                    let mut emergency = self.emergency.lock().await;
                    if emergency.is_none() {
                        *emergency = Some(EmergencyState {
                            failed_vpn: vpn.to_string(),
                            healthy_vpn: healthy_vpn.clone(),
                            entered_at: now,
                        });
                        events.push(VpnEvent::EnteredEmergency {
                            failed_vpn: vpn.to_string(),
                            healthy_vpn,
                        });
                    }
                }
                return Ok(events);
            }
        } else if !was_healthy && is_healthy_now {
            info!(vpn, "vpn transitioned unhealthy -> healthy, starting stabilization");
            state.stabilization = StabilizationState::Stabilizing(now + self.stabilization);
            events.push(VpnEvent::StabilizationStarted { vpn: vpn.to_string() });

            let should_exit = {
                let emergency = self.emergency.lock().await;
                matches!(emergency.as_ref(), Some(e) if e.failed_vpn == vpn)
            };
            if should_exit {
                let mut emergency = self.emergency.lock().await;
                *emergency = None;
                events.push(VpnEvent::ExitedEmergency { recovered_vpn: vpn.to_string() });
            }
        }

        if is_healthy_now {
            if let Some(new_port) = observed.forwarded_port {
                let changed = match state.forwarded_port {
                    Some(old) if old != new_port => true,
                    None => false,
                    _ => false,
                };
                let had_previous_stable_value = state.forwarded_port.is_some();
                state.forwarded_port = Some(new_port);
                state.forwarded_port_cached_at = Some(now);
                if changed && had_previous_stable_value {
                    events.push(VpnEvent::PortChanged {
                        vpn: vpn.to_string(),
                        new_port,
                    });
                }
            }
        }

        Ok(events)
    }

    async fn other_healthy_vpn(&self, failed: &str) -> Option<String> {
        let states = self.states.lock().await;
        states
            .iter()
            .find(|(name, s)| name.as_str() != failed && s.health == VpnHealthState::Healthy)
            .map(|(name, _)| name.clone())
    }

    pub async fn is_emergency(&self) -> bool {
        self.emergency.lock().await.is_some()
    }

    pub async fn emergency_state(&self) -> Option<(String, String)> {
        self.emergency
            .lock()
            .await
            .as_ref()
            .map(|e| (e.failed_vpn.clone(), e.healthy_vpn.clone()))
    }

    /// VPNs eligible to receive a new engine right now: Running, Healthy,
    /// not Stabilizing, and — if Emergency Mode is active — restricted to
    /// the designated healthy VPN only (spec §4.5 step 2).
    pub async fn eligible_vpns(&self, now: Instant) -> Vec<String> {
        let emergency = self.emergency.lock().await.clone();
        let states = self.states.lock().await;
        let base: Vec<String> = states
            .iter()
            .filter(|(_, s)| {
                s.run == VpnRunState::Running
                    && s.health == VpnHealthState::Healthy
                    && !s.stabilization.is_stabilizing(now)
            })
            .map(|(name, _)| name.clone())
            .collect();

        match emergency {
            Some(e) => base.into_iter().filter(|v| *v == e.healthy_vpn).collect(),
            None => base,
        }
    }

    pub async fn cached_forwarded_port(&self, vpn: &str, now: Instant) -> Option<u32> {
        let states = self.states.lock().await;
        let state = states.get(vpn)?;
        let cached_at = state.forwarded_port_cached_at?;
        if now.duration_since(cached_at) > self.port_cache_ttl {
            return None;
        }
        state.forwarded_port
    }

    pub async fn snapshot(&self) -> HashMap<String, VpnStatusView> {
        let states = self.states.lock().await;
        let emergency = self.emergency.lock().await;
        let now = Instant::now();
        states
            .iter()
            .map(|(name, s)| {
                (
                    name.clone(),
                    VpnStatusView {
                        running: s.run == VpnRunState::Running,
                        healthy: s.health == VpnHealthState::Healthy,
                        stabilizing: s.stabilization.is_stabilizing(now),
                        forwarded_port: s.forwarded_port,
                        is_emergency_target: emergency.as_ref().map(|e| e.healthy_vpn == *name).unwrap_or(false),
                        is_emergency_failure: emergency.as_ref().map(|e| e.failed_vpn == *name).unwrap_or(false),
                    },
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct VpnStatusView {
    pub running: bool,
    pub healthy: bool,
    pub stabilizing: bool,
    pub forwarded_port: Option<u32>,
    pub is_emergency_target: bool,
    pub is_emergency_failure: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(running: bool, healthy: bool, port: Option<u32>) -> ObservedVpn {
        ObservedVpn {
            running,
            tunnel_healthy: healthy,
            forwarded_port: port,
        }
    }

    #[tokio::test]
    async fn healthy_to_unhealthy_enters_emergency_when_peer_healthy() {
        let names = vec!["vpn1".to_string(), "vpn2".to_string()];
        let monitor = VpnHealthMonitor::new(VpnMode::Redundant, &names, Duration::from_secs(120), Duration::from_secs(60));
        let now = Instant::now();

        monitor.record_observation("vpn1", observed(true, true, Some(100)), now).await.unwrap();
        monitor.record_observation("vpn2", observed(true, true, Some(200)), now).await.unwrap();

        let events = monitor
            .record_observation("vpn2", observed(false, false, None), now)
            .await
            .unwrap();

        assert!(events.iter().any(|e| matches!(e, VpnEvent::EnteredEmergency { failed_vpn, healthy_vpn } if failed_vpn == "vpn2" && healthy_vpn == "vpn1")));
        assert!(monitor.is_emergency().await);

        let eligible = monitor.eligible_vpns(now).await;
        assert_eq!(eligible, vec!["vpn1".to_string()]);
    }

    #[tokio::test]
    async fn recovery_starts_stabilization_and_exits_emergency() {
        let names = vec!["vpn1".to_string(), "vpn2".to_string()];
        let monitor = VpnHealthMonitor::new(VpnMode::Redundant, &names, Duration::from_secs(120), Duration::from_secs(60));
        let now = Instant::now();

        monitor.record_observation("vpn1", observed(true, true, Some(100)), now).await.unwrap();
        monitor.record_observation("vpn2", observed(true, true, Some(200)), now).await.unwrap();
        monitor.record_observation("vpn2", observed(false, false, None), now).await.unwrap();
        assert!(monitor.is_emergency().await);

        let events = monitor
            .record_observation("vpn2", observed(true, true, Some(200)), now)
            .await
            .unwrap();

        assert!(events.iter().any(|e| matches!(e, VpnEvent::ExitedEmergency { .. })));
        assert!(!monitor.is_emergency().await);

        // still stabilizing immediately after recovery: not yet eligible
        let eligible = monitor.eligible_vpns(now).await;
        assert!(!eligible.contains(&"vpn2".to_string()));

        // after the stabilization window elapses, it becomes eligible again
        let later = now + Duration::from_secs(121);
        let eligible_later = monitor.eligible_vpns(later).await;
        assert!(eligible_later.contains(&"vpn2".to_string()));
    }

    #[tokio::test]
    async fn port_change_detected_only_against_a_prior_stable_value() {
        let names = vec!["vpn1".to_string()];
        let monitor = VpnHealthMonitor::new(VpnMode::Single, &names, Duration::from_secs(120), Duration::from_secs(60));
        let now = Instant::now();

        // first observation establishes the baseline — not a "change"
        let events = monitor
            .record_observation("vpn1", observed(true, true, Some(65290)), now)
            .await
            .unwrap();
        assert!(!events.iter().any(|e| matches!(e, VpnEvent::PortChanged { .. })));

        let events = monitor
            .record_observation("vpn1", observed(true, true, Some(40648)), now)
            .await
            .unwrap();
        assert!(events.iter().any(|e| matches!(e, VpnEvent::PortChanged { vpn, new_port } if vpn == "vpn1" && *new_port == 40648)));
    }
}
