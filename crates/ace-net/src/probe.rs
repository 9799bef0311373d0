//! Liveness and forwarded-port probing against a VPN sidecar's control API.

use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::vpn_health::ObservedVpn;

#[derive(Debug, Deserialize)]
struct ForwardedPortResponse {
    #[serde(default)]
    port: Option<u32>,
}

pub struct VpnProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl VpnProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Probes `vpn_host:api_port`'s forwarded-port endpoint.
    ///
    /// Probe timeouts count as Unhealthy. A 4xx/5xx response with a
    /// well-formed JSON body is "no forwarded port available" — degraded,
    /// not failed: the tunnel is still healthy, it simply has no port to
    /// report yet (spec §4.2 Failure modes).
    pub async fn probe(&self, vpn_host: &str, api_port: u16, container_running: bool) -> ObservedVpn {
        if !container_running {
            return ObservedVpn {
                running: false,
                tunnel_healthy: false,
                forwarded_port: None,
            };
        }

        let url = format!("http://{vpn_host}:{api_port}/forwarded-port");
        let response = tokio::time::timeout(self.timeout, self.client.get(&url).send()).await;

        match response {
            Ok(Ok(resp)) => {
                let status = resp.status();
                if status.is_success() {
                    match resp.json::<ForwardedPortResponse>().await {
                        Ok(body) => ObservedVpn {
                            running: true,
                            tunnel_healthy: true,
                            forwarded_port: body.port,
                        },
                        Err(_) => ObservedVpn {
                            running: true,
                            tunnel_healthy: true,
                            forwarded_port: None,
                        },
                    }
                } else if let Ok(_body) = resp.json::<serde_json::Value>().await {
                    debug!(vpn = vpn_host, %status, "vpn control api reported no forwarded port (degraded)");
                    ObservedVpn {
                        running: true,
                        tunnel_healthy: true,
                        forwarded_port: None,
                    }
                } else {
                    ObservedVpn {
                        running: true,
                        tunnel_healthy: false,
                        forwarded_port: None,
                    }
                }
            }
            Ok(Err(_)) | Err(_) => ObservedVpn {
                running: true,
                tunnel_healthy: false,
                forwarded_port: None,
            },
        }
    }
}
