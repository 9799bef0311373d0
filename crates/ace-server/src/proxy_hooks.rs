//! Concrete Stream-Proxy Sync Hooks (C11, spec §4.11): one per stream
//! transport, each a thin `reqwest` POST to the proxy's own stop-by-key
//! endpoint. Registered into `ace_state::ProxyHookRegistry` at startup.

use async_trait::async_trait;
use reqwest::Client;

use ace_state::ProxyHook;

pub struct HttpProxyHook {
    name: &'static str,
    client: Client,
    base_url: String,
}

impl HttpProxyHook {
    pub fn ts(base_url: impl Into<String>) -> Self {
        Self {
            name: "ts-proxy",
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn hls(base_url: impl Into<String>) -> Self {
        Self {
            name: "hls-proxy",
            client: Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ProxyHook for HttpProxyHook {
    fn name(&self) -> &str {
        self.name
    }

    async fn stop_stream_by_key(&self, key: &str) -> Result<(), String> {
        let url = format!("{}/stop/{}", self.base_url.trim_end_matches('/'), key);
        self.client
            .post(&url)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}
