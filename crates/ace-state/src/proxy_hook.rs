//! Stream-Proxy Sync Hook (C11, spec §4.11).
//!
//! Whenever a stream transitions to `ended`, the store calls every
//! registered hook synchronously, inside the same logical operation that
//! flipped the stream's status — but never while holding `state_lock`
//! (see `store::StateStore::on_stream_ended`), since the hook makes an
//! outbound call that must not block other state operations. Failures are
//! logged and never propagated: ending must not be blocked by proxy
//! cleanup.

use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait ProxyHook: Send + Sync {
    fn name(&self) -> &str;
    async fn stop_stream_by_key(&self, key: &str) -> Result<(), String>;
}

pub struct ProxyHookRegistry {
    hooks: Vec<std::sync::Arc<dyn ProxyHook>>,
}

impl ProxyHookRegistry {
    pub fn new() -> Self {
        Self { hooks: Vec::new() }
    }

    pub fn register(&mut self, hook: std::sync::Arc<dyn ProxyHook>) {
        self.hooks.push(hook);
    }

    pub async fn notify_stream_ended(&self, key: &str) {
        for hook in &self.hooks {
            if let Err(e) = hook.stop_stream_by_key(key).await {
                warn!(hook = hook.name(), key, error = %e, "proxy cleanup hook failed, stream still ends");
            }
        }
    }
}

impl Default for ProxyHookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// No-op hook used where no TS/HLS proxy is wired up (tests, standalone
/// runs).
pub struct NullProxyHook;

#[async_trait]
impl ProxyHook for NullProxyHook {
    fn name(&self) -> &str {
        "null"
    }

    async fn stop_stream_by_key(&self, _key: &str) -> Result<(), String> {
        Ok(())
    }
}
