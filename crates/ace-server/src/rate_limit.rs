//! Provisioning rate limiter. Same token-bucket shape as
//! `vpn-proxy/src/rate_limit.rs`'s `TokenBucket`, applied to one shared
//! bucket for the whole `/provision*` surface rather than per-user buckets,
//! since this control plane has no per-caller identity of its own.

use std::time::Instant;

use tokio::sync::Mutex;

pub struct ProvisioningLimiter {
    inner: Mutex<TokenBucket>,
    limit_per_minute: u32,
}

struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_update = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn remaining(&mut self) -> u32 {
        self.refill();
        self.tokens.floor().max(0.0) as u32
    }
}

/// Response headers named in spec §6: `X-RateLimit-Provisioning-{Limit,
/// Remaining}`.
pub struct Admission {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
}

impl ProvisioningLimiter {
    pub fn new(limit_per_minute: u32) -> Self {
        let refill_per_sec = limit_per_minute as f64 / 60.0;
        Self {
            inner: Mutex::new(TokenBucket::new(limit_per_minute, refill_per_sec)),
            limit_per_minute,
        }
    }

    pub async fn admit(&self) -> Admission {
        let mut bucket = self.inner.lock().await;
        let allowed = bucket.try_consume();
        Admission {
            allowed,
            limit: self.limit_per_minute,
            remaining: bucket.remaining(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_the_configured_limit_then_rejects() {
        let limiter = ProvisioningLimiter::new(2);
        assert!(limiter.admit().await.allowed);
        assert!(limiter.admit().await.allowed);
        assert!(!limiter.admit().await.allowed);
    }
}
