//! Circuit breaker (C10, spec §4.10), keyed per operation class
//! (`"provisioning"`, `"docker"`, ...) so a run of Docker-daemon failures
//! trips only Docker-backed operations, not the whole control plane.
//!
//! Closed -> Open after `failure_threshold` consecutive failures. Open
//! rejects everything until `recovery_timeout` elapses, then moves to
//! Half-Open and admits exactly one probe; that probe's outcome decides
//! Closed (success) or back to Open (failure).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    AllowedAsProbe,
    Rejected,
}

pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Breaker>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            failure_threshold,
            recovery_timeout,
        }
    }

    /// Call before attempting an operation in `class`. A `Rejected` result
    /// means the caller must fail fast without attempting the call at all.
    pub async fn admit(&self, class: &str) -> Admission {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers.entry(class.to_string()).or_insert_with(Breaker::new);

        match breaker.state {
            State::Closed => Admission::Allowed,
            State::HalfOpen => Admission::Rejected,
            State::Open => {
                let elapsed = breaker.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.recovery_timeout {
                    breaker.state = State::HalfOpen;
                    Admission::AllowedAsProbe
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    pub async fn record_success(&self, class: &str) {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers.entry(class.to_string()).or_insert_with(Breaker::new);
        breaker.state = State::Closed;
        breaker.consecutive_failures = 0;
        breaker.opened_at = None;
    }

    pub async fn record_failure(&self, class: &str) {
        let mut breakers = self.breakers.lock().await;
        let breaker = breakers.entry(class.to_string()).or_insert_with(Breaker::new);
        match breaker.state {
            State::HalfOpen => {
                breaker.state = State::Open;
                breaker.opened_at = Some(Instant::now());
                breaker.consecutive_failures = self.failure_threshold;
            }
            State::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.failure_threshold {
                    breaker.state = State::Open;
                    breaker.opened_at = Some(Instant::now());
                }
            }
            State::Open => {}
        }
    }

    pub async fn is_open(&self, class: &str) -> bool {
        let breakers = self.breakers.lock().await;
        matches!(breakers.get(class).map(|b| b.state), Some(State::Open))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let reg = CircuitBreakerRegistry::new(3, Duration::from_secs(30));
        for _ in 0..2 {
            reg.record_failure("docker").await;
        }
        assert_eq!(reg.admit("docker").await, Admission::Allowed);
        reg.record_failure("docker").await;
        assert_eq!(reg.admit("docker").await, Admission::Rejected);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let reg = CircuitBreakerRegistry::new(3, Duration::from_secs(30));
        reg.record_failure("docker").await;
        reg.record_failure("docker").await;
        reg.record_success("docker").await;
        reg.record_failure("docker").await;
        assert_eq!(reg.admit("docker").await, Admission::Allowed);
    }

    #[tokio::test]
    async fn half_open_admits_a_single_probe_after_recovery_timeout() {
        let reg = CircuitBreakerRegistry::new(1, Duration::from_millis(20));
        reg.record_failure("docker").await;
        assert_eq!(reg.admit("docker").await, Admission::Rejected);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(reg.admit("docker").await, Admission::AllowedAsProbe);
        assert_eq!(reg.admit("docker").await, Admission::Rejected);
    }

    #[tokio::test]
    async fn failed_probe_reopens_the_circuit() {
        let reg = CircuitBreakerRegistry::new(1, Duration::from_millis(20));
        reg.record_failure("docker").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(reg.admit("docker").await, Admission::AllowedAsProbe);
        reg.record_failure("docker").await;
        assert!(reg.is_open("docker").await);
    }
}
