//! Prometheus metrics (supplemented feature, grounded in
//! `vpn-proxy/src/metrics.rs`'s `ProxyMetrics`: a struct of registered
//! collectors plus a `gather`/encode method used by the `/metrics` route).

use prometheus::{
    register_gauge, register_gauge_vec, register_histogram, Encoder, Gauge, GaugeVec, Histogram,
    Registry, TextEncoder,
};

#[derive(Clone)]
pub struct AceMetrics {
    pub engines_total: Gauge,
    pub engines_free: Gauge,
    pub active_streams: Gauge,
    pub circuit_state: GaugeVec,
    pub provisioning_duration_seconds: Histogram,
    registry: Registry,
}

impl AceMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let engines_total = register_gauge!("ace_engines_total", "Total engines tracked")?;
        let engines_free = register_gauge!("ace_engines_free", "Engines with zero active streams")?;
        let active_streams = register_gauge!("ace_active_streams", "Streams currently started")?;
        let circuit_state = register_gauge_vec!(
            "ace_circuit_state",
            "1 if the named circuit breaker class is open, else 0",
            &["class"]
        )?;
        let provisioning_duration_seconds = register_histogram!(
            "ace_provisioning_duration_seconds",
            "Time to provision one engine",
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
        )?;

        registry.register(Box::new(engines_total.clone()))?;
        registry.register(Box::new(engines_free.clone()))?;
        registry.register(Box::new(active_streams.clone()))?;
        registry.register(Box::new(circuit_state.clone()))?;
        registry.register(Box::new(provisioning_duration_seconds.clone()))?;

        Ok(Self {
            engines_total,
            engines_free,
            active_streams,
            circuit_state,
            provisioning_duration_seconds,
            registry,
        })
    }

    pub fn set_engine_gauges(&self, total: usize, free: usize, active_streams: usize) {
        self.engines_total.set(total as f64);
        self.engines_free.set(free as f64);
        self.active_streams.set(active_streams as f64);
    }

    pub fn observe_provisioning_duration(&self, seconds: f64) {
        self.provisioning_duration_seconds.observe(seconds);
    }

    pub fn set_circuit_open(&self, class: &str, open: bool) {
        self.circuit_state
            .with_label_values(&[class])
            .set(if open { 1.0 } else { 0.0 });
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
