use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ace_control::{Autoscaler, AutoscalerConfig, Provisioner};
use ace_docker::ContainerDriver;
use ace_net::{PortAllocator, PortRange, VpnHealthMonitor, GLOBAL_POOL};
use ace_state::{ProxyHookRegistry, ResponseCache, StateStore};
use ace_types::{Engine, EngineVariant, VpnMode};

fn env() -> (Arc<StateStore>, Arc<PortAllocator>, Arc<Autoscaler>) {
    let ranges = HashMap::from([(GLOBAL_POOL.to_string(), PortRange { lo: 50000, hi: 50019 })]);
    let ports = Arc::new(PortAllocator::new(ranges, 20));
    let state = Arc::new(StateStore::new(ports.clone(), ProxyHookRegistry::new(), 5));
    let vpn_health = Arc::new(VpnHealthMonitor::new(
        VpnMode::None,
        &[],
        Duration::from_secs(120),
        Duration::from_secs(60),
    ));
    let circuit = Arc::new(ace_state::CircuitBreakerRegistry::new(3, Duration::from_secs(30)));
    let variant = EngineVariant::new("acestream", "acestream/engine:latest");
    let provisioner = Arc::new(Provisioner::new(
        Arc::new(ContainerDriver::default()),
        ports.clone(),
        state.clone(),
        vpn_health.clone(),
        circuit,
        variant,
        20,
    ));

    let config = AutoscalerConfig {
        min_replicas: 2,
        max_active_replicas: 20,
        max_streams_per_engine: 5,
        grace_period: chrono::Duration::seconds(60),
        interval: Duration::from_secs(30),
        auto_delete: true,
    };
    let cache = Arc::new(ResponseCache::new(Duration::from_secs(3)));
    let autoscaler = Arc::new(Autoscaler::new(state.clone(), provisioner, vpn_health, config, cache));
    (state, ports, autoscaler)
}

async fn seed_idle_engine(state: &StateStore, ports: &PortAllocator, id: &str, idle_for: chrono::Duration) {
    let port = ports.reserve(GLOBAL_POOL).await.unwrap();
    let mut engine = Engine::new(id.to_string(), id.to_string(), id.to_string(), port);
    engine.last_stream_usage = chrono::Utc::now() - idle_for;
    state.register_engine(engine).await.unwrap();
}

#[tokio::test]
async fn gc_never_drops_below_min_replicas() {
    let (state, ports, autoscaler) = env();
    for i in 0..3 {
        seed_idle_engine(&state, &ports, &format!("eng-{i}"), chrono::Duration::hours(1)).await;
    }

    let outcome = autoscaler.run_cycle(false).await;
    assert_eq!(outcome.reaped, 1, "only one engine should be reaped, leaving MIN_REPLICAS=2 free");
    assert_eq!(state.list_engines().await.len(), 2);
}

#[tokio::test]
async fn gc_skips_engines_within_grace_period() {
    let (state, ports, autoscaler) = env();
    seed_idle_engine(&state, &ports, "eng-fresh", chrono::Duration::seconds(5)).await;
    seed_idle_engine(&state, &ports, "eng-stale", chrono::Duration::hours(1)).await;
    seed_idle_engine(&state, &ports, "eng-stale-2", chrono::Duration::hours(1)).await;

    let outcome = autoscaler.run_cycle(false).await;
    assert_eq!(outcome.reaped, 1);
    assert!(state.get_engine("eng-fresh").await.is_ok());
}
