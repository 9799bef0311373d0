use ace_docker::{ContainerDriver, ContainerSpec};
use std::collections::HashMap;

fn sample_spec(name: &str) -> ContainerSpec {
    let mut port_bindings = HashMap::new();
    port_bindings.insert(40000u16, 6878u16);
    ContainerSpec {
        name: name.to_string(),
        image: "acestream/engine:latest".to_string(),
        env: vec!["HTTP_PORT=6878".to_string()],
        cmd: vec![],
        port_bindings,
        labels: HashMap::new(),
        network_mode_container: None,
    }
}

#[test]
fn container_spec_carries_port_bindings() {
    let spec = sample_spec("engine-test-1");
    assert_eq!(spec.port_bindings.get(&40000), Some(&6878));
}

#[tokio::test]
#[ignore = "requires a reachable docker daemon"]
async fn create_and_stop_round_trip() {
    let driver = ContainerDriver::new();
    let spec = sample_spec("ace-docker-it-roundtrip");
    let id = driver.create_and_start(spec).await.expect("create_and_start");
    driver.stop(&id, Some(5)).await.expect("stop");
}

#[tokio::test]
#[ignore = "requires a reachable docker daemon"]
async fn list_does_not_fail_when_empty() {
    let driver = ContainerDriver::new();
    let result = driver.list(vec!["control-plane.managed=true".to_string()]).await;
    assert!(result.is_ok());
}
