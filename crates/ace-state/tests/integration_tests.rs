use std::collections::HashMap;
use std::sync::Arc;

use ace_net::{PortAllocator, PortRange, GLOBAL_POOL};
use ace_state::{
    EndReason, EngineRef, ProxyHookRegistry, SessionInfo, StateStore, StreamEndedEvent,
    StreamKey, StreamStartedEvent,
};
use ace_types::KeyType;

fn store() -> StateStore {
    let ranges = HashMap::from([(GLOBAL_POOL.to_string(), PortRange { lo: 45000, hi: 45009 })]);
    let ports = Arc::new(PortAllocator::new(ranges, 20));
    StateStore::new(ports, ProxyHookRegistry::new(), 40)
}

fn start_event(container_id: &str) -> StreamStartedEvent {
    StreamStartedEvent {
        container_id: Some(container_id.to_string()),
        engine: EngineRef {
            host: container_id.to_string(),
            port: 6878,
        },
        stream: StreamKey {
            key_type: KeyType::Infohash,
            key: "deadbeef".to_string(),
        },
        session: SessionInfo {
            playback_session_id: "sess-x".to_string(),
            stat_url: "http://engine/stat".to_string(),
            command_url: "http://engine/cmd".to_string(),
            is_live: false,
        },
        labels: HashMap::new(),
    }
}

#[tokio::test]
async fn full_stream_lifecycle_round_trip() {
    let store = store();
    let stream = store.on_stream_started(start_event("eng-a")).await.unwrap();
    assert_eq!(store.list_engines().await.len(), 1);

    let outcome = store
        .on_stream_ended(StreamEndedEvent {
            container_id: None,
            stream_id: Some(stream.id.clone()),
            reason: EndReason::Explicit,
        })
        .await
        .unwrap();
    assert!(outcome.engine_now_idle);

    let ended = store.get_stream(&stream.id).await.unwrap();
    assert_eq!(ended.status, ace_types::StreamStatus::Ended);
}

#[tokio::test]
async fn forwarded_engine_lookup_reflects_assignment() {
    let store = store();
    store.on_stream_started(start_event("eng-a")).await.unwrap();

    assert!(!store.has_forwarded_engine("vpn1").await);
    store.set_forwarded_engine("vpn1", "eng-a", 55000).await.unwrap();
    assert!(store.has_forwarded_engine("vpn1").await);
    assert_eq!(
        store.get_forwarded_engine_for_vpn("vpn1").await,
        Some("eng-a".to_string())
    );
}

#[tokio::test]
async fn removing_unknown_engine_errors() {
    let store = store();
    let err = store.remove_engine("nonexistent").await.unwrap_err();
    assert!(matches!(err, ace_state::StateError::EngineNotFound(_)));
}
