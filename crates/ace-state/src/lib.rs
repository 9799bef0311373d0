//! In-memory state for every engine and stream the control plane tracks,
//! plus the response cache and circuit breakers guarding reads and writes
//! under load.

pub mod cache;
pub mod circuit;
pub mod error;
pub mod events;
pub mod proxy_hook;
pub mod store;

pub use cache::ResponseCache;
pub use circuit::{Admission, CircuitBreakerRegistry};
pub use error::{Result, StateError};
pub use events::{EndReason, EngineRef, SessionInfo, StreamEndedEvent, StreamKey, StreamStartedEvent};
pub use proxy_hook::{NullProxyHook, ProxyHook, ProxyHookRegistry};
pub use store::{StateStore, StreamEndedOutcome};
