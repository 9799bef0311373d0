//! # Control-plane data model
//!
//! Shared types for the streaming-engine control plane: the `Engine` and
//! `Stream` records (spec §3), the engine-variant template mechanism, the
//! runtime-mutable configuration subset, container label constants, and
//! the cross-cutting error taxonomy other crates convert into at their
//! boundaries.

pub mod config;
pub mod engine;
pub mod error;
pub mod labels;
pub mod stream;
pub mod variant;

pub use config::{RuntimeConfig, StreamMode, VpnMode};
pub use engine::{Engine, HealthStatus};
pub use error::{CoreError, Result};
pub use stream::{KeyType, Stream, StreamStatSnapshot, StreamStatus};
pub use variant::{ConfigChannel, EngineVariant, EngineVariantOverride};
