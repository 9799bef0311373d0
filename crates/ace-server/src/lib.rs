//! Process wiring for the streaming-engine control plane: config loading,
//! the shared `AppState`, the HTTP error boundary, and the axum router.

pub mod config;
pub mod error;
pub mod metrics;
pub mod proxy_hooks;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use config::AceConfig;
pub use error::ApiError;
pub use routes::build_router;
pub use state::AppState;
