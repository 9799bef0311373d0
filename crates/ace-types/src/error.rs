use thiserror::Error;

/// Cross-cutting error taxonomy shared by every crate in the workspace.
///
/// Individual crates define their own narrower error enum (see
/// `ace-docker::error::DockerError`, `ace-net::error::NetError`, etc.) and
/// convert into this one only at a boundary that needs to unify them, such
/// as `ace-server`'s HTTP error mapping.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("at capacity")]
    AtCapacity,

    #[error("port exhausted")]
    PortExhausted,

    #[error("no vpn available")]
    NoVpnAvailable,

    #[error("circuit open")]
    CircuitOpen,

    #[error("container start failed: {0}")]
    ContainerStartFailed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
