use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("engine not found: {0}")]
    EngineNotFound(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("engine {0} already has a maximum of streams")]
    EngineAtCapacity(String),

    #[error("vpn {0} already has a forwarded engine")]
    ForwardedAlreadyAssigned(String),
}

pub type Result<T> = std::result::Result<T, StateError>;

impl From<StateError> for ace_types::CoreError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::EngineNotFound(m) | StateError::StreamNotFound(m) => {
                ace_types::CoreError::NotFound(m)
            }
            StateError::EngineAtCapacity(m) | StateError::ForwardedAlreadyAssigned(m) => {
                ace_types::CoreError::Conflict(m)
            }
        }
    }
}
