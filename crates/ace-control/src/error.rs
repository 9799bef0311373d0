use thiserror::Error;

#[derive(Error, Debug)]
pub enum ControlError {
    #[error("at capacity")]
    AtCapacity,

    #[error("no vpn available")]
    NoVpnAvailable,

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error(transparent)]
    Net(#[from] ace_net::NetError),

    #[error(transparent)]
    Docker(#[from] ace_docker::error::DockerError),

    #[error(transparent)]
    State(#[from] ace_state::StateError),
}

pub type Result<T> = std::result::Result<T, ControlError>;

impl From<ControlError> for ace_types::CoreError {
    fn from(e: ControlError) -> Self {
        match e {
            ControlError::AtCapacity => ace_types::CoreError::AtCapacity,
            ControlError::NoVpnAvailable => ace_types::CoreError::NoVpnAvailable,
            ControlError::CircuitOpen(_) => ace_types::CoreError::CircuitOpen,
            ControlError::Net(e) => e.into(),
            ControlError::Docker(e) => e.into(),
            ControlError::State(e) => e.into(),
        }
    }
}
