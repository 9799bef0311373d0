use thiserror::Error;

#[derive(Error, Debug)]
pub enum DockerError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container conflict: {0}")]
    Conflict(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("docker connection failed: {0}")]
    Connection(String),

    #[error("docker api error: {0}")]
    Engine(#[from] bollard::errors::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DockerError>;

impl From<DockerError> for ace_types::CoreError {
    fn from(e: DockerError) -> Self {
        match e {
            DockerError::NotFound(m) => ace_types::CoreError::NotFound(m),
            DockerError::Conflict(m) => ace_types::CoreError::Conflict(m),
            DockerError::Timeout(m) => ace_types::CoreError::Timeout(m),
            other => ace_types::CoreError::ContainerStartFailed(other.to_string()),
        }
    }
}
