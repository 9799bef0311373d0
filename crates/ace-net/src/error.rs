use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("port exhausted in range for vpn {0}")]
    PortExhausted(String),

    #[error("at capacity")]
    AtCapacity,

    #[error("unknown vpn: {0}")]
    UnknownVpn(String),

    #[error("invalid port: {0}")]
    InvalidPort(u16),

    #[error("vpn unavailable: {0}")]
    VpnUnavailable(String),

    #[error("probe request failed: {0}")]
    ProbeFailed(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, NetError>;

impl From<NetError> for ace_types::CoreError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::PortExhausted(_) => ace_types::CoreError::PortExhausted,
            NetError::AtCapacity => ace_types::CoreError::AtCapacity,
            NetError::VpnUnavailable(_) | NetError::UnknownVpn(_) => {
                ace_types::CoreError::NoVpnAvailable
            }
            other => ace_types::CoreError::Internal(other.to_string()),
        }
    }
}
