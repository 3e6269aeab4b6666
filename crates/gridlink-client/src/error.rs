use gridlink_discovery::DiscoveryError;
use gridlink_transport::TransportError;
use thiserror::Error;

/// Connection establishment errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No candidate addresses available")]
    NoCandidates,

    #[error("Unable to connect to any of {attempted} candidate address(es)")]
    NoReachableAddress { attempted: usize },
}

impl From<gridlink_core::ConfigError> for ClientError {
    fn from(e: gridlink_core::ConfigError) -> Self {
        ClientError::Discovery(DiscoveryError::Config(e))
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
