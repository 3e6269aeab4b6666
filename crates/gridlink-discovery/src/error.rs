//! Discovery errors

use gridlink_core::ConfigError;
use thiserror::Error;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid discovery URL: {0}")]
    InvalidUrl(String),

    #[error("Discovery request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid discovery response: {0}")]
    InvalidResponse(String),

    #[error("Address source does not map addresses")]
    MappingUnsupported,
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
