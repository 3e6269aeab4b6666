//! Error types shared across gridlink crates

use thiserror::Error;

/// Address parsing errors
///
/// Returned by [`crate::Address::parse`]; parsing never panics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressParseError {
    #[error("Empty address")]
    Empty,

    #[error("Unmatched '[' in address: {0}")]
    UnmatchedBracket(String),

    #[error("Unexpected characters after ']' in address: {0}")]
    TrailingCharacters(String),

    #[error("Invalid port in address: {0}")]
    InvalidPort(String),

    #[error("Invalid IPv6 zone in address: {0}")]
    InvalidZone(String),

    #[error("Failed to resolve host {host}: {reason}")]
    Unresolved { host: String, reason: String },
}

/// Configuration errors
///
/// Raised synchronously while building or validating configuration; these
/// are fatal to startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Conflicting configuration: {0}")]
    Conflict(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;
