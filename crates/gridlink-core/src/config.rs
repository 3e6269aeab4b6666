//! Client network configuration
//!
//! Everything the connection layer reads from configuration: seed
//! addresses, port scanning, socket options, TLS, cloud discovery and the
//! public/internal address override.

use crate::error::{ConfigError, ConfigResult};
use crate::{DEFAULT_PORT, DEFAULT_PORT_RANGE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Whether members are dialed on their public or internal addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicAddressMode {
    /// Decide from the member list (see the connect-address resolver)
    #[default]
    Auto,
    /// Always use internal addresses
    Internal,
    /// Always use public addresses
    Public,
}

impl PublicAddressMode {
    /// Explicit choice, if one was configured
    pub fn explicit(self) -> Option<bool> {
        match self {
            PublicAddressMode::Auto => None,
            PublicAddressMode::Internal => Some(false),
            PublicAddressMode::Public => Some(true),
        }
    }
}

/// TCP socket options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    pub keep_alive: bool,
    pub no_delay: bool,
    /// Send and receive buffer size in bytes
    pub buffer_size: u32,
    /// SO_LINGER; `None` leaves the OS default
    #[serde(with = "opt_duration_millis")]
    pub linger: Option<Duration>,
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            keep_alive: true,
            no_delay: true,
            buffer_size: 128 * 1024,
            linger: None,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// TLS options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    pub enabled: bool,
    /// PEM bundle holding the client certificate, its chain and private key
    pub certificate_path: Option<String>,
    /// Password for the bundle; encrypted bundles are not supported
    pub certificate_password: Option<String>,
    /// Name the server certificate must match; defaults to the remote IP
    pub certificate_name: Option<String>,
    /// Extra trusted root certificates (PEM)
    pub ca_path: Option<String>,
    /// Certificate revocation lists (PEM) used by the revocation check
    pub crl_paths: Vec<String>,
    pub validate_certificate_chain: bool,
    pub validate_certificate_name: bool,
    /// Always enforced; a server without a certificate fails the handshake
    /// whatever this is set to
    pub validate_certificate_presence: bool,
    pub check_certificate_revocation: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            certificate_path: None,
            certificate_password: None,
            certificate_name: None,
            ca_path: None,
            crl_paths: Vec::new(),
            validate_certificate_chain: true,
            validate_certificate_name: true,
            validate_certificate_presence: true,
            check_certificate_revocation: false,
        }
    }
}

/// Cloud discovery options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudOptions {
    pub token: Option<String>,
    pub base_url: String,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl Default for CloudOptions {
    fn default() -> Self {
        Self {
            token: None,
            base_url: "https://api.viridian.hazelcast.com".to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl CloudOptions {
    /// Cloud discovery is on when a non-empty token is configured
    pub fn enabled(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Network configuration consumed by the connection layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientNetworkConfig {
    /// Seed addresses (`host`, `host:port`, `[ipv6]:port`)
    pub addresses: Vec<String>,
    pub default_port: u16,
    /// Number of consecutive ports tried from `default_port`
    pub port_range: u16,
    /// Shuffle candidates before each connection attempt
    pub shuffle: bool,
    pub socket: SocketOptions,
    pub tls: TlsOptions,
    pub cloud: CloudOptions,
    pub public_address: PublicAddressMode,
}

impl Default for ClientNetworkConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            default_port: DEFAULT_PORT,
            port_range: DEFAULT_PORT_RANGE,
            shuffle: true,
            socket: SocketOptions::default(),
            tls: TlsOptions::default(),
            cloud: CloudOptions::default(),
            public_address: PublicAddressMode::Auto,
        }
    }
}

impl ClientNetworkConfig {
    pub fn builder() -> ClientNetworkConfigBuilder {
        ClientNetworkConfigBuilder::default()
    }

    /// Load and validate a YAML configuration file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate YAML configuration
    pub fn from_yaml_str(text: &str) -> ConfigResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject contradictory or malformed settings
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cloud.enabled() && !self.addresses.is_empty() {
            return Err(ConfigError::Conflict(
                "seed addresses and a cloud discovery token cannot both be configured"
                    .to_string(),
            ));
        }

        if self.port_range == 0 {
            return Err(ConfigError::Invalid("port_range must be > 0".to_string()));
        }

        if self.socket.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "socket.connect_timeout must be > 0".to_string(),
            ));
        }

        if self.cloud.enabled() && self.cloud.timeout.is_zero() {
            return Err(ConfigError::Invalid("cloud.timeout must be > 0".to_string()));
        }

        if self
            .tls
            .certificate_password
            .as_deref()
            .is_some_and(|p| !p.is_empty())
        {
            return Err(ConfigError::Invalid(
                "encrypted certificate bundles are not supported; provide an unencrypted PEM bundle"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Seed addresses, falling back to `localhost` when none are configured
    pub fn seed_addresses(&self) -> Vec<String> {
        if self.addresses.is_empty() {
            vec!["localhost".to_string()]
        } else {
            self.addresses.clone()
        }
    }
}

/// Builder for ClientNetworkConfig
#[derive(Default)]
pub struct ClientNetworkConfigBuilder {
    config: ClientNetworkConfig,
}

impl ClientNetworkConfigBuilder {
    pub fn address(mut self, address: &str) -> Self {
        self.config.addresses.push(address.to_string());
        self
    }

    pub fn default_port(mut self, port: u16) -> Self {
        self.config.default_port = port;
        self
    }

    pub fn port_range(mut self, range: u16) -> Self {
        self.config.port_range = range;
        self
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.config.shuffle = shuffle;
        self
    }

    pub fn socket(mut self, socket: SocketOptions) -> Self {
        self.config.socket = socket;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket.connect_timeout = timeout;
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.config.tls = tls;
        self
    }

    pub fn cloud_token(mut self, token: &str) -> Self {
        self.config.cloud.token = Some(token.to_string());
        self
    }

    pub fn cloud_base_url(mut self, url: &str) -> Self {
        self.config.cloud.base_url = url.to_string();
        self
    }

    pub fn cloud_timeout(mut self, timeout: Duration) -> Self {
        self.config.cloud.timeout = timeout;
        self
    }

    pub fn public_address(mut self, mode: PublicAddressMode) -> Self {
        self.config.public_address = mode;
        self
    }

    pub fn build(self) -> ConfigResult<ClientNetworkConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Helper module for serializing Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
