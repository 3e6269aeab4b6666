//! Core types for the gridlink cluster connection layer
//!
//! This crate holds the pieces every other gridlink crate shares: the
//! [`Address`] value and its parser, the injected [`NameResolver`]
//! capability, and the client network configuration model.

pub mod address;
pub mod config;
pub mod error;
pub mod resolver;

pub use address::{Address, HostPort};
pub use config::{
    ClientNetworkConfig, ClientNetworkConfigBuilder, CloudOptions, PublicAddressMode,
    SocketOptions, TlsOptions,
};
pub use error::{AddressParseError, ConfigError, ConfigResult};
pub use resolver::{NameResolver, StaticResolver, SystemResolver};

/// Default member port
pub const DEFAULT_PORT: u16 = 5701;

/// Default number of consecutive ports scanned from the default port
pub const DEFAULT_PORT_RANGE: u16 = 3;
