//! Address candidate sources
//!
//! Two closed variants behind one interface: [`ConfigAddressSource`] expands
//! the configured seed list over a port range, [`CloudDiscoverySource`]
//! queries a discovery endpoint and also maps internal addresses to public
//! ones.

pub mod cloud;
pub mod config;

pub use cloud::CloudDiscoverySource;
pub use config::ConfigAddressSource;

use crate::error::{DiscoveryError, DiscoveryResult};
use gridlink_core::Address;
use rand::seq::SliceRandom;

/// Ordered candidate addresses
///
/// `primary` holds addresses at the configured (or explicit) port;
/// `secondary` holds the scanned port range and is only tried once every
/// primary address has failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateAddresses {
    pub primary: Vec<Address>,
    pub secondary: Vec<Address>,
}

impl CandidateAddresses {
    pub fn is_empty(&self) -> bool {
        self.primary.is_empty() && self.secondary.is_empty()
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.secondary.len()
    }

    /// Primary addresses first, then secondary
    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.primary.iter().chain(self.secondary.iter())
    }

    /// Shuffle each tier independently; tiers keep their order
    pub fn shuffle(&mut self) {
        let mut rng = rand::thread_rng();
        self.primary.shuffle(&mut rng);
        self.secondary.shuffle(&mut rng);
    }

    pub(crate) fn push_primary(&mut self, address: Address) {
        if !self.primary.contains(&address) {
            self.secondary.retain(|a| a != &address);
            self.primary.push(address);
        }
    }

    pub(crate) fn push_secondary(&mut self, address: Address) {
        if !self.primary.contains(&address) && !self.secondary.contains(&address) {
            self.secondary.push(address);
        }
    }
}

/// Result of an internal → public lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapLookup {
    /// Public address, if the internal address is known
    pub public: Option<Address>,
    /// Whether the map was rebuilt to answer this lookup
    pub fresh: bool,
}

/// A source of candidate addresses
#[derive(Debug)]
pub enum AddressSource {
    Configuration(ConfigAddressSource),
    Cloud(CloudDiscoverySource),
}

impl AddressSource {
    /// Candidate addresses; `force_refresh` rebuilds cached state first
    pub async fn get_addresses(&self, force_refresh: bool) -> CandidateAddresses {
        match self {
            AddressSource::Configuration(source) => source.addresses().await,
            AddressSource::Cloud(source) => source.addresses(force_refresh).await,
        }
    }

    /// Whether [`AddressSource::try_map`] is supported
    pub fn maps(&self) -> bool {
        matches!(self, AddressSource::Cloud(_))
    }

    /// Look up the public counterpart of an internal address
    pub async fn try_map(
        &self,
        address: &Address,
        force_refresh: bool,
    ) -> DiscoveryResult<MapLookup> {
        match self {
            AddressSource::Configuration(_) => Err(DiscoveryError::MappingUnsupported),
            AddressSource::Cloud(source) => Ok(source.try_map(address, force_refresh).await),
        }
    }

    /// Secondary transport ports advertised for a public address
    pub async fn secondary_ports(&self, address: &Address) -> Vec<u16> {
        match self {
            AddressSource::Configuration(_) => Vec::new(),
            AddressSource::Cloud(source) => source.secondary_ports(address).await,
        }
    }
}
