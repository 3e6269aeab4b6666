//! Address provider
//!
//! Picks the address source from configuration and exposes candidate
//! addresses plus internal → public translation.

use crate::error::DiscoveryResult;
use crate::source::{
    AddressSource, CandidateAddresses, CloudDiscoverySource, ConfigAddressSource,
};
use gridlink_core::{Address, ClientNetworkConfig, NameResolver};
use std::sync::Arc;
use tracing::{debug, trace};

/// Façade over the configured [`AddressSource`]
#[derive(Debug)]
pub struct AddressProvider {
    source: AddressSource,
    shuffle: bool,
}

impl AddressProvider {
    pub fn new(source: AddressSource, shuffle: bool) -> Self {
        Self { source, shuffle }
    }

    /// Cloud discovery when a token is configured, the seed list otherwise
    ///
    /// Configuring both is a configuration error.
    pub fn from_config(
        config: &ClientNetworkConfig,
        resolver: Arc<dyn NameResolver>,
    ) -> DiscoveryResult<Self> {
        config.validate()?;

        let source = if config.cloud.enabled() {
            debug!("Using cloud discovery at {}", config.cloud.base_url);
            AddressSource::Cloud(CloudDiscoverySource::new(&config.cloud, resolver)?)
        } else {
            debug!("Using {} configured seed address(es)", config.seed_addresses().len());
            AddressSource::Configuration(ConfigAddressSource::from_config(config, resolver))
        };

        Ok(Self::new(source, config.shuffle))
    }

    pub fn source(&self) -> &AddressSource {
        &self.source
    }

    /// Whether the source translates internal addresses
    pub fn maps(&self) -> bool {
        self.source.maps()
    }

    /// Candidate addresses for a connection attempt
    pub async fn addresses(&self, force_refresh: bool) -> CandidateAddresses {
        let mut candidates = self.source.get_addresses(force_refresh).await;
        if self.shuffle {
            candidates.shuffle();
        }
        candidates
    }

    /// Translate a member's internal address to the address the client dials
    ///
    /// Returns the input unchanged when the source does not map. A miss on a
    /// map that was not just rebuilt forces one refresh and retries once; a
    /// miss right after a rebuild gives up immediately.
    pub async fn map(&self, address: &Address) -> DiscoveryResult<Option<Address>> {
        if !self.source.maps() {
            return Ok(Some(address.clone()));
        }

        let lookup = self.source.try_map(address, false).await?;
        if let Some(public) = lookup.public {
            trace!("Mapped {} to {}", address, public);
            return Ok(Some(public));
        }
        if lookup.fresh {
            debug!("No public address for {} in a fresh map", address);
            return Ok(None);
        }

        debug!("No public address for {}, refreshing map", address);
        let lookup = self.source.try_map(address, true).await?;
        Ok(lookup.public)
    }

    /// Secondary transport ports advertised for a public address
    pub async fn secondary_ports(&self, address: &Address) -> Vec<u16> {
        self.source.secondary_ports(address).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridlink_core::StaticResolver;

    fn resolver() -> Arc<dyn NameResolver> {
        Arc::new(StaticResolver::new())
    }

    #[tokio::test]
    async fn test_configuration_source_maps_identity() {
        let config = ClientNetworkConfig::builder()
            .address("10.0.0.1:5701")
            .build()
            .unwrap();
        let provider = AddressProvider::from_config(&config, resolver()).unwrap();
        assert!(!provider.maps());

        let address = Address::from_socket_addr("10.0.0.9:5701".parse().unwrap());
        let mapped = provider.map(&address).await.unwrap();
        assert_eq!(mapped, Some(address));
    }

    #[tokio::test]
    async fn test_cloud_selected_with_token() {
        let config = ClientNetworkConfig::builder()
            .cloud_token("abc")
            .cloud_base_url("http://127.0.0.1:9")
            .build()
            .unwrap();
        let provider = AddressProvider::from_config(&config, resolver()).unwrap();
        assert!(provider.maps());
        assert!(matches!(provider.source(), AddressSource::Cloud(_)));
    }

    #[test]
    fn test_conflicting_config_rejected() {
        let config = ClientNetworkConfig {
            addresses: vec!["10.0.0.1".to_string()],
            cloud: gridlink_core::CloudOptions {
                token: Some("abc".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(AddressProvider::from_config(&config, resolver()).is_err());
    }

    #[tokio::test]
    async fn test_unshuffled_order_is_stable() {
        let config = ClientNetworkConfig::builder()
            .address("10.0.0.1")
            .address("10.0.0.2")
            .shuffle(false)
            .build()
            .unwrap();
        let provider = AddressProvider::from_config(&config, resolver()).unwrap();
        let candidates = provider.addresses(false).await;

        let primary: Vec<String> = candidates.primary.iter().map(|a| a.to_string()).collect();
        assert_eq!(primary, vec!["10.0.0.1:5701", "10.0.0.2:5701"]);
        assert_eq!(candidates.secondary.len(), 4);
    }
}
