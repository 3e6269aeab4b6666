//! Candidates from the configured seed list

use super::CandidateAddresses;
use gridlink_core::{Address, ClientNetworkConfig, HostPort, NameResolver};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Expands configured seed addresses over the port range
///
/// A seed with an explicit port yields exactly one primary candidate. A seed
/// without a port yields a primary candidate at the default port and
/// `port_range - 1` secondary candidates at the following ports.
#[derive(Debug)]
pub struct ConfigAddressSource {
    addresses: Vec<String>,
    default_port: u16,
    port_range: u16,
    resolver: Arc<dyn NameResolver>,
}

impl ConfigAddressSource {
    pub fn new(
        addresses: Vec<String>,
        default_port: u16,
        port_range: u16,
        resolver: Arc<dyn NameResolver>,
    ) -> Self {
        let addresses = if addresses.is_empty() {
            vec!["localhost".to_string()]
        } else {
            addresses
        };

        Self {
            addresses,
            default_port,
            port_range: port_range.max(1),
            resolver,
        }
    }

    pub fn from_config(config: &ClientNetworkConfig, resolver: Arc<dyn NameResolver>) -> Self {
        Self::new(
            config.seed_addresses(),
            config.default_port,
            config.port_range,
            resolver,
        )
    }

    /// Resolve and expand every seed; unresolvable seeds are skipped
    pub async fn addresses(&self) -> CandidateAddresses {
        let mut candidates = CandidateAddresses::default();

        for seed in &self.addresses {
            let explicit_port = match HostPort::split(seed) {
                Ok(hp) => hp.port.is_some(),
                Err(e) => {
                    warn!("Ignoring malformed address {:?}: {}", seed, e);
                    continue;
                }
            };

            let base = match Address::parse_with_default_port(
                seed,
                self.default_port,
                self.resolver.as_ref(),
            )
            .await
            {
                Ok(address) => address,
                Err(e) => {
                    warn!("Ignoring address {:?}: {}", seed, e);
                    continue;
                }
            };

            for address in self.scoped(base).await {
                candidates.push_primary(address.clone());
                if explicit_port {
                    continue;
                }
                for offset in 1..self.port_range {
                    if let Some(port) = self.default_port.checked_add(offset) {
                        candidates.push_secondary(address.with_port(port));
                    }
                }
            }
        }

        debug!(
            "Configured candidates: {} primary, {} secondary",
            candidates.primary.len(),
            candidates.secondary.len()
        );
        candidates
    }

    /// One copy of an unscoped link/site-local IPv6 address per local scope
    async fn scoped(&self, address: Address) -> Vec<Address> {
        if !address.is_unscoped_local_ipv6() {
            return vec![address];
        }

        let locals = match self.resolver.local_addresses().await {
            Ok(locals) => locals,
            Err(e) => {
                debug!("Could not list local addresses: {}", e);
                return vec![address];
            }
        };

        let scopes: BTreeSet<u32> = locals
            .iter()
            .filter_map(|a| match a {
                std::net::SocketAddr::V6(v6) if v6.scope_id() != 0 => Some(v6.scope_id()),
                _ => None,
            })
            .collect();

        if scopes.is_empty() {
            return vec![address];
        }

        scopes
            .into_iter()
            .map(|scope| address.with_scope_id(scope))
            .collect()
    }
}
