//! Candidates from a cloud discovery endpoint
//!
//! The endpoint answers `GET {base_url}/cluster/discovery?token=...` with a
//! JSON array of members:
//!
//! ```json
//! [{"private-address": "10.0.0.1:5701", "public-address": "54.1.2.3:31000", "tpc-ports": [11000]}]
//! ```

use super::{CandidateAddresses, MapLookup};
use crate::error::{DiscoveryError, DiscoveryResult};
use gridlink_core::{Address, CloudOptions, HostPort, NameResolver};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

const DISCOVERY_PATH: &str = "cluster/discovery";

/// One member entry in the discovery response
#[derive(Debug, Clone, Deserialize)]
struct DiscoveredMember {
    #[serde(rename = "private-address")]
    private_address: String,
    #[serde(rename = "public-address")]
    public_address: String,
    #[serde(rename = "tpc-ports", default)]
    tpc_ports: Vec<u16>,
}

/// State rebuilt wholesale by each successful query
#[derive(Debug, Default)]
struct CloudSnapshot {
    public: Vec<Address>,
    private_to_public: HashMap<Address, Address>,
    secondary_ports: HashMap<Address, Vec<u16>>,
}

/// Discovery-service backed address source
pub struct CloudDiscoverySource {
    client: reqwest::Client,
    url: Url,
    base_url: String,
    resolver: Arc<dyn NameResolver>,
    snapshot: RwLock<Option<Arc<CloudSnapshot>>>,
}

impl std::fmt::Debug for CloudDiscoverySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The URL carries the token
        f.debug_struct("CloudDiscoverySource")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl CloudDiscoverySource {
    pub fn new(options: &CloudOptions, resolver: Arc<dyn NameResolver>) -> DiscoveryResult<Self> {
        let token = options
            .token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| DiscoveryError::InvalidUrl("cloud token is not set".to_string()))?;

        let mut url = discovery_url(&options.base_url)
            .map_err(|e| DiscoveryError::InvalidUrl(format!("{}: {}", options.base_url, e)))?;
        url.query_pairs_mut().append_pair("token", token);

        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .build()?;

        Ok(Self {
            client,
            url,
            base_url: options.base_url.clone(),
            resolver,
            snapshot: RwLock::new(None),
        })
    }

    /// Public addresses of every discovered member, all primary
    pub async fn addresses(&self, force_refresh: bool) -> CandidateAddresses {
        let snapshot = match self.current(force_refresh).await {
            Ok((snapshot, _)) => snapshot,
            Err(e) => {
                warn!("Cloud discovery at {} failed: {}", self.base_url, e);
                return CandidateAddresses::default();
            }
        };

        let mut candidates = CandidateAddresses::default();
        for address in &snapshot.public {
            candidates.push_primary(address.clone());
        }
        candidates
    }

    /// Look up the public address of a member's internal address
    pub async fn try_map(&self, address: &Address, force_refresh: bool) -> MapLookup {
        match self.current(force_refresh).await {
            Ok((snapshot, fresh)) => MapLookup {
                public: snapshot.private_to_public.get(address).cloned(),
                fresh,
            },
            Err(e) => {
                warn!("Cloud discovery at {} failed: {}", self.base_url, e);
                // A failed query still counts as a refresh attempt
                MapLookup {
                    public: None,
                    fresh: true,
                }
            }
        }
    }

    pub async fn secondary_ports(&self, public: &Address) -> Vec<u16> {
        match self.snapshot.read().await.as_ref() {
            Some(snapshot) => snapshot
                .secondary_ports
                .get(public)
                .cloned()
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Current snapshot, querying the endpoint when forced or when empty
    async fn current(&self, force_refresh: bool) -> DiscoveryResult<(Arc<CloudSnapshot>, bool)> {
        if !force_refresh {
            if let Some(snapshot) = self.snapshot.read().await.as_ref() {
                return Ok((snapshot.clone(), false));
            }
        }

        let snapshot = Arc::new(self.fetch().await?);
        *self.snapshot.write().await = Some(snapshot.clone());
        Ok((snapshot, true))
    }

    async fn fetch(&self) -> DiscoveryResult<CloudSnapshot> {
        debug!("Querying cloud discovery at {}", self.base_url);

        let members: Vec<DiscoveredMember> = self
            .client
            .get(self.url.clone())
            .header("Accept", "application/json")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut snapshot = CloudSnapshot::default();
        for member in members {
            let public = Address::parse(&member.public_address, self.resolver.as_ref())
                .await
                .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?;

            // A private address without a port uses the public port
            let private_port = HostPort::split(&member.private_address)
                .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?
                .port
                .unwrap_or(public.port());
            let private = Address::parse_with_default_port(
                &member.private_address,
                private_port,
                self.resolver.as_ref(),
            )
            .await
            .map_err(|e| DiscoveryError::InvalidResponse(e.to_string()))?;

            if !member.tpc_ports.is_empty() {
                snapshot
                    .secondary_ports
                    .insert(public.clone(), member.tpc_ports.clone());
            }
            snapshot.private_to_public.insert(private, public.clone());
            if !snapshot.public.contains(&public) {
                snapshot.public.push(public);
            }
        }

        info!(
            "Cloud discovery returned {} member(s)",
            snapshot.public.len()
        );
        Ok(snapshot)
    }
}

/// Discovery endpoint under the base URL, keeping any path prefix it has
fn discovery_url(base_url: &str) -> Result<Url, url::ParseError> {
    let mut base = Url::parse(base_url)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join(DISCOVERY_PATH)
}
