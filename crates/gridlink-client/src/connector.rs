//! Cluster connector

use crate::error::{ClientError, ClientResult};
use gridlink_core::{Address, ClientNetworkConfig, NameResolver, SystemResolver};
use gridlink_discovery::{
    AddressProvider, CandidateAddresses, ConnectAddressResolver, MemberAddresses,
    ReachabilityProbe,
};
use gridlink_transport::{
    Connection, Handlers, PipelineBuilder, SocketConnector, TlsUpgrader, TransportError,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Establishes framed connections to cluster members
pub struct ClusterConnector {
    config: ClientNetworkConfig,
    provider: AddressProvider,
    sockets: SocketConnector,
    tls: TlsUpgrader,
    prefix_length: usize,
    next_id: AtomicU64,
    refresh_next: AtomicBool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ClusterConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterConnector")
            .field("provider", &self.provider)
            .field("tls", &self.tls)
            .field("prefix_length", &self.prefix_length)
            .finish()
    }
}

impl ClusterConnector {
    /// Connector using the system resolver
    pub fn new(config: ClientNetworkConfig) -> ClientResult<Self> {
        Self::with_resolver(config, Arc::new(SystemResolver))
    }

    pub fn with_resolver(
        config: ClientNetworkConfig,
        resolver: Arc<dyn NameResolver>,
    ) -> ClientResult<Self> {
        let provider = AddressProvider::from_config(&config, resolver)?;
        let tls = TlsUpgrader::from_options(&config.tls)?;

        Ok(Self {
            sockets: SocketConnector::from_config(&config),
            config,
            provider,
            tls,
            prefix_length: 0,
            next_id: AtomicU64::new(1),
            refresh_next: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    /// Expect a fixed-length prefix from members before any frames
    pub fn with_prefix_length(mut self, length: usize) -> Self {
        self.prefix_length = length;
        self
    }

    pub fn config(&self) -> &ClientNetworkConfig {
        &self.config
    }

    pub fn provider(&self) -> &AddressProvider {
        &self.provider
    }

    /// Public/internal decision procedure for this configuration
    pub fn connect_address_resolver(
        &self,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> ConnectAddressResolver {
        ConnectAddressResolver::from_config(&self.config, probe)
    }

    /// Abort in-flight and future connection attempts
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Candidate addresses, refreshed if the previous walk found nothing
    pub async fn candidates(&self) -> CandidateAddresses {
        let force_refresh = self.refresh_next.swap(false, Ordering::AcqRel);
        self.provider.addresses(force_refresh).await
    }

    /// Dial one address, upgrade it and activate the pipeline
    pub async fn connect_to(
        &self,
        address: &Address,
        handlers: Handlers,
    ) -> ClientResult<Connection> {
        let stream = self.sockets.connect(address, &self.cancel).await?;
        let local = stream.local_addr().ok();
        let remote = stream.peer_addr().ok();

        // The handshake is bounded like the dial
        let handshake = tokio::time::timeout(
            self.config.socket.connect_timeout,
            self.tls.upgrade(stream, address.ip()),
        );
        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransportError::Cancelled.into()),
            result = handshake => match result {
                Ok(upgraded) => upgraded?,
                Err(_) => {
                    let target = format!("{} (TLS handshake)", address);
                    return Err(TransportError::Timeout(target).into());
                }
            },
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connection = PipelineBuilder::new(id)
            .prefix_length(self.prefix_length)
            .handlers(handlers)
            .endpoints(local, remote)
            .activate(stream)?;

        info!("[conn-{}] Connected to {}", id, address);
        Ok(connection)
    }

    /// Walk primary then secondary candidates until one connects
    ///
    /// Failed candidates are logged and skipped. When every candidate fails
    /// the next walk starts with a forced refresh of the address source.
    pub async fn connect_to_cluster(&self, handlers: Handlers) -> ClientResult<Connection> {
        let candidates = self.candidates().await;
        if candidates.is_empty() {
            self.refresh_next.store(true, Ordering::Release);
            return Err(ClientError::NoCandidates);
        }

        debug!(
            "Trying {} primary and {} secondary candidate(s)",
            candidates.primary.len(),
            candidates.secondary.len()
        );

        let mut attempted = 0;
        for address in candidates.iter() {
            if self.cancel.is_cancelled() {
                break;
            }
            attempted += 1;

            match self.connect_to(address, handlers.clone()).await {
                Ok(connection) => return Ok(connection),
                Err(e) => warn!("Failed to connect to {}: {}", address, e),
            }
        }

        self.refresh_next.store(true, Ordering::Release);
        Err(ClientError::NoReachableAddress { attempted })
    }

    /// Address to dial for a member, given the session-wide decision
    ///
    /// A mapping source (cloud discovery) always translates the internal
    /// address; otherwise the public address is used when `use_public` is
    /// set. `None` means the member cannot be dialed.
    pub async fn member_address(
        &self,
        member: &MemberAddresses,
        use_public: bool,
    ) -> ClientResult<Option<Address>> {
        if self.provider.maps() {
            return Ok(self.provider.map(&member.internal).await?);
        }

        if use_public {
            Ok(member.public.clone())
        } else {
            Ok(Some(member.internal.clone()))
        }
    }
}
