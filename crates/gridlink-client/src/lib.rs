//! Cluster connection establishment
//!
//! Ties the pieces together: candidate addresses from the
//! [`AddressProvider`], a TCP dial, the optional TLS upgrade and finally the
//! framing pipeline.
//!
//! # Example
//!
//! ```no_run
//! use gridlink_client::{ClientNetworkConfig, ClusterConnector};
//! use gridlink_transport::{ChannelFrameHandler, Handlers};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientNetworkConfig::builder()
//!     .address("10.0.0.1")
//!     .build()?;
//! let connector = ClusterConnector::new(config)?;
//!
//! let (handler, mut frames) = ChannelFrameHandler::channel(64);
//! let connection = connector
//!     .connect_to_cluster(Handlers::new(Arc::new(handler)))
//!     .await?;
//! connection.send(b"CP2").await;
//! while let Some(frame) = frames.recv().await {
//!     println!("{} bytes", frame.len());
//! }
//! # Ok(())
//! # }
//! ```

pub mod connector;
pub mod error;

pub use connector::ClusterConnector;
pub use error::{ClientError, ClientResult};

pub use gridlink_core::{
    Address, ClientNetworkConfig, ClientNetworkConfigBuilder, PublicAddressMode,
};
pub use gridlink_discovery::{
    AddressProvider, CandidateAddresses, ConnectAddressResolver, MemberAddresses,
    ReachabilityProbe, TcpReachabilityProbe,
};
