//! Candidate address discovery for gridlink clients
//!
//! Produces the ordered list of addresses a client tries when it connects,
//! either from static configuration or from a cloud discovery endpoint, and
//! decides once per session whether members are dialed on their public or
//! internal addresses.

pub mod connect_address;
pub mod error;
pub mod provider;
pub mod source;

pub use connect_address::{
    ConnectAddressResolver, MemberAddresses, ReachabilityProbe, TcpReachabilityProbe,
};
pub use error::{DiscoveryError, DiscoveryResult};
pub use provider::AddressProvider;
pub use source::{
    AddressSource, CandidateAddresses, CloudDiscoverySource, ConfigAddressSource, MapLookup,
};
