//! Name resolution capability
//!
//! Address parsing and candidate expansion never call DNS directly; they go
//! through a [`NameResolver`] handed to them by the caller. Production code
//! uses [`SystemResolver`], tests use [`StaticResolver`].

use crate::address::is_local_scope;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, SocketAddrV6};
use tracing::{debug, trace};

/// Resolves host names to IP endpoints
///
/// Returned socket addresses carry port 0; IPv6 results may carry a scope id
/// (e.g. when resolving `fe80::1%eth0`).
#[async_trait]
pub trait NameResolver: Send + Sync + std::fmt::Debug {
    /// Resolve a host name
    async fn resolve(&self, host: &str) -> io::Result<Vec<SocketAddr>>;

    /// Addresses assigned to this machine
    async fn local_addresses(&self) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo`)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl NameResolver for SystemResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0)).await?.collect();
        trace!("Resolved {} to {:?}", host, addrs);
        Ok(addrs)
    }

    /// Interface addresses; link/site-local IPv6 carry the interface index
    /// as scope id
    ///
    /// Falls back to resolving the host name when interfaces cannot be
    /// listed.
    async fn local_addresses(&self) -> io::Result<Vec<SocketAddr>> {
        match if_addrs::get_if_addrs() {
            Ok(interfaces) => {
                let addrs: Vec<SocketAddr> = interfaces
                    .iter()
                    .map(|iface| interface_addr(iface.ip(), iface.index))
                    .collect();
                trace!("Local interface addresses: {:?}", addrs);
                Ok(addrs)
            }
            Err(e) => {
                debug!("Could not list interfaces ({}), resolving host name", e);
                let name = hostname::get()?;
                self.resolve(&name.to_string_lossy()).await
            }
        }
    }
}

fn interface_addr(ip: IpAddr, index: Option<u32>) -> SocketAddr {
    match ip {
        IpAddr::V6(v6) if is_local_scope(&v6) => {
            SocketAddr::V6(SocketAddrV6::new(v6, 0, 0, index.unwrap_or(0)))
        }
        ip => SocketAddr::new(ip, 0),
    }
}

/// Fixed host table
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<SocketAddr>>,
    local: Vec<SocketAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the IPs a host resolves to, in resolution order
    pub fn with_host(mut self, host: &str, ips: &[IpAddr]) -> Self {
        let addrs = ips.iter().map(|ip| SocketAddr::new(*ip, 0)).collect();
        self.hosts.insert(host.to_string(), addrs);
        self
    }

    /// Register a host that resolves to an exact endpoint (scope ids included)
    pub fn with_endpoint(mut self, host: &str, addr: SocketAddr) -> Self {
        self.hosts.entry(host.to_string()).or_default().push(addr);
        self
    }

    /// Register an address as local to this machine
    pub fn with_local(mut self, addr: SocketAddr) -> Self {
        self.local.push(addr);
        self
    }
}

#[async_trait]
impl NameResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> io::Result<Vec<SocketAddr>> {
        self.hosts.get(host).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unknown host {}", host))
        })
    }

    async fn local_addresses(&self) -> io::Result<Vec<SocketAddr>> {
        Ok(self.local.clone())
    }
}
