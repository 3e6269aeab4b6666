//! Network address value and parser
//!
//! An [`Address`] is an immutable `(host name, IP, port)` triple. The IP is
//! always resolved: parsing a host name goes through a [`NameResolver`]
//! eagerly. Equality and hashing only look at the resolved endpoint, so
//! `localhost:5701` and `127.0.0.1:5701` are the same address.
//!
//! Accepted forms:
//!
//! ```text
//! host
//! host:port
//! 10.0.0.1:5701
//! [fe80::1]:5701
//! [fe80::1%3]:5701
//! fe80::1%eth0          (no brackets, several colons: IPv6 host, no port)
//! ```

use crate::error::AddressParseError;
use crate::resolver::NameResolver;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv6Addr, SocketAddr, SocketAddrV6};

/// Host and optional port split out of an address string, before resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: Option<u16>,
}

impl HostPort {
    /// Split an address string into host and port without resolving anything
    pub fn split(input: &str) -> Result<Self, AddressParseError> {
        let s = input.trim();
        if s.is_empty() {
            return Err(AddressParseError::Empty);
        }

        if let Some(open) = s.find('[') {
            let close = s[open..]
                .find(']')
                .map(|i| open + i)
                .ok_or_else(|| AddressParseError::UnmatchedBracket(s.to_string()))?;
            if open != 0 {
                return Err(AddressParseError::TrailingCharacters(s.to_string()));
            }

            let host = &s[1..close];
            if host.is_empty() {
                return Err(AddressParseError::Empty);
            }

            let rest = &s[close + 1..];
            let port = if rest.is_empty() {
                None
            } else if let Some(port) = rest.strip_prefix(':') {
                Some(parse_port(port, s)?)
            } else {
                return Err(AddressParseError::TrailingCharacters(s.to_string()));
            };

            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        if s.contains(']') {
            return Err(AddressParseError::UnmatchedBracket(s.to_string()));
        }

        // One colon separates the port; more than one means a bare IPv6 literal
        match s.matches(':').count() {
            1 => {
                let (host, port) = s.split_once(':').unwrap_or((s, ""));
                if host.is_empty() {
                    return Err(AddressParseError::Empty);
                }
                Ok(Self {
                    host: host.to_string(),
                    port: Some(parse_port(port, s)?),
                })
            }
            _ => Ok(Self {
                host: s.to_string(),
                port: None,
            }),
        }
    }
}

fn parse_port(port: &str, input: &str) -> Result<u16, AddressParseError> {
    port.parse::<u16>()
        .map_err(|_| AddressParseError::InvalidPort(input.to_string()))
}

/// A resolved network address
#[derive(Debug, Clone)]
pub struct Address {
    host: String,
    endpoint: SocketAddr,
}

impl Address {
    /// Build an address from an already-resolved IP
    pub fn new(host: impl Into<String>, ip: IpAddr, port: u16) -> Self {
        Self {
            host: host.into(),
            endpoint: SocketAddr::new(ip, port),
        }
    }

    /// Build an address from a socket address; the host name is the IP text
    pub fn from_socket_addr(endpoint: SocketAddr) -> Self {
        Self {
            host: endpoint.ip().to_string(),
            endpoint,
        }
    }

    /// Build an address with a host name and an exact endpoint (scope id included)
    pub fn with_endpoint(host: impl Into<String>, endpoint: SocketAddr) -> Self {
        Self {
            host: host.into(),
            endpoint,
        }
    }

    /// Parse an address string; a missing port becomes 0
    pub async fn parse(
        input: &str,
        resolver: &dyn NameResolver,
    ) -> Result<Self, AddressParseError> {
        Self::parse_with_default_port(input, 0, resolver).await
    }

    /// Parse an address string, using `default_port` when none is given
    pub async fn parse_with_default_port(
        input: &str,
        default_port: u16,
        resolver: &dyn NameResolver,
    ) -> Result<Self, AddressParseError> {
        let HostPort { host, port } = HostPort::split(input)?;
        let port = port.unwrap_or(default_port);
        let endpoint = resolve_host(&host, resolver).await?;
        Ok(Self::with_endpoint(host, with_port(endpoint, port)))
    }

    /// Parse, discarding the error
    pub async fn try_parse(input: &str, resolver: &dyn NameResolver) -> Option<Self> {
        Self::parse(input, resolver).await.ok()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn ip(&self) -> IpAddr {
        self.endpoint.ip()
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port()
    }

    /// The endpoint to dial
    pub fn socket_addr(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn is_ipv6(&self) -> bool {
        self.endpoint.is_ipv6()
    }

    /// IPv6 scope id, 0 when absent or IPv4
    pub fn scope_id(&self) -> u32 {
        match self.endpoint {
            SocketAddr::V6(v6) => v6.scope_id(),
            SocketAddr::V4(_) => 0,
        }
    }

    /// Same host, different port
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            host: self.host.clone(),
            endpoint: with_port(self.endpoint, port),
        }
    }

    /// Same IPv6 address, different scope id
    pub fn with_scope_id(&self, scope_id: u32) -> Self {
        let endpoint = match self.endpoint {
            SocketAddr::V6(v6) => {
                SocketAddr::V6(SocketAddrV6::new(*v6.ip(), v6.port(), v6.flowinfo(), scope_id))
            }
            v4 => v4,
        };
        Self {
            host: self.host.clone(),
            endpoint,
        }
    }

    /// Link-local or site-local IPv6 address without a zone
    ///
    /// Such an address cannot be dialed as-is; the interface has to be
    /// supplied through a scope id.
    pub fn is_unscoped_local_ipv6(&self) -> bool {
        match self.endpoint {
            SocketAddr::V6(v6) => v6.scope_id() == 0 && is_local_scope(v6.ip()),
            SocketAddr::V4(_) => false,
        }
    }
}

pub(crate) fn is_local_scope(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    // fe80::/10 link-local, fec0::/10 site-local
    (first & 0xffc0) == 0xfe80 || (first & 0xffc0) == 0xfec0
}

fn with_port(mut endpoint: SocketAddr, port: u16) -> SocketAddr {
    endpoint.set_port(port);
    endpoint
}

/// Resolve the host part of an address to a single endpoint (port 0)
async fn resolve_host(
    host: &str,
    resolver: &dyn NameResolver,
) -> Result<SocketAddr, AddressParseError> {
    if let Some(endpoint) = parse_ip_literal(host)? {
        return Ok(endpoint);
    }

    let resolved = resolver
        .resolve(host)
        .await
        .map_err(|e| AddressParseError::Unresolved {
            host: host.to_string(),
            reason: e.to_string(),
        })?;

    resolved
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| resolved.first())
        .copied()
        .ok_or_else(|| AddressParseError::Unresolved {
            host: host.to_string(),
            reason: "no addresses".to_string(),
        })
}

/// Parse an IP literal, including numeric IPv6 zones
///
/// Returns `Ok(None)` when the host is not a literal (or carries a named
/// zone), in which case the resolver has to handle it.
fn parse_ip_literal(host: &str) -> Result<Option<SocketAddr>, AddressParseError> {
    if let Some((addr, zone)) = host.split_once('%') {
        let Ok(ip) = addr.parse::<Ipv6Addr>() else {
            return Ok(None);
        };
        if zone.is_empty() {
            return Err(AddressParseError::InvalidZone(host.to_string()));
        }
        return Ok(zone
            .parse::<u32>()
            .ok()
            .map(|scope| SocketAddr::V6(SocketAddrV6::new(ip, 0, 0, scope))));
    }

    Ok(host.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 0)))
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.endpoint == other.endpoint
    }
}

impl Eq for Address {}

impl Hash for Address {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.endpoint.hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SocketAddr renders IPv6 bracketed (with %scope) and IPv4 bare
        write!(f, "{}", self.endpoint)
    }
}
