//! Public vs internal address decision
//!
//! Decides once per session whether members are dialed on the public
//! addresses they advertise or on their internal ones.

use async_trait::async_trait;
use gridlink_core::{Address, ClientNetworkConfig, HostPort, PublicAddressMode};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Members probed at most
pub const REACHABILITY_SAMPLE_SIZE: usize = 3;
/// Timeout for reaching a member on its internal address
pub const INTERNAL_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
/// Timeout for reaching a member on its public address
pub const PUBLIC_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// A member's self-reported internal address and optional public address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberAddresses {
    pub internal: Address,
    pub public: Option<Address>,
}

impl MemberAddresses {
    pub fn new(internal: Address, public: Option<Address>) -> Self {
        Self { internal, public }
    }
}

/// Dial test used to probe members
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self, address: &Address, timeout: Duration) -> bool;
}

/// Probes with a plain TCP connect that is dropped immediately
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpReachabilityProbe;

#[async_trait]
impl ReachabilityProbe for TcpReachabilityProbe {
    async fn is_reachable(&self, address: &Address, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect(address.socket_addr())).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", address, e);
                false
            }
            Err(_) => {
                debug!("Probe of {} timed out after {:?}", address, timeout);
                false
            }
        }
    }
}

/// Session-wide public/internal address decision
pub struct ConnectAddressResolver {
    mode: PublicAddressMode,
    tls_enabled: bool,
    seed_hosts: Vec<String>,
    probe: Arc<dyn ReachabilityProbe>,
}

impl ConnectAddressResolver {
    pub fn new(
        mode: PublicAddressMode,
        tls_enabled: bool,
        seed_hosts: Vec<String>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Self {
        Self {
            mode,
            tls_enabled,
            seed_hosts,
            probe,
        }
    }

    pub fn from_config(config: &ClientNetworkConfig, probe: Arc<dyn ReachabilityProbe>) -> Self {
        // Cloud members are never listed as seeds
        let seed_hosts = if config.cloud.enabled() {
            Vec::new()
        } else {
            config
                .seed_addresses()
                .iter()
                .filter_map(|seed| HostPort::split(seed).ok())
                .map(|hp| hp.host)
                .collect()
        };

        Self::new(config.public_address, config.tls.enabled, seed_hosts, probe)
    }

    /// Whether the session dials members on their public addresses
    ///
    /// Rules apply in order and the first one that decides wins: explicit
    /// configuration, TLS, seed host match, missing public address, and
    /// finally a reachability probe over a small random sample of members.
    pub async fn determine_use_public_addresses(&self, members: &[MemberAddresses]) -> bool {
        if let Some(explicit) = self.mode.explicit() {
            debug!("Public address usage configured explicitly: {}", explicit);
            return explicit;
        }

        if self.tls_enabled {
            debug!("TLS is enabled, using internal addresses");
            return false;
        }

        if members.is_empty() {
            return false;
        }

        if members.iter().any(|m| self.is_seed_host(&m.internal)) {
            debug!("A member matches a configured seed host, using internal addresses");
            return false;
        }

        if members.iter().any(|m| m.public.is_none()) {
            debug!("Not every member has a public address, using internal addresses");
            return false;
        }

        let mut sample: Vec<&MemberAddresses> = members.iter().collect();
        sample.shuffle(&mut rand::thread_rng());
        sample.truncate(REACHABILITY_SAMPLE_SIZE);

        let mut public_only = false;
        for member in sample {
            if self
                .probe
                .is_reachable(&member.internal, INTERNAL_PROBE_TIMEOUT)
                .await
            {
                debug!("{} reachable internally, using internal addresses", member.internal);
                return false;
            }

            if let Some(public) = &member.public {
                if self.probe.is_reachable(public, PUBLIC_PROBE_TIMEOUT).await {
                    debug!("{} reachable only on public address {}", member.internal, public);
                    public_only = true;
                }
            }
        }

        if public_only {
            info!("Members are reachable only on public addresses, using public addresses");
        } else {
            debug!("No member was reachable, defaulting to internal addresses");
        }
        public_only
    }

    fn is_seed_host(&self, internal: &Address) -> bool {
        let ip = internal.ip().to_string();
        self.seed_hosts
            .iter()
            .any(|seed| seed == internal.host() || *seed == ip)
    }
}

impl std::fmt::Debug for ConnectAddressResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectAddressResolver")
            .field("mode", &self.mode)
            .field("tls_enabled", &self.tls_enabled)
            .field("seed_hosts", &self.seed_hosts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records every probe; reachable set is fixed up front
    #[derive(Default)]
    struct RecordingProbe {
        reachable: HashSet<Address>,
        calls: Mutex<Vec<(Address, Duration)>>,
    }

    impl RecordingProbe {
        fn reaching(addresses: &[&Address]) -> Self {
            Self {
                reachable: addresses.iter().map(|a| (*a).clone()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<(Address, Duration)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReachabilityProbe for RecordingProbe {
        async fn is_reachable(&self, address: &Address, timeout: Duration) -> bool {
            self.calls.lock().unwrap().push((address.clone(), timeout));
            self.reachable.contains(address)
        }
    }

    fn addr(s: &str) -> Address {
        Address::from_socket_addr(s.parse().unwrap())
    }

    fn member(internal: &str, public: Option<&str>) -> MemberAddresses {
        MemberAddresses::new(addr(internal), public.map(addr))
    }

    fn resolver(
        mode: PublicAddressMode,
        tls: bool,
        seeds: &[&str],
        probe: Arc<RecordingProbe>,
    ) -> ConnectAddressResolver {
        ConnectAddressResolver::new(
            mode,
            tls,
            seeds.iter().map(|s| s.to_string()).collect(),
            probe,
        )
    }

    #[tokio::test]
    async fn test_explicit_mode_wins() {
        let members = vec![member("10.0.0.1:5701", None)];
        let probe = Arc::new(RecordingProbe::default());

        let public = resolver(PublicAddressMode::Public, true, &[], probe.clone());
        assert!(public.determine_use_public_addresses(&members).await);

        let internal = resolver(PublicAddressMode::Internal, false, &[], probe.clone());
        assert!(!internal.determine_use_public_addresses(&members).await);
        assert!(probe.calls().is_empty());
    }

    #[tokio::test]
    async fn test_tls_always_internal() {
        let members = vec![
            member("10.0.0.1:5701", Some("54.0.0.1:5701")),
            member("10.0.0.2:5701", Some("54.0.0.2:5701")),
        ];
        let probe = Arc::new(RecordingProbe::reaching(&[
            &addr("54.0.0.1:5701"),
            &addr("54.0.0.2:5701"),
        ]));

        let resolver = resolver(PublicAddressMode::Auto, true, &[], probe.clone());
        assert!(!resolver.determine_use_public_addresses(&members).await);
        assert!(probe.calls().is_empty());
    }

    #[tokio::test]
    async fn test_seed_host_match_internal() {
        let members = vec![member("10.0.0.1:5701", Some("54.0.0.1:5701"))];
        let probe = Arc::new(RecordingProbe::reaching(&[&addr("54.0.0.1:5701")]));

        let resolver = resolver(PublicAddressMode::Auto, false, &["10.0.0.1"], probe.clone());
        assert!(!resolver.determine_use_public_addresses(&members).await);
        assert!(probe.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_public_address_internal() {
        let members = vec![
            member("10.0.0.1:5701", Some("54.0.0.1:5701")),
            member("10.0.0.2:5701", None),
        ];
        let probe = Arc::new(RecordingProbe::reaching(&[
            &addr("54.0.0.1:5701"),
            &addr("54.0.0.2:5701"),
        ]));

        let resolver = resolver(PublicAddressMode::Auto, false, &[], probe.clone());
        assert!(!resolver.determine_use_public_addresses(&members).await);
        assert!(probe.calls().is_empty());
    }

    #[tokio::test]
    async fn test_internal_reachable_stops_probing() {
        let members = vec![
            member("10.0.0.1:5701", Some("54.0.0.1:5701")),
            member("10.0.0.2:5701", Some("54.0.0.2:5701")),
            member("10.0.0.3:5701", Some("54.0.0.3:5701")),
        ];
        let probe = Arc::new(RecordingProbe::reaching(&[
            &addr("10.0.0.1:5701"),
            &addr("10.0.0.2:5701"),
            &addr("10.0.0.3:5701"),
        ]));

        let resolver = resolver(PublicAddressMode::Auto, false, &[], probe.clone());
        assert!(!resolver.determine_use_public_addresses(&members).await);

        let calls = probe.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].1, INTERNAL_PROBE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_public_only_reachable() {
        let members: Vec<MemberAddresses> = (1..=5)
            .map(|i| {
                member(
                    &format!("10.0.0.{}:5701", i),
                    Some(&format!("54.0.0.{}:5701", i)),
                )
            })
            .collect();
        let publics: Vec<Address> = members.iter().filter_map(|m| m.public.clone()).collect();
        let probe = Arc::new(RecordingProbe::reaching(&publics.iter().collect::<Vec<_>>()));

        let resolver = resolver(PublicAddressMode::Auto, false, &[], probe.clone());
        assert!(resolver.determine_use_public_addresses(&members).await);

        // Sample is capped; each sampled member probed internal then public
        let calls = probe.calls();
        assert_eq!(calls.len(), REACHABILITY_SAMPLE_SIZE * 2);
        assert!(calls
            .iter()
            .filter(|(_, t)| *t == PUBLIC_PROBE_TIMEOUT)
            .all(|(a, _)| publics.contains(a)));
    }

    #[tokio::test]
    async fn test_nothing_reachable_defaults_internal() {
        let members = vec![member("10.0.0.1:5701", Some("54.0.0.1:5701"))];
        let probe = Arc::new(RecordingProbe::default());

        let resolver = resolver(PublicAddressMode::Auto, false, &[], probe.clone());
        assert!(!resolver.determine_use_public_addresses(&members).await);
        assert_eq!(probe.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_members_internal() {
        let probe = Arc::new(RecordingProbe::default());
        let resolver = resolver(PublicAddressMode::Auto, false, &[], probe);
        assert!(!resolver.determine_use_public_addresses(&[]).await);
    }

    #[test]
    fn test_seed_hosts_from_config() {
        let config = ClientNetworkConfig::builder()
            .address("member1.internal:5701")
            .address("[fe80::1]:5702")
            .build()
            .unwrap();
        let resolver = ConnectAddressResolver::from_config(&config, Arc::new(TcpReachabilityProbe));
        assert_eq!(resolver.seed_hosts, vec!["member1.internal", "fe80::1"]);
    }

    #[tokio::test]
    async fn test_tcp_probe_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = Address::from_socket_addr(listener.local_addr().unwrap());
        drop(listener);

        // Port was just released; nothing listens there now
        let probe = TcpReachabilityProbe;
        assert!(!probe.is_reachable(&open, Duration::from_millis(500)).await);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = Address::from_socket_addr(listener.local_addr().unwrap());
        assert!(probe.is_reachable(&live, Duration::from_secs(1)).await);
    }
}
