//! Local network peer discovery.
//!
//! A [`LocalDiscovery`] advertises the host through a [`Broadcaster`]
//! (mDNS in production, [`MemoryLan`] in simulations), periodically queries
//! for other nodes, classifies likely bootstrap nodes by port and keeps
//! connections to them alive. Components subscribe through a
//! [`DiscoveryHub`], which shares one service per host.

mod announce;
mod broadcaster;
mod events;
mod hub;
mod mdns;
mod service;
mod table;

pub use announce::{
    instance_name, is_likely_bootstrap, Advertisement, Announcement, BOOTSTRAP_PORTS,
    DEFAULT_ANNOUNCE_PORT, TXT_RECORD_BUDGET,
};
pub use broadcaster::{Broadcaster, MemoryBroadcaster, MemoryLan};
pub use events::{DiscoveryCallback, DiscoveryEvent, FnCallback};
pub use hub::DiscoveryHub;
pub use mdns::MdnsBroadcaster;
pub use service::LocalDiscovery;
pub use table::{DiscoveredPeer, DiscoveryStats, Sighting};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{AddrInfo, PeerAddr};
    use crate::config::DiscoveryConfig;
    use crate::error::Result;
    use crate::identity::{Keypair, PeerId};
    use crate::keys::PROTOCOL_PREFIX;
    use crate::substrate::memory::MemoryNetwork;
    use crate::substrate::{Host, RunMode, Substrate, SubstrateConfig, SubstrateNode};
    use async_trait::async_trait;
    use crate::validator::NamespacedValidator;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    async fn node(net: &MemoryNetwork, listen: &str) -> SubstrateNode {
        net.build(SubstrateConfig {
            keypair: Keypair::generate(),
            listen_addrs: vec![listen.parse().unwrap()],
            run_mode: RunMode::Server,
            validator: Arc::new(NamespacedValidator::standard()),
            protocol_prefix: PROTOCOL_PREFIX.to_string(),
            bucket_size: 20,
            bootstrap_peers: Arc::new(|| Vec::new()),
        })
        .await
        .unwrap()
    }

    fn lan_ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    fn noop() -> Arc<dyn DiscoveryCallback> {
        Arc::new(FnCallback::new(|_, _| async { Ok::<(), crate::Error>(()) }))
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    /// Host whose dials take a while, counting attempts and overlap.
    struct SlowHost {
        inner: Arc<dyn Host>,
        active: AtomicUsize,
        peak: AtomicUsize,
        attempts: AtomicUsize,
    }

    impl SlowHost {
        fn new(inner: Arc<dyn Host>) -> Self {
            Self {
                inner,
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                attempts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Host for SlowHost {
        fn id(&self) -> PeerId {
            self.inner.id()
        }

        fn addrs(&self) -> Vec<PeerAddr> {
            self.inner.addrs()
        }

        async fn connect(&self, peer: &AddrInfo) -> Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.attempts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let res = self.inner.connect(peer).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            res
        }

        fn is_connected(&self, peer: &PeerId) -> bool {
            self.inner.is_connected(peer)
        }

        fn connected_peers(&self) -> Vec<PeerId> {
            self.inner.connected_peers()
        }

        fn peer_addrs(&self, peer: &PeerId) -> Vec<PeerAddr> {
            self.inner.peer_addrs(peer)
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[test_log::test(tokio::test)]
    async fn bootstrap_announcement_is_connected() {
        let net = MemoryNetwork::new();
        let lan = MemoryLan::new();
        let local = node(&net, "/ip4/192.168.1.10/tcp/3000").await;
        let seed = node(&net, "/ip4/192.168.1.20/tcp/4001").await;

        let service = LocalDiscovery::new(
            Arc::clone(&local.host),
            Arc::new(lan.broadcaster(lan_ip(10))),
            DiscoveryConfig::default(),
            "test",
        );

        let ad = Advertisement::for_host(seed.host.id(), "seed", &seed.host.addrs());
        let found = service
            .handle_announcement(&Announcement::from_advertisement(&ad, Some(lan_ip(20))))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, seed.host.id());

        let peers = service.peers();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].is_bootstrap);

        assert!(eventually(|| service.stats().connected_bootstrap == 1).await);
        assert!(local.host.is_connected(&seed.host.id()));
        assert_eq!(service.connected_bootstrap_peers().len(), 1);
    }

    #[tokio::test]
    async fn self_announcements_are_ignored() {
        let net = MemoryNetwork::new();
        let lan = MemoryLan::new();
        let local = node(&net, "/ip4/192.168.1.10/tcp/4001").await;
        let service = LocalDiscovery::new(
            Arc::clone(&local.host),
            Arc::new(lan.broadcaster(lan_ip(10))),
            DiscoveryConfig::default(),
            "test",
        );
        service.start().await.unwrap();
        service.query_once().await;
        assert_eq!(service.stats().total_discovered, 0);
        service.close().await.unwrap();
        assert!(lan.is_empty());
    }

    #[tokio::test]
    async fn repeated_announcements_respect_the_retry_bound() {
        let net = MemoryNetwork::new();
        let lan = MemoryLan::new();
        let local = node(&net, "/ip4/192.168.1.10/tcp/3000").await;
        let seed = node(&net, "/ip4/192.168.1.20/tcp/4001").await;
        net.set_reachable(&seed.host.id(), false);

        let host = Arc::new(SlowHost::new(Arc::clone(&local.host)));
        let config = DiscoveryConfig::default();
        let max = config.max_connection_tries;
        let service = LocalDiscovery::new(
            Arc::clone(&host) as Arc<dyn Host>,
            Arc::new(lan.broadcaster(lan_ip(10))),
            config,
            "test",
        );

        let ad = Advertisement::for_host(seed.host.id(), "seed", &seed.host.addrs());
        let answer = Announcement::from_advertisement(&ad, Some(lan_ip(20)));
        for _ in 0..12 {
            // the second sighting lands while the first dial is still running
            service.handle_announcement(&answer).await.unwrap();
            service.handle_announcement(&answer).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(host.peak.load(Ordering::SeqCst), 1);
        assert_eq!(host.attempts.load(Ordering::SeqCst), max as usize);
        let peers = service.peers();
        assert_eq!(peers[0].connection_tries, max);
        assert!(!peers[0].connected);
    }

    #[tokio::test]
    async fn refresh_notices_dropped_connections() {
        let net = MemoryNetwork::new();
        let lan = MemoryLan::new();
        let local = node(&net, "/ip4/192.168.1.10/tcp/3000").await;
        let seed = node(&net, "/ip4/192.168.1.20/tcp/5001").await;
        let service = LocalDiscovery::new(
            Arc::clone(&local.host),
            Arc::new(lan.broadcaster(lan_ip(10))),
            DiscoveryConfig::default(),
            "test",
        );

        let info = AddrInfo::new(seed.host.id(), seed.host.addrs());
        let ad = Advertisement::for_host(seed.host.id(), "seed", &info.addrs);
        service
            .handle_announcement(&Announcement::from_advertisement(&ad, None))
            .await
            .unwrap();
        service.connect_peer(&info).await.unwrap();
        assert_eq!(service.stats().connected_bootstrap, 1);

        net.set_reachable(&seed.host.id(), false);
        service.refresh_connections().await;
        assert_eq!(service.stats().connected_bootstrap, 0);

        net.set_reachable(&seed.host.id(), true);
        service.refresh_connections().await;
        assert!(eventually(|| service.stats().connected_bootstrap == 1).await);
    }

    #[tokio::test]
    async fn fast_refresh_reconnects_without_the_slow_loop() {
        let net = MemoryNetwork::new();
        let lan = MemoryLan::new();
        let local = node(&net, "/ip4/192.168.1.10/tcp/3000").await;
        let seed = node(&net, "/ip4/192.168.1.20/tcp/8080").await;
        let config = DiscoveryConfig {
            fast_refresh_interval: Duration::from_millis(20),
            ..DiscoveryConfig::default()
        };
        let service = LocalDiscovery::new(
            Arc::clone(&local.host),
            Arc::new(lan.broadcaster(lan_ip(10))),
            config,
            "test",
        );

        let ad = Advertisement::for_host(seed.host.id(), "seed", &seed.host.addrs());
        service
            .handle_announcement(&Announcement::from_advertisement(&ad, None))
            .await
            .unwrap();
        assert!(eventually(|| service.stats().connected_bootstrap == 1).await);

        net.set_reachable(&seed.host.id(), false);
        service.start_fast_refresh();
        service.start_fast_refresh();
        assert!(eventually(|| service.stats().connected_bootstrap == 0).await);

        net.set_reachable(&seed.host.id(), true);
        assert!(eventually(|| service.stats().connected_bootstrap == 1).await);
        service.close().await.unwrap();
    }

    #[tokio::test]
    async fn hub_shares_one_service_and_stops_on_last_detach() {
        let net = MemoryNetwork::new();
        let lan = MemoryLan::new();
        let local = node(&net, "/ip4/192.168.1.10/tcp/4001").await;
        let hub = DiscoveryHub::new();
        let host_id = local.host.id();

        let a = hub
            .attach(
                Arc::clone(&local.host),
                Arc::new(lan.broadcaster(lan_ip(10))),
                DiscoveryConfig::default(),
                "registry",
                noop(),
            )
            .await
            .unwrap();
        let b = hub
            .attach(
                Arc::clone(&local.host),
                Arc::new(lan.broadcaster(lan_ip(10))),
                DiscoveryConfig::default(),
                "sync",
                noop(),
            )
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.callback_count(), 2);
        assert_eq!(lan.len(), 1);

        assert!(!hub.detach(&host_id, "registry").await.unwrap());
        assert!(!a.is_closed());
        assert!(hub.detach(&host_id, "sync").await.unwrap());
        assert!(a.is_closed());
        assert!(hub.is_empty());
        assert!(lan.is_empty());
    }

    #[tokio::test]
    async fn callbacks_see_sightings() {
        let net = MemoryNetwork::new();
        let lan = MemoryLan::new();
        let local = node(&net, "/ip4/192.168.1.10/tcp/3000").await;
        let other = node(&net, "/ip4/192.168.1.30/tcp/3000").await;
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = {
            let hits = Arc::clone(&hits);
            Arc::new(FnCallback::new(move |_, is_bootstrap| {
                let hits = Arc::clone(&hits);
                async move {
                    assert!(!is_bootstrap);
                    hits.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), crate::Error>(())
                }
            }))
        };

        let hub = DiscoveryHub::new();
        let service = hub
            .attach(
                Arc::clone(&local.host),
                Arc::new(lan.broadcaster(lan_ip(10))),
                DiscoveryConfig::default(),
                "registry",
                counter,
            )
            .await
            .unwrap();

        let addr: PeerAddr = "/ip4/192.168.1.30/tcp/3000".parse().unwrap();
        lan.announce(Advertisement::for_host(other.host.id(), "other", &[addr]), lan_ip(30));
        service.query_once().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        hub.close_host(&local.host.id()).await.unwrap();
    }
}
