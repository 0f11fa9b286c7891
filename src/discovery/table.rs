//! Table of peers seen on the local network.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::addr::AddrInfo;
use crate::identity::PeerId;

/// A peer found by local discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// Identity and addresses.
    pub info: AddrInfo,
    /// Classified as a bootstrap node.
    pub is_bootstrap: bool,
    /// A live connection exists.
    pub connected: bool,
    /// First sighting.
    pub first_seen: Instant,
    /// Latest sighting.
    pub last_seen: Instant,
    /// Connection attempts since the last success.
    pub connection_tries: u32,
}

/// Aggregate view of the discovery table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    /// Live entries.
    pub total_discovered: usize,
    /// Live entries classified as bootstrap nodes.
    pub bootstrap_discovered: usize,
    /// Bootstrap entries with a live connection.
    pub connected_bootstrap: usize,
    /// Wall-clock time of the latest sighting.
    pub last_discovery_time: Option<DateTime<Utc>>,
    /// Identities of all live entries, sorted.
    pub active_peers: Vec<PeerId>,
}

/// Result of recording a sighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sighting {
    /// First time this peer was seen.
    New,
    /// Known peer seen again.
    Refreshed,
}

#[derive(Debug)]
pub(crate) struct PeerTable {
    peers: HashMap<PeerId, DiscoveredPeer>,
    stale_after: Duration,
    last_discovery: Option<DateTime<Utc>>,
}

impl PeerTable {
    pub(crate) fn new(stale_after: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            stale_after,
            last_discovery: None,
        }
    }

    fn is_live(&self, peer: &DiscoveredPeer, now: Instant) -> bool {
        now.saturating_duration_since(peer.last_seen) <= self.stale_after
    }

    /// Record a sighting, merging addresses into a known entry.
    pub(crate) fn upsert(&mut self, info: AddrInfo, is_bootstrap: bool, now: Instant) -> Sighting {
        self.last_discovery = Some(Utc::now());
        match self.peers.get_mut(&info.id) {
            Some(existing) => {
                existing.info.merge_addrs(info.addrs);
                existing.is_bootstrap |= is_bootstrap;
                existing.last_seen = now;
                Sighting::Refreshed
            }
            None => {
                self.peers.insert(
                    info.id,
                    DiscoveredPeer {
                        info,
                        is_bootstrap,
                        connected: false,
                        first_seen: now,
                        last_seen: now,
                        connection_tries: 0,
                    },
                );
                Sighting::New
            }
        }
    }

    pub(crate) fn get(&self, id: &PeerId) -> Option<&DiscoveredPeer> {
        self.peers.get(id)
    }

    /// Set connection status; returns `true` when it changed.
    pub(crate) fn set_connected(&mut self, id: &PeerId, connected: bool) -> bool {
        match self.peers.get_mut(id) {
            Some(peer) if peer.connected != connected => {
                peer.connected = connected;
                if connected {
                    peer.connection_tries = 0;
                }
                true
            }
            _ => false,
        }
    }

    /// Count a connection attempt; returns the new count.
    pub(crate) fn record_attempt(&mut self, id: &PeerId) -> Option<u32> {
        self.peers.get_mut(id).map(|peer| {
            peer.connection_tries += 1;
            peer.connection_tries
        })
    }

    /// Drop entries unseen for longer than the stale window.
    pub(crate) fn prune(&mut self, now: Instant) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| !self.is_live(p, now))
            .map(|p| p.info.id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    /// Live entries.
    pub(crate) fn snapshot(&self, now: Instant) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<DiscoveredPeer> = self
            .peers
            .values()
            .filter(|p| self.is_live(p, now))
            .cloned()
            .collect();
        peers.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        peers
    }

    /// Stats recomputed from the live entries.
    pub(crate) fn stats(&self, now: Instant) -> DiscoveryStats {
        let live = self.snapshot(now);
        DiscoveryStats {
            total_discovered: live.len(),
            bootstrap_discovered: live.iter().filter(|p| p.is_bootstrap).count(),
            connected_bootstrap: live
                .iter()
                .filter(|p| p.is_bootstrap && p.connected)
                .count(),
            last_discovery_time: self.last_discovery,
            active_peers: live.iter().map(|p| p.info.id).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::PeerAddr;
    use crate::identity::Keypair;

    fn info(port: u16) -> AddrInfo {
        let addr: PeerAddr = format!("/ip4/192.168.1.2/tcp/{port}").parse().unwrap();
        AddrInfo::new(Keypair::generate().peer_id(), [addr])
    }

    fn assert_consistent(stats: &DiscoveryStats) {
        assert!(stats.bootstrap_discovered <= stats.total_discovered);
        assert!(stats.connected_bootstrap <= stats.bootstrap_discovered);
        assert_eq!(stats.active_peers.len(), stats.total_discovered);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_leave_the_snapshot() {
        let mut table = PeerTable::new(Duration::from_secs(300));
        let old = info(4001);
        table.upsert(old.clone(), true, Instant::now());

        tokio::time::advance(Duration::from_secs(200)).await;
        let fresh = info(3000);
        table.upsert(fresh.clone(), false, Instant::now());

        tokio::time::advance(Duration::from_secs(101)).await;
        let now = Instant::now();
        let ids: Vec<_> = table.snapshot(now).iter().map(|p| p.info.id).collect();
        assert_eq!(ids, vec![fresh.id]);
        assert_eq!(table.stats(now).total_discovered, 1);

        assert_eq!(table.prune(now), vec![old.id]);
        assert!(table.get(&old.id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resighting_refreshes_and_merges() {
        let mut table = PeerTable::new(Duration::from_secs(300));
        let mut peer = info(4001);
        assert_eq!(table.upsert(peer.clone(), false, Instant::now()), Sighting::New);

        tokio::time::advance(Duration::from_secs(250)).await;
        peer.addrs = vec!["/ip4/10.0.0.7/tcp/4001".parse().unwrap()];
        assert_eq!(table.upsert(peer.clone(), true, Instant::now()), Sighting::Refreshed);

        tokio::time::advance(Duration::from_secs(250)).await;
        let snap = table.snapshot(Instant::now());
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].info.addrs.len(), 2);
        assert!(snap[0].is_bootstrap);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_track_connection_state() {
        let mut table = PeerTable::new(Duration::from_secs(300));
        let now = Instant::now();
        let boot_a = info(4001);
        let boot_b = info(5001);
        let plain = info(3000);
        table.upsert(boot_a.clone(), true, now);
        table.upsert(boot_b.clone(), true, now);
        table.upsert(plain.clone(), false, now);

        let stats = table.stats(now);
        assert_consistent(&stats);
        assert_eq!((stats.total_discovered, stats.bootstrap_discovered, stats.connected_bootstrap), (3, 2, 0));

        assert_eq!(table.record_attempt(&boot_a.id), Some(1));
        assert!(table.set_connected(&boot_a.id, true));
        assert!(!table.set_connected(&boot_a.id, true));
        assert!(table.set_connected(&plain.id, true));
        assert_eq!(table.get(&boot_a.id).unwrap().connection_tries, 0);

        let stats = table.stats(now);
        assert_consistent(&stats);
        assert_eq!(stats.connected_bootstrap, 1);
        assert!(stats.last_discovery_time.is_some());

        assert!(table.set_connected(&boot_a.id, false));
        let stats = table.stats(now);
        assert_consistent(&stats);
        assert_eq!(stats.connected_bootstrap, 0);
    }
}
