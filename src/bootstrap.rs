//! Bootstrap node aggregation.
//!
//! The DHT asks for bootstrap peers on every bootstrap run. The answer is
//! the union of statically configured seed nodes and the bootstrap nodes
//! local discovery has seen since startup, de-duplicated by exact address.

use std::collections::HashSet;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::addr::{AddrInfo, PeerAddr};
use crate::error::{Error, Result};
use crate::identity::PeerId;

/// Configured entries shorter than this are placeholders and are ignored.
pub const MIN_BOOTSTRAP_ENTRY_LEN: usize = 10;

/// Parse a `/ip4/<ip>/tcp/<port>/p2p/<id>` seed entry into the peer identity
/// and the dialable address without the `/p2p` suffix.
pub fn parse_bootstrap_addr(entry: &str) -> Result<(PeerId, PeerAddr)> {
    let addr: PeerAddr = entry.parse()?;
    let peer = addr
        .peer()
        .ok_or_else(|| Error::validation(format!("bootstrap entry {entry:?} has no /p2p component")))?;
    Ok((peer, addr.without_peer()))
}

/// Build a seed entry from components. The peer renders in its libp2p
/// form, `12D3KooW...`.
pub fn make_bootstrap_addr(ip: &str, port: u16, peer: &PeerId) -> String {
    format!("/ip4/{ip}/tcp/{port}/p2p/{}", peer.to_libp2p())
}

/// Union of static and discovered bootstrap addresses, in that order, with
/// exact duplicates removed. Bad static entries are logged and skipped.
pub fn aggregate(static_nodes: &[String], discovered: &[PeerAddr]) -> Vec<PeerAddr> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for entry in static_nodes {
        let entry = entry.trim();
        if entry.len() < MIN_BOOTSTRAP_ENTRY_LEN {
            if !entry.is_empty() {
                debug!(entry, "ignoring placeholder bootstrap entry");
            }
            continue;
        }
        match parse_bootstrap_addr(entry) {
            Ok((peer, addr)) => {
                let full = addr.with_peer(peer);
                if seen.insert(full.clone()) {
                    out.push(full);
                }
            }
            Err(e) => warn!(entry, error = %e, "skipping unparsable bootstrap entry"),
        }
    }

    for addr in discovered {
        if addr.peer().is_none() {
            warn!(%addr, "skipping discovered bootstrap address without peer id");
            continue;
        }
        if seen.insert(addr.clone()) {
            out.push(addr.clone());
        }
    }
    out
}

/// Live bootstrap node list shared between discovery and the DHT.
#[derive(Debug, Default)]
pub struct BootstrapAggregator {
    static_nodes: Vec<String>,
    discovered: RwLock<Vec<PeerAddr>>,
}

impl BootstrapAggregator {
    /// Aggregator over the configured seed entries.
    pub fn new(static_nodes: Vec<String>) -> Self {
        Self {
            static_nodes,
            discovered: RwLock::new(Vec::new()),
        }
    }

    /// Record the addresses of a bootstrap node found by local discovery.
    /// Returns `true` when at least one address was new.
    pub fn add_discovered(&self, info: &AddrInfo) -> bool {
        let mut discovered = self.discovered.write();
        let mut added = false;
        for addr in info.p2p_addrs() {
            if !discovered.contains(&addr) {
                info!(%addr, "added discovered bootstrap node");
                discovered.push(addr);
                added = true;
            }
        }
        added
    }

    /// Current aggregate as full `/p2p` addresses.
    pub fn addrs(&self) -> Vec<PeerAddr> {
        let discovered = self.discovered.read().clone();
        aggregate(&self.static_nodes, &discovered)
    }

    /// Current aggregate grouped by peer.
    pub fn peers(&self) -> Vec<AddrInfo> {
        // every address out of aggregate() carries a peer id
        AddrInfo::from_p2p_addrs(self.addrs()).unwrap_or_default()
    }

    /// Identities of every known bootstrap node.
    pub fn peer_ids(&self) -> HashSet<PeerId> {
        self.addrs().iter().filter_map(PeerAddr::peer).collect()
    }
}
