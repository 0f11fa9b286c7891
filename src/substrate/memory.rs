//! In-process substrate.
//!
//! [`MemoryNetwork`] simulates a small overlay inside one process: nodes get
//! loopback-style addresses, connections are symmetric, the DHT is a single
//! shared table guarded by the writer's validator, and reachability can be
//! toggled per node to exercise reconnect paths.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::{BootstrapPeersFn, Dht, Host, RunMode, Substrate, SubstrateConfig, SubstrateNode};
use crate::addr::{AddrInfo, PeerAddr};
use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::keys::ContentKey;
use crate::validator::Validator;

const FIRST_PORT: u16 = 40000;

struct NodeState {
    addrs: Vec<PeerAddr>,
    run_mode: RunMode,
    reachable: bool,
    online: bool,
    connections: HashSet<PeerId>,
    routing: HashSet<PeerId>,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<PeerId, NodeState>,
    values: HashMap<String, Vec<u8>>,
    providers: HashMap<ContentKey, Vec<PeerId>>,
    next_port: u16,
}

impl NetworkState {
    fn online(&self, id: &PeerId) -> Option<&NodeState> {
        self.nodes.get(id).filter(|n| n.online)
    }

    fn link(&mut self, a: PeerId, b: PeerId) {
        let a_serves = self.nodes.get(&a).map(|n| n.run_mode.serves_records());
        let b_serves = self.nodes.get(&b).map(|n| n.run_mode.serves_records());
        if let Some(node) = self.nodes.get_mut(&a) {
            node.connections.insert(b);
            if b_serves == Some(true) {
                node.routing.insert(b);
            }
        }
        if let Some(node) = self.nodes.get_mut(&b) {
            node.connections.insert(a);
            if a_serves == Some(true) {
                node.routing.insert(a);
            }
        }
    }

    fn unlink(&mut self, a: PeerId, b: PeerId) {
        if let Some(node) = self.nodes.get_mut(&a) {
            node.connections.remove(&b);
            node.routing.remove(&b);
        }
        if let Some(node) = self.nodes.get_mut(&b) {
            node.connections.remove(&a);
            node.routing.remove(&a);
        }
    }

    fn addr_info(&self, id: &PeerId) -> Option<AddrInfo> {
        self.online(id)
            .map(|n| AddrInfo::new(*id, n.addrs.iter().cloned()))
    }
}

/// A simulated overlay shared by every node built from it.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `peer` accept or refuse new connections. Refusing also drops
    /// its existing connections.
    pub fn set_reachable(&self, peer: &PeerId, reachable: bool) {
        let mut state = self.state.lock();
        let linked: Vec<PeerId> = match state.nodes.get_mut(peer) {
            Some(node) => {
                node.reachable = reachable;
                if reachable {
                    Vec::new()
                } else {
                    node.connections.iter().copied().collect()
                }
            }
            None => return,
        };
        for other in linked {
            state.unlink(*peer, other);
        }
    }

    /// Drop the connection between `a` and `b`, if any.
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        self.state.lock().unlink(*a, *b);
    }

    /// Raw value stored under `key`.
    pub fn value(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().values.get(key).cloned()
    }

    /// Number of online nodes.
    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.values().filter(|n| n.online).count()
    }
}

#[async_trait]
impl Substrate for MemoryNetwork {
    async fn build(&self, config: SubstrateConfig) -> Result<SubstrateNode> {
        let id = config.keypair.peer_id();
        let mut state = self.state.lock();
        if state.online(&id).is_some() {
            return Err(Error::config(format!("node {id} is already running")));
        }

        let mut addrs: Vec<PeerAddr> = config
            .listen_addrs
            .iter()
            .map(|a| {
                if a.ip().is_unspecified() {
                    PeerAddr::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), a.port())
                } else {
                    a.clone().without_peer()
                }
            })
            .collect();
        if addrs.is_empty() {
            let port = FIRST_PORT + state.next_port;
            state.next_port = state.next_port.wrapping_add(1);
            addrs.push(PeerAddr::tcp(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        }

        debug!(%id, ?addrs, run_mode = ?config.run_mode, "memory node online");
        state.nodes.insert(
            id,
            NodeState {
                addrs,
                run_mode: config.run_mode,
                reachable: true,
                online: true,
                connections: HashSet::new(),
                routing: HashSet::new(),
            },
        );
        drop(state);

        let node = Arc::new(MemoryNode {
            id,
            network: self.clone(),
            validator: config.validator,
            bootstrap_peers: config.bootstrap_peers,
        });
        Ok(SubstrateNode {
            host: node.clone(),
            dht: node,
        })
    }
}

/// One node of a [`MemoryNetwork`]; serves as both [`Host`] and [`Dht`].
pub struct MemoryNode {
    id: PeerId,
    network: MemoryNetwork,
    validator: Arc<dyn Validator>,
    bootstrap_peers: BootstrapPeersFn,
}

impl MemoryNode {
    fn require_routing(&self, op: &str) -> Result<()> {
        if self.routing_table_size() == 0 {
            return Err(Error::network(format!("{op}: no peers in routing table")));
        }
        Ok(())
    }
}

#[async_trait]
impl Host for MemoryNode {
    fn id(&self) -> PeerId {
        self.id
    }

    fn addrs(&self) -> Vec<PeerAddr> {
        self.network
            .state
            .lock()
            .online(&self.id)
            .map(|n| n.addrs.clone())
            .unwrap_or_default()
    }

    async fn connect(&self, peer: &AddrInfo) -> Result<()> {
        if peer.id == self.id {
            return Err(Error::validation("cannot connect to self"));
        }
        let mut state = self.network.state.lock();
        if state.online(&self.id).is_none() {
            return Err(Error::Closed);
        }
        match state.online(&peer.id) {
            Some(node) if node.reachable => {}
            Some(_) => return Err(Error::network(format!("peer {} refused connection", peer.id))),
            None => return Err(Error::network(format!("peer {} is unreachable", peer.id))),
        }
        state.link(self.id, peer.id);
        trace!(local = %self.id, remote = %peer.id, "memory connection established");
        Ok(())
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.network
            .state
            .lock()
            .online(&self.id)
            .map(|n| n.connections.contains(peer))
            .unwrap_or(false)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let state = self.network.state.lock();
        let mut peers: Vec<PeerId> = state
            .online(&self.id)
            .map(|n| n.connections.iter().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    fn peer_addrs(&self, peer: &PeerId) -> Vec<PeerAddr> {
        self.network
            .state
            .lock()
            .addr_info(peer)
            .map(|info| info.addrs)
            .unwrap_or_default()
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.network.state.lock();
        let linked: Vec<PeerId> = match state.nodes.get_mut(&self.id) {
            Some(node) => {
                node.online = false;
                node.connections.iter().copied().collect()
            }
            None => return Ok(()),
        };
        for other in linked {
            state.unlink(self.id, other);
        }
        for providers in state.providers.values_mut() {
            providers.retain(|p| *p != self.id);
        }
        debug!(id = %self.id, "memory node offline");
        Ok(())
    }
}

#[async_trait]
impl Dht for MemoryNode {
    async fn bootstrap(&self) -> Result<()> {
        let peers = (self.bootstrap_peers)();
        let mut reached = 0usize;
        let mut tried = 0usize;
        for peer in peers.iter().filter(|p| p.id != self.id) {
            tried += 1;
            match Host::connect(self, peer).await {
                Ok(()) => reached += 1,
                Err(e) => debug!(peer = %peer.id, error = %e, "bootstrap peer unreachable"),
            }
        }
        if tried > 0 && reached == 0 {
            return Err(Error::network(format!("none of {tried} bootstrap peers reachable")));
        }
        debug!(id = %self.id, reached, routing = self.routing_table_size(), "bootstrap finished");
        Ok(())
    }

    async fn put_value(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.validator.validate(key, &value)?;
        self.require_routing("put_value")?;
        self.network
            .state
            .lock()
            .values
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Vec<u8>> {
        self.network
            .state
            .lock()
            .values
            .get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no value under {key}")))
    }

    async fn provide(&self, key: &ContentKey) -> Result<()> {
        self.require_routing("provide")?;
        let mut state = self.network.state.lock();
        let providers = state.providers.entry(*key).or_default();
        if !providers.contains(&self.id) {
            providers.push(self.id);
        }
        Ok(())
    }

    async fn find_providers(&self, key: &ContentKey) -> Result<Vec<AddrInfo>> {
        let state = self.network.state.lock();
        Ok(state
            .providers
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| state.addr_info(id)).collect())
            .unwrap_or_default())
    }

    async fn find_peer(&self, peer: &PeerId) -> Result<AddrInfo> {
        self.network
            .state
            .lock()
            .addr_info(peer)
            .ok_or_else(|| Error::not_found(format!("peer {peer} not found")))
    }

    fn routing_table_size(&self) -> usize {
        let state = self.network.state.lock();
        state
            .online(&self.id)
            .map(|n| n.routing.iter().filter(|p| state.online(p).is_some()).count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::marshal_peer;
    use crate::identity::Keypair;
    use crate::keys::{peer_key, PROTOCOL_PREFIX};
    use crate::peer::Peer;
    use crate::validator::NamespacedValidator;

    fn config(keypair: Keypair, bootstrap: Vec<AddrInfo>) -> SubstrateConfig {
        SubstrateConfig {
            keypair,
            listen_addrs: Vec::new(),
            run_mode: RunMode::Server,
            validator: Arc::new(NamespacedValidator::standard()),
            protocol_prefix: PROTOCOL_PREFIX.to_string(),
            bucket_size: 20,
            bootstrap_peers: Arc::new(move || bootstrap.clone()),
        }
    }

    #[tokio::test]
    async fn bootstrap_populates_routing() {
        let net = MemoryNetwork::new();
        let seed = net.build(config(Keypair::generate(), vec![])).await.unwrap();
        let seed_info = AddrInfo::new(seed.host.id(), seed.host.addrs());

        let node = net
            .build(config(Keypair::generate(), vec![seed_info]))
            .await
            .unwrap();
        assert_eq!(node.dht.routing_table_size(), 0);
        node.dht.bootstrap().await.unwrap();
        assert_eq!(node.dht.routing_table_size(), 1);
        assert!(seed.host.is_connected(&node.host.id()));
    }

    #[tokio::test]
    async fn writes_need_routing_and_pass_validation() {
        let net = MemoryNetwork::new();
        let keys = Keypair::generate();
        let a = net.build(config(keys.clone(), vec![])).await.unwrap();
        let b = net.build(config(Keypair::generate(), vec![])).await.unwrap();

        let key = peer_key(&keys.peer_id());
        let value = marshal_peer(&Peer::new("p", "alice", "1.0"), &keys).unwrap();
        assert!(matches!(a.dht.put_value(&key, value.clone()).await, Err(Error::Network(_))));

        a.host
            .connect(&AddrInfo::new(b.host.id(), b.host.addrs()))
            .await
            .unwrap();
        assert!(matches!(a.dht.put_value(&key, b"junk".to_vec()).await, Err(Error::Validation(_))));
        a.dht.put_value(&key, value.clone()).await.unwrap();
        assert_eq!(b.dht.get_value(&key).await.unwrap(), value);
    }

    #[tokio::test]
    async fn unreachable_peers_refuse_and_drop_connections() {
        let net = MemoryNetwork::new();
        let a = net.build(config(Keypair::generate(), vec![])).await.unwrap();
        let b = net.build(config(Keypair::generate(), vec![])).await.unwrap();
        let b_info = AddrInfo::new(b.host.id(), b.host.addrs());

        a.host.connect(&b_info).await.unwrap();
        net.set_reachable(&b.host.id(), false);
        assert!(!a.host.is_connected(&b.host.id()));
        assert!(a.host.connect(&b_info).await.is_err());

        net.set_reachable(&b.host.id(), true);
        a.host.connect(&b_info).await.unwrap();
        assert_eq!(a.host.connected_peers(), vec![b.host.id()]);
    }

    #[tokio::test]
    async fn closed_nodes_leave_the_provider_index() {
        let net = MemoryNetwork::new();
        let a = net.build(config(Keypair::generate(), vec![])).await.unwrap();
        let b = net.build(config(Keypair::generate(), vec![])).await.unwrap();
        a.host
            .connect(&AddrInfo::new(b.host.id(), b.host.addrs()))
            .await
            .unwrap();

        let key = ContentKey::service();
        a.dht.provide(&key).await.unwrap();
        b.dht.provide(&key).await.unwrap();
        assert_eq!(a.dht.find_providers(&key).await.unwrap().len(), 2);

        b.host.close().await.unwrap();
        let providers = a.dht.find_providers(&key).await.unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].id, a.host.id());
        assert_eq!(net.node_count(), 1);
    }
}
