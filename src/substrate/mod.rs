//! Networking substrate seam.
//!
//! The registry never talks to sockets directly for the overlay. It drives a
//! [`Host`] (identity, addresses, connections) and a [`Dht`] (values,
//! provider index, routing) built by a [`Substrate`]. The in-process
//! [`memory::MemoryNetwork`] implements all three for tests and
//! simulations; [`swarm::SwarmSubstrate`] joins a real libp2p overlay.

pub mod memory;
pub mod swarm;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::addr::{AddrInfo, PeerAddr};
use crate::error::Result;
use crate::identity::{Keypair, PeerId};
use crate::keys::ContentKey;
use crate::validator::Validator;

/// DHT participation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Decide based on observed reachability.
    #[default]
    Auto,
    /// Query only; never serve records.
    Client,
    /// Always serve records.
    Server,
    /// Start as a server and fall back to client when unreachable.
    AutoServer,
}

impl RunMode {
    /// Whether this mode answers DHT queries from other peers.
    pub fn serves_records(self) -> bool {
        !matches!(self, RunMode::Client)
    }
}

/// Supplies the current bootstrap peers; evaluated on every bootstrap run.
pub type BootstrapPeersFn = Arc<dyn Fn() -> Vec<AddrInfo> + Send + Sync>;

/// Everything a substrate needs to build a node.
#[derive(Clone)]
pub struct SubstrateConfig {
    /// Node identity.
    pub keypair: Keypair,
    /// Addresses to listen on. Empty lets the substrate choose.
    pub listen_addrs: Vec<PeerAddr>,
    /// DHT participation mode.
    pub run_mode: RunMode,
    /// Validator applied to every stored value.
    pub validator: Arc<dyn Validator>,
    /// DHT protocol prefix.
    pub protocol_prefix: String,
    /// Routing bucket size.
    pub bucket_size: usize,
    /// Bootstrap peer supplier.
    pub bootstrap_peers: BootstrapPeersFn,
}

impl fmt::Debug for SubstrateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubstrateConfig")
            .field("peer_id", &self.keypair.peer_id())
            .field("listen_addrs", &self.listen_addrs)
            .field("run_mode", &self.run_mode)
            .field("protocol_prefix", &self.protocol_prefix)
            .field("bucket_size", &self.bucket_size)
            .finish_non_exhaustive()
    }
}

/// A node's connection layer.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    /// Local identity.
    fn id(&self) -> PeerId;

    /// Addresses the node is reachable on.
    fn addrs(&self) -> Vec<PeerAddr>;

    /// Open a connection to `peer`.
    async fn connect(&self, peer: &AddrInfo) -> Result<()>;

    /// Whether a live connection to `peer` exists.
    fn is_connected(&self, peer: &PeerId) -> bool;

    /// All peers with a live connection.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Addresses known for `peer`.
    fn peer_addrs(&self, peer: &PeerId) -> Vec<PeerAddr>;

    /// Drop all connections and stop listening.
    async fn close(&self) -> Result<()>;
}

/// A node's view of the distributed hash table.
#[async_trait]
pub trait Dht: Send + Sync + 'static {
    /// Connect to the supplied bootstrap peers and refresh routing.
    async fn bootstrap(&self) -> Result<()>;

    /// Store `value` under `key` after validation.
    async fn put_value(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Fetch the value under `key`.
    async fn get_value(&self, key: &str) -> Result<Vec<u8>>;

    /// Announce this node as a provider of `key`.
    async fn provide(&self, key: &ContentKey) -> Result<()>;

    /// Peers providing `key`.
    async fn find_providers(&self, key: &ContentKey) -> Result<Vec<AddrInfo>>;

    /// Resolve addresses of `peer`.
    async fn find_peer(&self, peer: &PeerId) -> Result<AddrInfo>;

    /// Number of peers in the routing table.
    fn routing_table_size(&self) -> usize;
}

/// A built node.
#[derive(Clone)]
pub struct SubstrateNode {
    /// Connection layer.
    pub host: Arc<dyn Host>,
    /// DHT view.
    pub dht: Arc<dyn Dht>,
}

/// Builds [`SubstrateNode`]s.
#[async_trait]
pub trait Substrate: Send + Sync + 'static {
    /// Build a node for `config`.
    async fn build(&self, config: SubstrateConfig) -> Result<SubstrateNode>;
}
