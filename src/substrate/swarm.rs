//! libp2p substrate.
//!
//! [`SwarmSubstrate`] builds real overlay nodes: TCP with noise and yamux,
//! a Kademlia DHT under the configured protocol prefix and identify for
//! address exchange. One task owns the swarm; the [`Host`] and [`Dht`]
//! handles talk to it over a command channel and read connection state
//! from a shared snapshot the task keeps current.
//!
//! Inbound records are filtered through the node's [`Validator`] before
//! they reach the local store.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use libp2p::core::ConnectedPoint;
use libp2p::kad::store::RecordStore as _;
use libp2p::multiaddr::Multiaddr;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{DialError, SwarmEvent};
use libp2p::{identify, kad, noise, tcp, yamux, StreamProtocol, Swarm};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::{BootstrapPeersFn, Dht, Host, RunMode, Substrate, SubstrateConfig, SubstrateNode};
use crate::addr::{AddrInfo, PeerAddr};
use crate::error::{with_timeout, Error, Result};
use crate::identity::PeerId;
use crate::keys::ContentKey;
use crate::validator::Validator;

/// Listen address used when the config names none.
pub const DEFAULT_LISTEN_ADDR: &str = "/ip4/0.0.0.0/tcp/0";

const COMMAND_BUFFER: usize = 64;

mod behaviour {
    use libp2p::swarm::NetworkBehaviour;
    use libp2p::{identify, kad};

    #[derive(NetworkBehaviour)]
    pub(super) struct Behaviour {
        pub(super) kad: kad::Behaviour<kad::store::MemoryStore>,
        pub(super) identify: identify::Behaviour,
    }
}
use behaviour::{Behaviour, BehaviourEvent};

/// Builds libp2p nodes.
#[derive(Debug, Clone)]
pub struct SwarmSubstrate {
    query_timeout: Duration,
    idle_timeout: Duration,
    listen_timeout: Duration,
}

impl Default for SwarmSubstrate {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            listen_timeout: Duration::from_secs(5),
        }
    }
}

impl SwarmSubstrate {
    /// Substrate with default timeouts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Upper bound for a single DHT query.
    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// How long a connection without open streams stays up.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    fn behaviour(
        &self,
        key: &libp2p::identity::Keypair,
        config: &SubstrateConfig,
    ) -> Result<(Behaviour, StreamProtocol)> {
        let local = key.public().to_peer_id();
        let protocol = StreamProtocol::try_from_owned(format!("{}/kad/1.0.0", config.protocol_prefix))
            .map_err(|e| Error::config(format!("invalid protocol prefix {:?}: {e}", config.protocol_prefix)))?;
        let replication = NonZeroUsize::new(config.bucket_size)
            .ok_or_else(|| Error::config("bucket size must be positive"))?;

        let mut kad_config = kad::Config::new(protocol.clone());
        kad_config
            .set_query_timeout(self.query_timeout)
            .set_replication_factor(replication)
            .set_record_filtering(kad::StoreInserts::FilterBoth);
        let mut kad = kad::Behaviour::with_config(local, kad::store::MemoryStore::new(local), kad_config);
        kad.set_mode(match config.run_mode {
            RunMode::Client => Some(kad::Mode::Client),
            RunMode::Server | RunMode::AutoServer => Some(kad::Mode::Server),
            RunMode::Auto => None,
        });

        let identify = identify::Behaviour::new(
            identify::Config::new(format!("{}/id/1.0.0", config.protocol_prefix), key.public())
                .with_agent_version(format!("peer-registry/{}", env!("CARGO_PKG_VERSION"))),
        );
        Ok((Behaviour { kad, identify }, protocol))
    }
}

#[async_trait]
impl Substrate for SwarmSubstrate {
    async fn build(&self, config: SubstrateConfig) -> Result<SubstrateNode> {
        let id = config.keypair.peer_id();
        let key = config.keypair.to_libp2p()?;
        let (behaviour, kad_protocol) = self.behaviour(&key, &config)?;

        let idle = self.idle_timeout;
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(key)
            .with_tokio()
            .with_tcp(tcp::Config::default().nodelay(true), noise::Config::new, yamux::Config::default)
            .map_err(|e| Error::config(format!("tcp transport: {e}")))?
            .with_behaviour(|_key| behaviour)
            .map_err(|e| Error::config(format!("swarm behaviour: {e:?}")))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(idle))
            .build();

        let listen: Vec<Multiaddr> = if config.listen_addrs.is_empty() {
            vec![DEFAULT_LISTEN_ADDR
                .parse()
                .map_err(|e| Error::config(format!("default listen address: {e}")))?]
        } else {
            config
                .listen_addrs
                .iter()
                .map(|a| a.clone().without_peer().into())
                .collect()
        };
        for addr in listen {
            swarm
                .listen_on(addr.clone())
                .map_err(|e| Error::config(format!("cannot listen on {addr}: {e}")))?;
        }

        let shared = Arc::new(RwLock::new(Shared::default()));
        let first = with_timeout("listen", self.listen_timeout, async {
            loop {
                match swarm.select_next_some().await {
                    SwarmEvent::NewListenAddr { address, .. } => return Ok(address),
                    SwarmEvent::ListenerError { error, .. } => return Err(Error::network(format!("listener failed: {error}"))),
                    SwarmEvent::ListenerClosed { reason: Err(error), .. } => {
                        return Err(Error::network(format!("listener closed: {error}")))
                    }
                    _ => {}
                }
            }
        })
        .await?;
        shared.write().add_listen(&first);

        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);
        let event_loop = EventLoop {
            swarm,
            commands: rx,
            shared: Arc::clone(&shared),
            validator: Arc::clone(&config.validator),
            kad_protocol,
            queries: HashMap::new(),
            dials: HashMap::new(),
        };
        let task = tokio::spawn(event_loop.run());
        info!(%id, addrs = ?shared.read().listen, run_mode = ?config.run_mode, "swarm node online");

        let node = Arc::new(SwarmNode {
            id,
            commands,
            shared,
            validator: config.validator,
            bootstrap_peers: config.bootstrap_peers,
            task: Mutex::new(Some(task)),
        });
        Ok(SubstrateNode {
            host: node.clone(),
            dht: node,
        })
    }
}

/// State the event loop publishes for the synchronous accessors.
#[derive(Default)]
struct Shared {
    listen: Vec<PeerAddr>,
    connected: HashSet<PeerId>,
    known: HashMap<PeerId, Vec<PeerAddr>>,
    routing: usize,
}

impl Shared {
    fn add_listen(&mut self, addr: &Multiaddr) {
        match PeerAddr::from_multiaddr(addr.clone()) {
            Ok(addr) if !self.listen.contains(&addr) => self.listen.push(addr),
            Ok(_) => {}
            Err(e) => trace!(%addr, error = %e, "ignoring listen address"),
        }
    }

    fn learn(&mut self, peer: &libp2p::PeerId, addr: &Multiaddr) {
        let (Ok(id), Ok(addr)) = (PeerId::from_libp2p(peer), PeerAddr::from_multiaddr(addr.clone())) else {
            return;
        };
        let addr = addr.without_peer();
        let known = self.known.entry(id).or_default();
        if !known.contains(&addr) {
            known.push(addr);
        }
    }

    fn addr_info(&self, id: &PeerId) -> Option<AddrInfo> {
        self.known
            .get(id)
            .filter(|addrs| !addrs.is_empty())
            .map(|addrs| AddrInfo::new(*id, addrs.iter().cloned()))
    }
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Dial {
        peer: libp2p::PeerId,
        addrs: Vec<Multiaddr>,
        reply: Reply<()>,
    },
    Bootstrap {
        peers: Vec<(libp2p::PeerId, Vec<Multiaddr>)>,
        reply: Reply<()>,
    },
    PutRecord {
        key: kad::RecordKey,
        value: Vec<u8>,
        reply: Reply<()>,
    },
    GetRecord {
        key: kad::RecordKey,
        reply: Reply<Vec<u8>>,
    },
    StartProviding {
        key: kad::RecordKey,
        reply: Reply<()>,
    },
    GetProviders {
        key: kad::RecordKey,
        reply: Reply<Vec<libp2p::PeerId>>,
    },
    FindPeer {
        peer: libp2p::PeerId,
        reply: Reply<()>,
    },
    Shutdown,
}

enum Pending {
    Bootstrap(Reply<()>),
    Put(Reply<()>),
    Get(String, Reply<Vec<u8>>),
    Provide(Reply<()>),
    Providers(Reply<Vec<libp2p::PeerId>>),
    Closest(Reply<()>),
}

struct EventLoop {
    swarm: Swarm<Behaviour>,
    commands: mpsc::Receiver<Command>,
    shared: Arc<RwLock<Shared>>,
    validator: Arc<dyn Validator>,
    kad_protocol: StreamProtocol,
    queries: HashMap<kad::QueryId, Pending>,
    dials: HashMap<libp2p::PeerId, Vec<Reply<()>>>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                event = self.swarm.select_next_some() => {
                    self.handle_event(event);
                    self.sync_routing();
                }
            }
        }

        let mut shared = self.shared.write();
        shared.connected.clear();
        shared.listen.clear();
        shared.routing = 0;
        debug!(peer = %self.swarm.local_peer_id(), "swarm event loop stopped");
    }

    fn sync_routing(&mut self) {
        let routing: usize = self.swarm.behaviour_mut().kad.kbuckets().map(|b| b.num_entries()).sum();
        self.shared.write().routing = routing;
    }

    fn handle_command(&mut self, cmd: Command) {
        let kad = &mut self.swarm.behaviour_mut().kad;
        match cmd {
            Command::Dial { peer, addrs, reply } => {
                if self.swarm.is_connected(&peer) {
                    let _ = reply.send(Ok(()));
                    return;
                }
                match self.swarm.dial(DialOpts::peer_id(peer).addresses(addrs).build()) {
                    Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
                        self.dials.entry(peer).or_default().push(reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(Error::network(format!("dial {peer}: {e}"))));
                    }
                }
            }
            Command::Bootstrap { peers, reply } => {
                for (peer, addrs) in &peers {
                    for addr in addrs {
                        kad.add_address(peer, addr.clone());
                    }
                }
                match kad.bootstrap() {
                    Ok(id) => {
                        self.queries.insert(id, Pending::Bootstrap(reply));
                    }
                    Err(_) if peers.is_empty() => {
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(Error::network(format!("bootstrap: {e:?}"))));
                    }
                }
            }
            Command::PutRecord { key, value, reply } => {
                match kad.put_record(kad::Record::new(key, value), kad::Quorum::One) {
                    Ok(id) => {
                        self.queries.insert(id, Pending::Put(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(Error::store(format!("local record store: {e}"))));
                    }
                }
            }
            Command::GetRecord { key, reply } => {
                let name = String::from_utf8_lossy(key.as_ref()).into_owned();
                let id = kad.get_record(key);
                self.queries.insert(id, Pending::Get(name, reply));
            }
            Command::StartProviding { key, reply } => match kad.start_providing(key) {
                Ok(id) => {
                    self.queries.insert(id, Pending::Provide(reply));
                }
                Err(e) => {
                    let _ = reply.send(Err(Error::store(format!("local provider store: {e}"))));
                }
            },
            Command::GetProviders { key, reply } => {
                let id = kad.get_providers(key);
                self.queries.insert(id, Pending::Providers(reply));
            }
            Command::FindPeer { peer, reply } => {
                let id = kad.get_closest_peers(peer);
                self.queries.insert(id, Pending::Closest(reply));
            }
            Command::Shutdown => {}
        }
    }

    fn handle_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                debug!(%address, "listening");
                self.shared.write().add_listen(&address);
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                if let Ok(addr) = PeerAddr::from_multiaddr(address) {
                    self.shared.write().listen.retain(|a| *a != addr);
                }
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                trace!(peer = %peer_id, "connection established");
                if let ConnectedPoint::Dialer { address, .. } = &endpoint {
                    self.swarm.behaviour_mut().kad.add_address(&peer_id, address.clone());
                    self.shared.write().learn(&peer_id, address);
                }
                if let Ok(id) = PeerId::from_libp2p(&peer_id) {
                    self.shared.write().connected.insert(id);
                }
                for reply in self.dials.remove(&peer_id).unwrap_or_default() {
                    let _ = reply.send(Ok(()));
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id, num_established, ..
            } => {
                if num_established == 0 {
                    if let Ok(id) = PeerId::from_libp2p(&peer_id) {
                        self.shared.write().connected.remove(&id);
                    }
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                if self.swarm.is_connected(&peer_id) {
                    return;
                }
                let replies = self.dials.remove(&peer_id).unwrap_or_default();
                if !replies.is_empty() {
                    debug!(peer = %peer_id, %error, "dial failed");
                }
                for reply in replies {
                    let _ = reply.send(Err(Error::network(format!("dial {peer_id}: {error}"))));
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. })) => {
                let serves = info.protocols.contains(&self.kad_protocol);
                for addr in &info.listen_addrs {
                    self.shared.write().learn(&peer_id, addr);
                    if serves {
                        self.swarm.behaviour_mut().kad.add_address(&peer_id, addr.clone());
                    }
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Kad(event)) => self.handle_kad(event),
            _ => {}
        }
    }

    fn handle_kad(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated { peer, addresses, .. } => {
                let mut shared = self.shared.write();
                for addr in addresses.iter() {
                    shared.learn(&peer, addr);
                }
            }
            kad::Event::InboundRequest { request } => self.handle_inbound(request),
            kad::Event::OutboundQueryProgressed { id, result, .. } => self.handle_query(id, result),
            _ => {}
        }
    }

    fn handle_inbound(&mut self, request: kad::InboundRequest) {
        match request {
            kad::InboundRequest::PutRecord {
                source,
                record: Some(record),
                ..
            } => {
                let key = String::from_utf8_lossy(record.key.as_ref()).into_owned();
                if let Err(e) = self.validator.validate(&key, &record.value) {
                    debug!(%source, key, error = %e, "rejected inbound record");
                    return;
                }
                if let Err(e) = self.swarm.behaviour_mut().kad.store_mut().put(record) {
                    warn!(%source, key, error = %e, "failed to store inbound record");
                }
            }
            kad::InboundRequest::AddProvider { record: Some(record) } => {
                if let Err(e) = self.swarm.behaviour_mut().kad.store_mut().add_provider(record) {
                    warn!(error = %e, "failed to store provider record");
                }
            }
            _ => {}
        }
    }

    fn handle_query(&mut self, id: kad::QueryId, result: kad::QueryResult) {
        let Some(pending) = self.queries.remove(&id) else {
            return;
        };
        match (pending, result) {
            (Pending::Bootstrap(reply), kad::QueryResult::Bootstrap(res)) => {
                // failed seeds stay in the routing table, so count live connections
                self.sync_routing();
                let res = if self.swarm.connected_peers().next().is_some() {
                    Ok(())
                } else {
                    Err(Error::network(format!("bootstrap reached no peers: {res:?}")))
                };
                let _ = reply.send(res);
            }
            (Pending::Put(reply), kad::QueryResult::PutRecord(res)) => {
                let _ = reply.send(res.map(|_| ()).map_err(|e| Error::network(format!("put record: {e:?}"))));
            }
            (Pending::Get(key, reply), kad::QueryResult::GetRecord(res)) => match res {
                Ok(kad::GetRecordOk::FoundRecord(found)) => {
                    let value = found.record.value;
                    if let Err(e) = self.validator.validate(&key, &value) {
                        debug!(key, error = %e, "discarding invalid record");
                        self.queries.insert(id, Pending::Get(key, reply));
                        return;
                    }
                    if let Some(mut query) = self.swarm.behaviour_mut().kad.query_mut(&id) {
                        query.finish();
                    }
                    let _ = reply.send(Ok(value));
                }
                Ok(kad::GetRecordOk::FinishedWithNoAdditionalRecord { .. }) => {
                    let _ = reply.send(Err(Error::not_found(format!("no value under {key}"))));
                }
                Err(e) => {
                    let _ = reply.send(Err(Error::not_found(format!("no value under {key}: {e:?}"))));
                }
            },
            (Pending::Provide(reply), kad::QueryResult::StartProviding(res)) => {
                let _ = reply.send(res.map(|_| ()).map_err(|e| Error::network(format!("provide: {e:?}"))));
            }
            (Pending::Providers(reply), kad::QueryResult::GetProviders(res)) => {
                let providers = match res {
                    Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                        if let Some(mut query) = self.swarm.behaviour_mut().kad.query_mut(&id) {
                            query.finish();
                        }
                        providers.into_iter().collect()
                    }
                    Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => Vec::new(),
                    Err(e) => {
                        debug!(error = ?e, "provider lookup failed");
                        Vec::new()
                    }
                };
                let _ = reply.send(Ok(providers));
            }
            (Pending::Closest(reply), kad::QueryResult::GetClosestPeers(_)) => {
                let _ = reply.send(Ok(()));
            }
            (pending, _) => {
                self.queries.insert(id, pending);
            }
        }
    }
}

/// One libp2p node; serves as both [`Host`] and [`Dht`].
pub struct SwarmNode {
    id: PeerId,
    commands: mpsc::Sender<Command>,
    shared: Arc<RwLock<Shared>>,
    validator: Arc<dyn Validator>,
    bootstrap_peers: BootstrapPeersFn,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SwarmNode {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    fn require_routing(&self, op: &str) -> Result<()> {
        if self.routing_table_size() == 0 {
            return Err(Error::network(format!("{op}: no peers in routing table")));
        }
        Ok(())
    }
}

#[async_trait]
impl Host for SwarmNode {
    fn id(&self) -> PeerId {
        self.id
    }

    fn addrs(&self) -> Vec<PeerAddr> {
        self.shared.read().listen.clone()
    }

    async fn connect(&self, peer: &AddrInfo) -> Result<()> {
        if peer.id == self.id {
            return Err(Error::validation("cannot connect to self"));
        }
        if self.is_connected(&peer.id) {
            return Ok(());
        }
        let addrs = peer.addrs.iter().map(|a| a.as_multiaddr().clone()).collect();
        self.request(|reply| Command::Dial {
            peer: peer.id.to_libp2p(),
            addrs,
            reply,
        })
        .await
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.shared.read().connected.contains(peer)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.shared.read().connected.iter().copied().collect();
        peers.sort();
        peers
    }

    fn peer_addrs(&self, peer: &PeerId) -> Vec<PeerAddr> {
        self.shared.read().known.get(peer).cloned().unwrap_or_default()
    }

    async fn close(&self) -> Result<()> {
        let Some(task) = self.task.lock().take() else {
            return Ok(());
        };
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = task.await {
            warn!(id = %self.id, error = %e, "swarm task ended abnormally");
        }
        debug!(id = %self.id, "swarm node offline");
        Ok(())
    }
}

#[async_trait]
impl Dht for SwarmNode {
    async fn bootstrap(&self) -> Result<()> {
        let peers: Vec<(libp2p::PeerId, Vec<Multiaddr>)> = (self.bootstrap_peers)()
            .into_iter()
            .filter(|p| p.id != self.id)
            .map(|p| {
                let addrs = p.addrs.iter().map(|a| a.as_multiaddr().clone()).collect();
                (p.id.to_libp2p(), addrs)
            })
            .collect();
        let tried = peers.len();
        self.request(|reply| Command::Bootstrap { peers, reply }).await?;
        debug!(id = %self.id, tried, routing = self.routing_table_size(), "bootstrap finished");
        Ok(())
    }

    async fn put_value(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.validator.validate(key, &value)?;
        self.require_routing("put_value")?;
        let key = kad::RecordKey::new(&key);
        self.request(|reply| Command::PutRecord { key, value, reply }).await
    }

    async fn get_value(&self, key: &str) -> Result<Vec<u8>> {
        let key = kad::RecordKey::new(&key);
        self.request(|reply| Command::GetRecord { key, reply }).await
    }

    async fn provide(&self, key: &ContentKey) -> Result<()> {
        self.require_routing("provide")?;
        let key = kad::RecordKey::new(key.as_bytes());
        self.request(|reply| Command::StartProviding { key, reply }).await
    }

    async fn find_providers(&self, key: &ContentKey) -> Result<Vec<AddrInfo>> {
        let key = kad::RecordKey::new(key.as_bytes());
        let providers = self.request(|reply| Command::GetProviders { key, reply }).await?;
        let shared = self.shared.read();
        Ok(providers
            .iter()
            .filter_map(|p| PeerId::from_libp2p(p).ok())
            .map(|id| {
                shared
                    .addr_info(&id)
                    .unwrap_or_else(|| AddrInfo::new(id, Vec::new()))
            })
            .collect())
    }

    async fn find_peer(&self, peer: &PeerId) -> Result<AddrInfo> {
        if *peer == self.id {
            return Ok(AddrInfo::new(self.id, self.addrs()));
        }
        if let Some(info) = self.shared.read().addr_info(peer) {
            return Ok(info);
        }
        self.request(|reply| Command::FindPeer {
            peer: peer.to_libp2p(),
            reply,
        })
        .await?;
        self.shared
            .read()
            .addr_info(peer)
            .ok_or_else(|| Error::not_found(format!("peer {peer} not found")))
    }

    fn routing_table_size(&self) -> usize {
        self.shared.read().routing
    }
}
