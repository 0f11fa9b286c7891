//! The native registry.
//!
//! [`NativeRegistry`] publishes registered peers into the DHT, answers
//! queries from the DHT and live connections, and keeps the node connected
//! through bootstrap refreshes, local discovery and NAT traversal upkeep.
//!
//! ```ignore
//! let registry = NativeRegistry::builder(RegistryOptions::default().with_discovery(true))
//!     .store(Arc::new(MemoryRecordStore::new()))
//!     .substrate(Arc::new(network))
//!     .keypair(Keypair::generate())
//!     .init()
//!     .await?;
//! registry.register(Peer::new("p1", "alice", "1.0"), RegisterOptions::default()).await?;
//! ```

mod builder;
pub mod global;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::BoxStream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

pub use builder::RegistryBuilder;

use crate::addr::{AddrInfo, PeerAddr};
use crate::bootstrap::BootstrapAggregator;
use crate::codec::{encode_peer, marshal_public_key, sign_peer, unmarshal_peer, verify_peer, RECORD_VERSION};
use crate::config::RegistryOptions;
use crate::discovery::{DiscoveryCallback, DiscoveryHub, DiscoveryStats, LocalDiscovery};
use crate::error::{with_timeout, Error, Result};
use crate::identity::{Keypair, PeerId};
use crate::keys::{peer_key, public_key_key, ContentKey};
use crate::peer::{Peer, META_ADDRESS, META_PEER_ID, META_REGISTER_TYPE, REGISTER_TYPE_CONNECTED, REGISTER_TYPE_DHT};
use crate::schedule::{spawn_periodic, Periodic};
use crate::store::{RecordStore, RegisterRecord};
use crate::substrate::{Dht, Host};
use crate::traversal::{TraversalAddresses, TraversalRefresher};

/// Deadline of DHT writes.
pub const PUT_TIMEOUT: Duration = Duration::from_secs(5);
/// Deadline of DHT reads and lookups.
pub const GET_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline of provider announcements.
pub const PROVIDE_TIMEOUT: Duration = Duration::from_secs(10);

/// Component name the registry subscribes to local discovery with.
pub const DISCOVERY_COMPONENT: &str = "registry";

/// Per-registration options.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Re-publish period. Defaults to the registry's `register_interval`.
    pub interval: Option<Duration>,
}

impl RegisterOptions {
    /// Override the re-publish period.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }
}

/// What [`NativeRegistry::get_peer`] looks up.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Describe the local node instead of querying the DHT.
    pub me: bool,
    /// Identity of the node whose record is fetched.
    pub name: String,
}

impl GetOptions {
    /// Describe the local node.
    pub fn me() -> Self {
        Self {
            me: true,
            name: String::new(),
        }
    }

    /// Fetch the record published by `name`.
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            me: false,
            name: name.into(),
        }
    }
}

/// Filters for [`NativeRegistry::list_peers`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Only return peers with this name.
    pub name: Option<String>,
}

/// Feeds bootstrap nodes seen by local discovery into the aggregator and
/// asks for an early DHT bootstrap when the list grew.
struct BootstrapFeed {
    aggregator: Arc<BootstrapAggregator>,
    trigger: Arc<Notify>,
}

#[async_trait]
impl DiscoveryCallback for BootstrapFeed {
    async fn on_peer_discovered(&self, info: &AddrInfo, is_bootstrap: bool) -> Result<()> {
        if is_bootstrap && self.aggregator.add_discovered(info) {
            debug!(peer = %info.id, "bootstrap list grew, refreshing dht early");
            self.trigger.notify_one();
        }
        Ok(())
    }
}

/// DHT-backed peer registry.
pub struct NativeRegistry {
    options: RegistryOptions,
    keypair: Keypair,
    store: Arc<dyn RecordStore>,
    host: Arc<dyn Host>,
    dht: Arc<dyn Dht>,
    aggregator: Arc<BootstrapAggregator>,
    hub: Arc<DiscoveryHub>,
    discovery: Option<Arc<LocalDiscovery>>,
    traversal: Option<Arc<TraversalRefresher>>,
    peers: RwLock<HashMap<String, Peer>>,
    loops: Mutex<HashMap<String, Periodic>>,
    bootstrap_task: Mutex<Option<Periodic>>,
    shutdown: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl NativeRegistry {
    /// Start configuring a registry.
    pub fn builder(options: RegistryOptions) -> RegistryBuilder {
        RegistryBuilder::new(options)
    }

    /// Identity of the local node.
    pub fn local_id(&self) -> PeerId {
        self.host.id()
    }

    /// Options the registry was built with.
    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Connection layer of the local node.
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    /// Local discovery statistics, when discovery runs.
    pub fn stats(&self) -> Option<DiscoveryStats> {
        self.discovery.as_ref().map(|d| d.stats())
    }

    /// The local discovery service, when enabled.
    pub fn discovery(&self) -> Option<&Arc<LocalDiscovery>> {
        self.discovery.as_ref()
    }

    /// Current bootstrap node list.
    pub fn bootstrap_nodes(&self) -> Vec<PeerAddr> {
        self.aggregator.addrs()
    }

    /// Latest NAT traversal addresses, when traversal runs.
    pub fn traversal_addresses(&self) -> Option<TraversalAddresses> {
        self.traversal.as_ref().map(|t| t.snapshot())
    }

    /// Ask the bootstrap loop for an immediate run.
    pub fn refresh_bootstrap(&self) {
        if let Some(task) = self.bootstrap_task.lock().as_ref() {
            task.run_now();
        }
    }

    /// Names of the peers registered on this node.
    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Register `peer` and keep re-publishing it. The first publish runs
    /// immediately in the background; registering the same name again
    /// replaces the previous schedule.
    pub async fn register(self: &Arc<Self>, mut peer: Peer, opts: RegisterOptions) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        peer.validate()?;
        peer.metadata
            .insert(META_PEER_ID.to_string(), self.host.id().to_string().into());

        let interval = opts.interval.unwrap_or(self.options.register_interval);
        self.peers.write().insert(peer.name.clone(), peer.clone());

        let weak = Arc::downgrade(self);
        let name = peer.name.clone();
        let task = spawn_periodic("register", interval, self.shutdown.subscribe(), move || {
            let weak = weak.clone();
            let peer = peer.clone();
            async move {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                match this.register_once(&peer).await {
                    Ok(true) => info!(peer = %peer.name, "registered peer"),
                    Ok(false) => debug!(peer = %peer.name, "registration stored locally, dht not ready"),
                    Err(e) => warn!(op = "register", peer = %peer.name, error = %e, "failed to register peer"),
                }
            }
        });

        let previous = self.loops.lock().insert(name.clone(), task);
        if let Some(previous) = previous {
            debug!(peer = %name, "replacing registration schedule");
            previous.stop().await;
        }
        Ok(())
    }

    /// One registration round: announce as provider, persist the row and,
    /// once the routing table is non-empty, publish the signed record.
    /// Returns whether the record reached the DHT.
    pub async fn register_once(&self, peer: &Peer) -> Result<bool> {
        let local = self.host.id();

        if let Err(e) = with_timeout("dht.provide", PROVIDE_TIMEOUT, self.dht.provide(&ContentKey::service())).await {
            warn!(op = "provide", error = %e, "failed to announce as provider");
        }

        let record = sign_peer(peer, &self.keypair)?;
        let now = Utc::now();
        let row = RegisterRecord {
            id: 0,
            peer_id: record.id.clone(),
            peer_name: record.name.clone(),
            local_network_id: local.to_string(),
            version: record.version.clone(),
            end_station: serde_json::to_string(&record.end_station)?,
            signature: hex::encode(&record.signature),
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = self.store.upsert(row).await {
            warn!(op = "store", peer = %peer.name, error = %e, "failed to persist registration");
        }

        if self.dht.routing_table_size() == 0 {
            debug!(peer = %peer.name, "routing table still empty, skipping dht publish");
            return Ok(false);
        }

        let value = encode_peer(&record)?;
        with_timeout("dht.put", PUT_TIMEOUT, self.dht.put_value(&peer_key(&local), value)).await?;
        with_timeout(
            "dht.put",
            PUT_TIMEOUT,
            self.dht.put_value(&public_key_key(&local), marshal_public_key(&local)?),
        )
        .await?;
        Ok(true)
    }

    /// Stop publishing `peer` and forget it. The host's record is then
    /// republished from a remaining registration, or overwritten with a
    /// tombstone when none is left. Unknown names are `NotFound`.
    pub async fn deregister(&self, peer: &Peer) -> Result<()> {
        let task = self.loops.lock().remove(&peer.name);
        let removed = self.peers.write().remove(&peer.name);
        if task.is_none() && removed.is_none() {
            return Err(Error::not_found(format!("peer {:?} is not registered", peer.name)));
        }
        if let Some(task) = task {
            task.stop().await;
        }

        let survivor = self.peers.read().values().next().cloned();
        if let Some(survivor) = survivor {
            self.register_once(&survivor).await?;
            info!(peer = %peer.name, republished = %survivor.name, "deregistered peer");
            return Ok(());
        }

        let key = peer_key(&self.host.id());
        with_timeout("dht.put", PUT_TIMEOUT, self.dht.put_value(&key, Vec::new())).await?;
        info!(peer = %peer.name, %key, "deregistered peer");
        Ok(())
    }

    /// Describe the local node, or fetch and verify the record published
    /// by another node.
    pub async fn get_peer(&self, opts: GetOptions) -> Result<Peer> {
        if opts.me {
            let local = self.host.id().to_string();
            let addrs: Vec<String> = self.host.addrs().iter().map(ToString::to_string).collect();
            return Ok(Peer::new(local.clone(), local, RECORD_VERSION).with_metadata(META_ADDRESS, addrs.join(",")));
        }

        let target: PeerId = opts
            .name
            .parse()
            .map_err(|e| Error::validation(format!("invalid peer identity {:?}: {e}", opts.name)))?;

        let found = with_timeout("dht.find_peer", GET_TIMEOUT, self.dht.find_peer(&target)).await?;
        debug!(peer = %target, addrs = found.addrs.len(), "resolved peer");

        let value = with_timeout("dht.get", GET_TIMEOUT, self.dht.get_value(&peer_key(&target))).await?;
        let mut peer = unmarshal_peer(&value)?;
        if self.options.verify_on_read {
            verify_peer(&peer, &target)?;
        }

        if let Some(traversal) = &self.traversal {
            for station in traversal.end_stations().await {
                peer.attach_station(station);
            }
        }
        Ok(peer)
    }

    /// Peers announced in the provider index, then peers only known from
    /// live connections.
    pub async fn list_peers(&self, opts: ListOptions) -> Result<Vec<Peer>> {
        let local = self.host.id();
        let bootstrap_ids = self.aggregator.peer_ids();
        let providers = with_timeout(
            "dht.find_providers",
            GET_TIMEOUT,
            self.dht.find_providers(&ContentKey::service()),
        )
        .await?;

        let mut seen: HashSet<PeerId> = HashSet::new();
        let mut peers = Vec::new();

        for provider in providers {
            if provider.id == local || bootstrap_ids.contains(&provider.id) || seen.contains(&provider.id) {
                continue;
            }
            let value = match with_timeout("dht.get", GET_TIMEOUT, self.dht.get_value(&peer_key(&provider.id))).await {
                Ok(value) => value,
                Err(e) => {
                    debug!(peer = %provider.id, error = %e, "provider has no record");
                    continue;
                }
            };
            let mut peer = match unmarshal_peer(&value) {
                Ok(peer) => peer,
                Err(e) => {
                    debug!(peer = %provider.id, error = %e, "skipping provider record");
                    continue;
                }
            };
            if self.options.verify_on_read {
                if let Err(e) = verify_peer(&peer, &provider.id) {
                    warn!(peer = %provider.id, error = %e, "skipping record with bad signature");
                    continue;
                }
            }
            peer.metadata
                .insert(META_REGISTER_TYPE.to_string(), REGISTER_TYPE_DHT.into());
            seen.insert(provider.id);
            peers.push(peer);
        }

        for id in self.host.connected_peers() {
            if id == local || seen.contains(&id) {
                continue;
            }
            let mut addrs: Vec<String> = self.host.peer_addrs(&id).iter().map(ToString::to_string).collect();
            addrs.sort();
            let name = id.to_string();
            peers.push(
                Peer::new(name.clone(), name, String::new())
                    .with_metadata(META_REGISTER_TYPE, REGISTER_TYPE_CONNECTED)
                    .with_metadata(META_ADDRESS, addrs),
            );
            seen.insert(id);
        }

        if let Some(name) = &opts.name {
            peers.retain(|p| &p.name == name);
        }
        Ok(peers)
    }

    /// Change notifications are not supported.
    pub fn watch(&self) -> Result<BoxStream<'static, Peer>> {
        Err(Error::NotImplemented("watch"))
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop every loop, detach from local discovery, stop traversal upkeep
    /// and shut the host down.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.shutdown.send(());

        let loops: Vec<Periodic> = self.loops.lock().drain().map(|(_, task)| task).collect();
        for task in loops {
            task.stop().await;
        }
        let bootstrap = self.bootstrap_task.lock().take();
        if let Some(task) = bootstrap {
            task.stop().await;
        }

        if self.discovery.is_some() {
            if let Err(e) = self.hub.detach(&self.host.id(), DISCOVERY_COMPONENT).await {
                warn!(error = %e, "failed to detach local discovery");
            }
        }
        if let Some(traversal) = &self.traversal {
            if let Err(e) = traversal.stop().await {
                warn!(error = %e, "failed to stop traversal upkeep");
            }
        }
        global::clear_if(self);

        let res = self.host.close().await;
        info!(peer = %self.host.id(), "native registry closed");
        res
    }
}

/// Spawn the DHT bootstrap loop: up to `retries` attempts per run, plus a
/// connection attempt to every configured relay.
pub(crate) fn spawn_bootstrap(
    host: Arc<dyn Host>,
    dht: Arc<dyn Dht>,
    options: &RegistryOptions,
    shutdown: broadcast::Receiver<()>,
) -> Periodic {
    let retries = options.bootstrap_retry_times.max(1);
    let relays: Vec<String> = options.relay_nodes.clone();
    info!(peer = %host.id(), "bootstrapping dht");

    spawn_periodic("dht-bootstrap", options.bootstrap_refresh_interval, shutdown, move || {
        let host = Arc::clone(&host);
        let dht = Arc::clone(&dht);
        let relays = relays.clone();
        async move {
            for attempt in 1..=retries {
                match dht.bootstrap().await {
                    Ok(()) => {
                        debug!(attempt, routing = dht.routing_table_size(), "dht bootstrap finished");
                        break;
                    }
                    Err(e) if attempt == retries => {
                        warn!(op = "bootstrap", attempt, error = %e, "dht bootstrap failed");
                    }
                    Err(e) => debug!(op = "bootstrap", attempt, error = %e, "dht bootstrap attempt failed"),
                }
            }
            connect_relays(host.as_ref(), &relays).await;
        }
    })
}

async fn connect_relays(host: &dyn Host, relays: &[String]) {
    let addrs = crate::bootstrap::aggregate(relays, &[]);
    let infos = match AddrInfo::from_p2p_addrs(addrs) {
        Ok(infos) => infos,
        Err(e) => {
            warn!(error = %e, "invalid relay list");
            return;
        }
    };
    for info in infos.iter().filter(|i| !host.is_connected(&i.id)) {
        match with_timeout("connect", GET_TIMEOUT, host.connect(info)).await {
            Ok(()) => info!(relay = %info.id, "connected to relay"),
            Err(e) => warn!(relay = %info.id, error = %e, "relay unreachable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::make_bootstrap_addr;
    use crate::discovery::{Advertisement, MemoryLan};
    use crate::store::MemoryRecordStore;
    use crate::substrate::memory::MemoryNetwork;
    use crate::traversal::client::tests::CountingDialer;
    use crate::config::TurnConfig;
    use crate::peer::StationType;
    use std::net::{IpAddr, Ipv4Addr};

    async fn node(net: &MemoryNetwork, options: RegistryOptions) -> Arc<NativeRegistry> {
        NativeRegistry::builder(options)
            .store(Arc::new(MemoryRecordStore::new()))
            .substrate(Arc::new(net.clone()))
            .keypair(Keypair::generate())
            .install_default(false)
            .init()
            .await
            .unwrap()
    }

    async fn seed(net: &MemoryNetwork) -> Arc<NativeRegistry> {
        node(
            net,
            RegistryOptions::default()
                .with_bootstrap(true)
                .with_bootstrap_listen_addrs(["/ip4/10.0.0.1/tcp/4001"]),
        )
        .await
    }

    fn seed_entry(seed: &NativeRegistry) -> String {
        make_bootstrap_addr("10.0.0.1", 4001, &seed.local_id())
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..100 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn init_requires_store_and_identity() {
        let net = MemoryNetwork::new();
        let err = NativeRegistry::builder(RegistryOptions::default())
            .substrate(Arc::new(net.clone()))
            .keypair(Keypair::generate())
            .init()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));

        let err = NativeRegistry::builder(RegistryOptions::default())
            .store(Arc::new(MemoryRecordStore::new()))
            .substrate(Arc::new(net))
            .init()
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn register_rejects_incomplete_peers() {
        let net = MemoryNetwork::new();
        let reg = node(&net, RegistryOptions::default()).await;
        let err = reg
            .register(Peer::new("", "alice", "1.0"), RegisterOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        reg.close().await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn register_publishes_only_with_routing() {
        let net = MemoryNetwork::new();
        let lonely = node(&net, RegistryOptions::default()).await;
        let peer = Peer::new("p1", "alice", "1.0");
        assert!(!lonely.register_once(&peer).await.unwrap());
        assert!(net.value(&peer_key(&lonely.local_id())).is_none());

        let seed = seed(&net).await;
        let member = node(&net, RegistryOptions::default().with_bootstrap_nodes([seed_entry(&seed)])).await;
        assert!(eventually(|| member.dht.routing_table_size() > 0).await);
        assert!(member.register_once(&peer).await.unwrap());

        let stored = unmarshal_peer(&net.value(&peer_key(&member.local_id())).unwrap()).unwrap();
        assert_eq!(stored.name, "alice");
        assert_eq!(stored.metadata_str(META_PEER_ID), None);
        assert!(net.value(&public_key_key(&member.local_id())).is_some());

        for reg in [lonely, seed, member] {
            reg.close().await.unwrap();
        }
    }

    #[test_log::test(tokio::test)]
    async fn register_list_get_deregister() {
        let net = MemoryNetwork::new();
        let seed = seed(&net).await;
        let opts = RegistryOptions::default().with_bootstrap_nodes([seed_entry(&seed)]);
        let alice = node(&net, opts.clone()).await;
        let bob = node(&net, opts).await;
        assert!(eventually(|| bob.dht.routing_table_size() > 0 && alice.dht.routing_table_size() > 0).await);

        alice
            .register(Peer::new("p1", "alice", "1.0"), RegisterOptions::default())
            .await
            .unwrap();
        let alice_id = alice.local_id().to_string();
        let mut visible = false;
        for _ in 0..100 {
            if bob.get_peer(GetOptions::by_name(alice_id.clone())).await.is_ok() {
                visible = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(visible);

        let fetched = bob.get_peer(GetOptions::by_name(alice_id.clone())).await.unwrap();
        assert_eq!(fetched.name, "alice");
        assert_eq!(fetched.metadata_str(META_PEER_ID), Some(alice_id.as_str()));

        let listed = bob.list_peers(ListOptions::default()).await.unwrap();
        let dht_entry = listed.iter().find(|p| p.name == "alice").unwrap();
        assert_eq!(dht_entry.metadata_str(META_REGISTER_TYPE), Some(REGISTER_TYPE_DHT));
        // the seed is connected but never announced
        let seed_id = seed.local_id().to_string();
        let connected = listed.iter().find(|p| p.name == seed_id).unwrap();
        assert_eq!(connected.metadata_str(META_REGISTER_TYPE), Some(REGISTER_TYPE_CONNECTED));
        assert!(connected.metadata[META_ADDRESS].is_array());

        let only_alice = bob
            .list_peers(ListOptions {
                name: Some("alice".into()),
            })
            .await
            .unwrap();
        assert_eq!(only_alice.len(), 1);

        alice.deregister(&Peer::new("p1", "alice", "1.0")).await.unwrap();
        assert!(alice.registered().is_empty());
        let err = bob.get_peer(GetOptions::by_name(alice_id)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(bob
            .list_peers(ListOptions::default())
            .await
            .unwrap()
            .iter()
            .all(|p| p.name != "alice"));

        for reg in [alice, bob, seed] {
            reg.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn deregister_leaves_other_registrations_published() {
        let net = MemoryNetwork::new();
        let seed = seed(&net).await;
        let opts = RegistryOptions::default().with_bootstrap_nodes([seed_entry(&seed)]);
        let alice = node(&net, opts.clone()).await;
        let bob = node(&net, opts).await;
        assert!(eventually(|| bob.dht.routing_table_size() > 0 && alice.dht.routing_table_size() > 0).await);

        alice
            .register(Peer::new("p1", "alice", "1.0"), RegisterOptions::default())
            .await
            .unwrap();
        let alice_id = alice.local_id().to_string();
        let mut visible = false;
        for _ in 0..100 {
            if bob.get_peer(GetOptions::by_name(alice_id.clone())).await.is_ok() {
                visible = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(visible);

        let err = alice
            .deregister(&Peer::new("p9", "never-registered", "1.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let fetched = bob.get_peer(GetOptions::by_name(alice_id.clone())).await.unwrap();
        assert_eq!(fetched.name, "alice");

        alice
            .register(Peer::new("p2", "alice-sidecar", "1.0"), RegisterOptions::default())
            .await
            .unwrap();
        alice.deregister(&Peer::new("p2", "alice-sidecar", "1.0")).await.unwrap();
        assert_eq!(alice.registered(), vec!["alice".to_string()]);
        let fetched = bob.get_peer(GetOptions::by_name(alice_id.clone())).await.unwrap();
        assert_eq!(fetched.name, "alice");

        alice.deregister(&Peer::new("p1", "alice", "1.0")).await.unwrap();
        let err = bob.get_peer(GetOptions::by_name(alice_id)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        for reg in [alice, bob, seed] {
            reg.close().await.unwrap();
        }
    }

    #[tokio::test]
    async fn get_me_reports_live_addresses() {
        let net = MemoryNetwork::new();
        let reg = seed(&net).await;
        let me = reg.get_peer(GetOptions::me()).await.unwrap();
        assert_eq!(me.id, reg.local_id().to_string());
        assert_eq!(me.metadata_str(META_ADDRESS), Some("/ip4/10.0.0.1/tcp/4001"));
        reg.close().await.unwrap();
    }

    #[tokio::test]
    async fn get_rejects_bad_identity_and_watch_is_unsupported() {
        let net = MemoryNetwork::new();
        let reg = node(&net, RegistryOptions::default()).await;
        let err = reg.get_peer(GetOptions::by_name("not-a-peer")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(matches!(reg.watch(), Err(Error::NotImplemented("watch"))));
        reg.close().await.unwrap();
    }

    #[tokio::test]
    async fn get_attaches_traversal_stations() {
        let net = MemoryNetwork::new();
        let seed = seed(&net).await;
        let turn = TurnConfig {
            enabled: true,
            ..TurnConfig::default()
        };
        let reg = NativeRegistry::builder(
            RegistryOptions::default()
                .with_bootstrap_nodes([seed_entry(&seed)])
                .with_turn(turn),
        )
        .store(Arc::new(MemoryRecordStore::new()))
        .substrate(Arc::new(net.clone()))
        .keypair(Keypair::generate())
        .traversal_dialer(Arc::new(CountingDialer::default()))
        .install_default(false)
        .init()
        .await
        .unwrap();
        assert!(eventually(|| reg.dht.routing_table_size() > 0).await);
        assert!(reg.register_once(&Peer::new("p1", "alice", "1.0")).await.unwrap());

        let peer = reg
            .get_peer(GetOptions::by_name(reg.local_id().to_string()))
            .await
            .unwrap();
        assert_eq!(peer.end_station[StationType::TurnRelay.as_str()].net_address, "203.0.113.5:49152");
        assert_eq!(peer.end_station[StationType::Stun.as_str()].net_address, "198.51.100.7:50000");
        assert!(reg.traversal_addresses().unwrap().relay.is_some());

        reg.close().await.unwrap();
        seed.close().await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn discovered_bootstrap_nodes_join_the_aggregate() {
        let net = MemoryNetwork::new();
        let lan = MemoryLan::new();
        let seed = seed(&net).await;
        lan.announce(
            Advertisement::for_host(seed.local_id(), "registry", &seed.host().addrs()),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        );

        let reg = NativeRegistry::builder(RegistryOptions::default().with_discovery(true))
            .store(Arc::new(MemoryRecordStore::new()))
            .substrate(Arc::new(net.clone()))
            .broadcaster(Arc::new(lan.broadcaster(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)))))
            .keypair(Keypair::generate())
            .install_default(false)
            .init()
            .await
            .unwrap();

        assert!(eventually(|| reg.stats().unwrap().connected_bootstrap == 1).await);
        let nodes = reg.bootstrap_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].peer(), Some(seed.local_id()));
        assert!(eventually(|| reg.dht.routing_table_size() > 0).await);

        // the seed is a bootstrap node, so it is never listed from the provider index
        seed.register_once(&Peer::new("s", "seed", "1.0")).await.unwrap();
        let listed = reg.list_peers(ListOptions::default()).await.unwrap();
        assert!(listed
            .iter()
            .all(|p| p.metadata_str(META_REGISTER_TYPE) == Some(REGISTER_TYPE_CONNECTED)));

        reg.close().await.unwrap();
        assert_eq!(lan.len(), 1);
        seed.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_new_registrations() {
        let net = MemoryNetwork::new();
        let reg = node(&net, RegistryOptions::default()).await;
        reg.register(Peer::new("p1", "alice", "1.0"), RegisterOptions::default())
            .await
            .unwrap();
        assert_eq!(reg.registered(), vec!["alice".to_string()]);
        reg.close().await.unwrap();
        reg.close().await.unwrap();
        assert!(reg.is_closed());
        assert_eq!(net.node_count(), 0);
        let err = reg
            .register(Peer::new("p2", "bob", "1.0"), RegisterOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed));
    }
}
