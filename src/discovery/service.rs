//! The local discovery service.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::announce::{is_likely_bootstrap, Advertisement, Announcement};
use super::broadcaster::Broadcaster;
use super::events::{DiscoveryCallback, DiscoveryEvent, EventBus};
use super::table::{DiscoveredPeer, DiscoveryStats, PeerTable, Sighting};
use crate::addr::AddrInfo;
use crate::config::DiscoveryConfig;
use crate::error::{with_timeout, Error, Result};
use crate::identity::PeerId;
use crate::schedule::{spawn_periodic, Periodic};
use crate::substrate::Host;

/// Finds peers on the local network and keeps bootstrap peers connected.
///
/// One instance serves every component attached to the same host; see
/// [`DiscoveryHub`](super::DiscoveryHub).
pub struct LocalDiscovery {
    host: Arc<dyn Host>,
    broadcaster: Arc<dyn Broadcaster>,
    config: DiscoveryConfig,
    instance_component: String,
    table: Mutex<PeerTable>,
    dialing: Mutex<HashSet<PeerId>>,
    bus: EventBus,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<Periodic>>,
    fast_refresh: Mutex<Option<Periodic>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl LocalDiscovery {
    /// Create a stopped service. `component` names the advertised instance.
    pub fn new(
        host: Arc<dyn Host>,
        broadcaster: Arc<dyn Broadcaster>,
        config: DiscoveryConfig,
        component: &str,
    ) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            host,
            broadcaster,
            table: Mutex::new(PeerTable::new(config.stale_after)),
            config,
            instance_component: component.to_string(),
            dialing: Mutex::new(HashSet::new()),
            bus: EventBus::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            fast_refresh: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Identity of the host this service runs for.
    pub fn local_id(&self) -> PeerId {
        self.host.id()
    }

    /// Advertise the host and spawn the query and health-refresh loops.
    /// Calling it again is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let ad = Advertisement::for_host(self.host.id(), &self.instance_component, &self.host.addrs());
        if let Err(e) = self.broadcaster.advertise(&ad).await {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        info!(
            instance = %ad.instance,
            port = ad.port,
            backend = self.broadcaster.name(),
            "local discovery started"
        );

        let query = {
            let this = Arc::clone(self);
            spawn_periodic(
                "discovery-query",
                self.config.query_interval,
                self.shutdown.subscribe(),
                move || {
                    let this = Arc::clone(&this);
                    async move { this.query_once().await }
                },
            )
        };
        let refresh = {
            let this = Arc::clone(self);
            spawn_periodic(
                "discovery-refresh",
                self.config.refresh_interval,
                self.shutdown.subscribe(),
                move || {
                    let this = Arc::clone(&this);
                    async move { this.refresh_connections().await }
                },
            )
        };
        self.tasks.lock().extend([query, refresh]);
        Ok(())
    }

    /// Additionally refresh connection status every
    /// `fast_refresh_interval`. Idempotent.
    pub fn start_fast_refresh(self: &Arc<Self>) {
        let mut slot = self.fast_refresh.lock();
        if slot.is_some() || self.closed.load(Ordering::Acquire) {
            return;
        }
        let this = Arc::clone(self);
        *slot = Some(spawn_periodic(
            "discovery-fast-refresh",
            self.config.fast_refresh_interval,
            self.shutdown.subscribe(),
            move || {
                let this = Arc::clone(&this);
                async move { this.refresh_connections().await }
            },
        ));
    }

    /// Run one query window and handle every answer.
    pub async fn query_once(self: &Arc<Self>) {
        let answers = match self.broadcaster.query(self.config.query_timeout).await {
            Ok(answers) => answers,
            Err(e) => {
                warn!(error = %e, backend = self.broadcaster.name(), "local discovery query failed");
                return;
            }
        };
        trace!(answers = answers.len(), "local discovery query finished");
        for answer in &answers {
            // malformed answers are logged inside
            let _ = self.handle_announcement(answer).await;
        }
    }

    /// Record one announcement, notify subscribers and, for bootstrap
    /// peers, start a connection attempt. Returns the peer unless the
    /// announcement came from this host.
    pub async fn handle_announcement(self: &Arc<Self>, answer: &Announcement) -> Result<Option<AddrInfo>> {
        let info = match answer.parse() {
            Ok(info) => info,
            Err(e) => {
                debug!(error = %e, "ignoring malformed announcement");
                return Err(e);
            }
        };
        if info.id == self.host.id() {
            return Ok(None);
        }

        let is_bootstrap = is_likely_bootstrap(&info.addrs);
        let sighting = self
            .table
            .lock()
            .upsert(info.clone(), is_bootstrap, Instant::now());
        match sighting {
            Sighting::New => info!(peer = %info.id, is_bootstrap, addrs = info.addrs.len(), source = "mdns", "discovered peer"),
            Sighting::Refreshed => trace!(peer = %info.id, "peer seen again"),
        }

        self.bus
            .publish(DiscoveryEvent::PeerDiscovered {
                info: info.clone(),
                is_bootstrap,
            })
            .await;

        if is_bootstrap && !self.host.is_connected(&info.id) {
            self.spawn_connect(info.clone());
        }
        Ok(Some(info))
    }

    /// Start a background attempt unless the peer ran out of tries or an
    /// attempt to it is still in flight.
    fn spawn_connect(self: &Arc<Self>, info: AddrInfo) {
        let tries = self
            .table
            .lock()
            .get(&info.id)
            .map_or(0, |p| p.connection_tries);
        if tries >= self.config.max_connection_tries {
            trace!(peer = %info.id, tries, "giving up on bootstrap peer");
            return;
        }
        if !self.dialing.lock().insert(info.id) {
            trace!(peer = %info.id, "connection attempt already in flight");
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _ = this.connect_peer(&info).await;
            this.dialing.lock().remove(&info.id);
        });
    }

    /// One bounded connection attempt to a discovered peer.
    pub async fn connect_peer(&self, info: &AddrInfo) -> Result<()> {
        let tries = self.table.lock().record_attempt(&info.id).unwrap_or(0);
        let res = with_timeout("connect", self.config.connect_timeout, self.host.connect(info)).await;
        match res {
            Ok(()) => {
                debug!(peer = %info.id, tries, "connected to discovered peer");
                self.update_connected(info, true).await;
                Ok(())
            }
            Err(e) => {
                warn!(peer = %info.id, tries, error = %e, "failed to connect to discovered peer");
                Err(e)
            }
        }
    }

    async fn update_connected(&self, info: &AddrInfo, connected: bool) {
        let changed = self.table.lock().set_connected(&info.id, connected);
        if changed {
            self.bus
                .publish(DiscoveryEvent::ConnectionChanged {
                    info: info.clone(),
                    connected,
                })
                .await;
        }
    }

    /// Prune stale entries, re-check bootstrap connections and reconnect
    /// the ones that dropped while tries remain.
    pub async fn refresh_connections(self: &Arc<Self>) {
        let now = Instant::now();
        let (pruned, peers) = {
            let mut table = self.table.lock();
            (table.prune(now), table.snapshot(now))
        };
        for id in &pruned {
            debug!(peer = %id, "pruned stale discovered peer");
        }

        for peer in peers.iter().filter(|p| p.is_bootstrap) {
            let connected = self.host.is_connected(&peer.info.id);
            self.update_connected(&peer.info, connected).await;
            if !connected {
                self.spawn_connect(peer.info.clone());
            }
        }

        let stats = self.stats();
        debug!(
            total = stats.total_discovered,
            bootstrap = stats.bootstrap_discovered,
            connected_bootstrap = stats.connected_bootstrap,
            "local discovery refreshed"
        );
    }

    /// Snapshot of the aggregate counters.
    pub fn stats(&self) -> DiscoveryStats {
        self.table.lock().stats(Instant::now())
    }

    /// Snapshot of live entries.
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.table.lock().snapshot(Instant::now())
    }

    /// Bootstrap peers currently connected.
    pub fn connected_bootstrap_peers(&self) -> Vec<AddrInfo> {
        self.peers()
            .into_iter()
            .filter(|p| p.is_bootstrap && p.connected)
            .map(|p| p.info)
            .collect()
    }

    /// Stream of discovery events from now on.
    pub fn events(&self) -> impl futures_util::Stream<Item = DiscoveryEvent> + Send + 'static {
        self.bus.stream()
    }

    /// Subscribe `component`, replacing its previous callback.
    pub fn register_callback(&self, component: &str, callback: Arc<dyn DiscoveryCallback>) {
        self.bus.subscribe(component, callback);
    }

    /// Remove the subscription of `component`. The service keeps running.
    pub fn unregister_callback(&self, component: &str) -> bool {
        self.bus.unsubscribe(component)
    }

    /// Number of subscribed components.
    pub fn callback_count(&self) -> usize {
        self.bus.subscriber_count()
    }

    /// Whether [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop all loops and withdraw the advertisement.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.shutdown.send(());

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        tasks.extend(self.fast_refresh.lock().take());
        for task in tasks {
            task.stop().await;
        }
        info!(peer = %self.host.id(), "local discovery stopped");
        self.broadcaster.shutdown().await
    }
}
