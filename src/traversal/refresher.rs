//! Periodic upkeep of relay and reflexive addresses.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::client::{TraversalClient, TraversalState};
use super::session::{AllocateOutcome, TraversalDialer};
use crate::config::TurnConfig;
use crate::error::Result;
use crate::peer::{EndStation, StationType};
use crate::schedule::{spawn_periodic, Periodic};

/// Latest addresses learned from the traversal server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraversalAddresses {
    /// Relayed transport address of the allocation.
    pub relay: Option<SocketAddr>,
    /// Server-reflexive address.
    pub reflexive: Option<SocketAddr>,
    /// Server the addresses came from.
    pub server: Option<String>,
    /// When the addresses were last refreshed.
    pub updated_at: Option<Instant>,
}

impl TraversalAddresses {
    /// Whether the data is missing or older than `max_age`.
    pub fn is_stale(&self, max_age: std::time::Duration) -> bool {
        self.updated_at.map_or(true, |at| at.elapsed() > max_age)
    }

    /// End stations for the known addresses.
    pub fn end_stations(&self, realm: &str) -> Vec<EndStation> {
        let mut stations = Vec::new();
        if let Some(relay) = self.relay {
            stations.push(EndStation {
                name: format!("{realm}-relay"),
                typ: StationType::TurnRelay,
                net_address: relay.to_string(),
                endpoints: self.server.iter().cloned().collect(),
            });
        }
        if let Some(reflexive) = self.reflexive {
            stations.push(EndStation {
                name: format!("{realm}-reflexive"),
                typ: StationType::Stun,
                net_address: reflexive.to_string(),
                endpoints: self.server.iter().cloned().collect(),
            });
        }
        stations
    }
}

/// Keeps a relay allocation alive and tracks the reflexive address.
pub struct TraversalRefresher {
    client: TraversalClient,
    config: TurnConfig,
    addresses: RwLock<TraversalAddresses>,
    refreshing: tokio::sync::Mutex<()>,
    task: Mutex<Option<Periodic>>,
}

impl TraversalRefresher {
    /// Refresher over sessions from `dialer`.
    pub fn new(dialer: Arc<dyn TraversalDialer>, config: TurnConfig) -> Arc<Self> {
        Arc::new(Self {
            client: TraversalClient::new(dialer),
            config,
            addresses: RwLock::new(TraversalAddresses::default()),
            refreshing: tokio::sync::Mutex::new(()),
            task: Mutex::new(None),
        })
    }

    /// State of the underlying session.
    pub fn state(&self) -> TraversalState {
        self.client.state()
    }

    /// Latest addresses without touching the network.
    pub fn snapshot(&self) -> TraversalAddresses {
        self.addresses.read().clone()
    }

    /// Allocate (or confirm) the relay and re-learn the reflexive address.
    /// A failed operation marks the session unhealthy so the next refresh
    /// re-dials.
    pub async fn refresh(&self) -> Result<TraversalAddresses> {
        let _running = self.refreshing.lock().await;
        let session = self.client.get().await?;

        let relay = match session.allocate().await {
            Ok(AllocateOutcome::Allocated(addr)) => {
                info!(relay = %addr, server = %session.server(), "relay allocated");
                Some(addr)
            }
            Ok(AllocateOutcome::AlreadyAllocated) => {
                debug!(server = %session.server(), "relay allocation still active");
                self.addresses.read().relay
            }
            Err(e) => {
                self.client.mark_unhealthy().await;
                return Err(e);
            }
        };
        let reflexive = match session.binding().await {
            Ok(addr) => addr,
            Err(e) => {
                self.client.mark_unhealthy().await;
                return Err(e);
            }
        };

        let fresh = TraversalAddresses {
            relay,
            reflexive: Some(reflexive),
            server: Some(session.server()),
            updated_at: Some(Instant::now()),
        };
        *self.addresses.write() = fresh.clone();
        Ok(fresh)
    }

    /// Latest addresses, refreshed first when older than the configured
    /// maximum age. A failed refresh falls back to whatever is known.
    pub async fn ensure_fresh(&self) -> TraversalAddresses {
        let current = self.snapshot();
        if !current.is_stale(self.config.max_age) {
            return current;
        }
        match self.refresh().await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(error = %e, "traversal refresh before read failed");
                current
            }
        }
    }

    /// End stations from fresh addresses.
    pub async fn end_stations(&self) -> Vec<EndStation> {
        self.ensure_fresh().await.end_stations(&self.config.realm)
    }

    /// Refresh now and then every `refresh_interval`. Idempotent.
    pub fn start(self: &Arc<Self>, shutdown: broadcast::Receiver<()>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *task = Some(spawn_periodic(
            "traversal-refresh",
            self.config.refresh_interval,
            shutdown,
            move || {
                let this = Arc::clone(&this);
                async move {
                    if let Err(e) = this.refresh().await {
                        warn!(op = "traversal-refresh", error = %e, state = %this.state(), "traversal refresh failed");
                    }
                }
            },
        ));
    }

    /// Stop the refresh loop and drop the session.
    pub async fn stop(&self) -> Result<()> {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.stop().await;
        }
        self.client.close().await
    }
}
