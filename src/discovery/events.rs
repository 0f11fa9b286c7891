//! Fan-out of discovery events to subscribed components.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use crate::addr::AddrInfo;
use crate::error::Result;

/// Something local discovery observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A peer was seen, for the first time or again.
    PeerDiscovered {
        /// The peer and the addresses it announced.
        info: AddrInfo,
        /// Classified as a bootstrap node.
        is_bootstrap: bool,
    },
    /// Connection status of a known bootstrap peer flipped.
    ConnectionChanged {
        /// The peer.
        info: AddrInfo,
        /// New status.
        connected: bool,
    },
}

/// Receives discovered peers.
#[async_trait]
pub trait DiscoveryCallback: Send + Sync + 'static {
    /// Called for every sighting.
    async fn on_peer_discovered(&self, info: &AddrInfo, is_bootstrap: bool) -> Result<()>;
}

type BoxedHandler =
    dyn Fn(AddrInfo, bool) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> + Send + Sync;

/// Closure adapter for [`DiscoveryCallback`].
pub struct FnCallback {
    handler: Box<BoxedHandler>,
}

impl FnCallback {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(AddrInfo, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            handler: Box::new(move |info, is_bootstrap| Box::pin(f(info, is_bootstrap))),
        }
    }
}

#[async_trait]
impl DiscoveryCallback for FnCallback {
    async fn on_peer_discovered(&self, info: &AddrInfo, is_bootstrap: bool) -> Result<()> {
        (self.handler)(info.clone(), is_bootstrap).await
    }
}

struct Subscription {
    component: String,
    callback: Arc<dyn DiscoveryCallback>,
}

/// Typed event bus: named callback subscriptions plus a broadcast stream.
pub(crate) struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            subscriptions: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Add or replace the subscription of `component`.
    pub(crate) fn subscribe(&self, component: &str, callback: Arc<dyn DiscoveryCallback>) {
        let mut subs = self.subscriptions.write();
        subs.retain(|s| s.component != component);
        subs.push(Subscription {
            component: component.to_string(),
            callback,
        });
        debug!(component, total = subs.len(), "discovery callback registered");
    }

    /// Remove the subscription of `component`; returns whether it existed.
    pub(crate) fn unsubscribe(&self, component: &str) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.component != component);
        before != subs.len()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Stream of every event published from now on.
    pub(crate) fn stream(&self) -> impl futures_util::Stream<Item = DiscoveryEvent> + Send + 'static {
        BroadcastStream::new(self.events.subscribe()).filter_map(|res| res.ok())
    }

    /// Deliver `event` to the stream and, for sightings, to every callback.
    /// A failing or panicking callback is logged and does not affect others.
    pub(crate) async fn publish(&self, event: DiscoveryEvent) {
        let _ = self.events.send(event.clone());

        let DiscoveryEvent::PeerDiscovered { info, is_bootstrap } = event else {
            return;
        };
        let targets: Vec<(String, Arc<dyn DiscoveryCallback>)> = self
            .subscriptions
            .read()
            .iter()
            .map(|s| (s.component.clone(), Arc::clone(&s.callback)))
            .collect();

        for (component, callback) in targets {
            let call = callback.on_peer_discovered(&info, is_bootstrap);
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(component = %component, peer = %info.id, error = %e, "discovery callback failed"),
                Err(_) => warn!(component = %component, peer = %info.id, "discovery callback panicked"),
            }
        }
    }
}
