//! Local-network broadcast seam and an in-process LAN.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::announce::{Advertisement, Announcement};
use crate::error::Result;

/// Advertises this node and collects announcements from others.
#[async_trait]
pub trait Broadcaster: Send + Sync + 'static {
    /// Name for logging (e.g. "mdns").
    fn name(&self) -> &'static str;

    /// Start answering queries with `ad`. Replaces any earlier advertisement.
    async fn advertise(&self, ad: &Advertisement) -> Result<()>;

    /// Collect announcements for up to `window`.
    async fn query(&self, window: Duration) -> Result<Vec<Announcement>>;

    /// Withdraw the advertisement and release resources.
    async fn shutdown(&self) -> Result<()>;
}

type Segment = Arc<Mutex<BTreeMap<String, (Advertisement, IpAddr)>>>;

/// A simulated broadcast domain shared by several [`MemoryBroadcaster`]s.
#[derive(Clone, Default)]
pub struct MemoryLan {
    segment: Segment,
}

impl MemoryLan {
    /// Empty segment.
    pub fn new() -> Self {
        Self::default()
    }

    /// Broadcaster attached to this segment, answering from `source`.
    pub fn broadcaster(&self, source: IpAddr) -> MemoryBroadcaster {
        MemoryBroadcaster {
            segment: Arc::clone(&self.segment),
            source,
            own: Mutex::new(None),
        }
    }

    /// Inject an advertisement as if a remote node answered from `source`.
    pub fn announce(&self, ad: Advertisement, source: IpAddr) {
        self.segment.lock().insert(ad.instance.clone(), (ad, source));
    }

    /// Remove an injected advertisement.
    pub fn withdraw(&self, instance: &str) {
        self.segment.lock().remove(instance);
    }

    /// Number of live advertisements.
    pub fn len(&self) -> usize {
        self.segment.lock().len()
    }

    /// Whether nothing is advertised.
    pub fn is_empty(&self) -> bool {
        self.segment.lock().is_empty()
    }
}

/// [`Broadcaster`] over a [`MemoryLan`].
pub struct MemoryBroadcaster {
    segment: Segment,
    source: IpAddr,
    own: Mutex<Option<String>>,
}

#[async_trait]
impl Broadcaster for MemoryBroadcaster {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn advertise(&self, ad: &Advertisement) -> Result<()> {
        let mut own = self.own.lock();
        let mut segment = self.segment.lock();
        if let Some(previous) = own.take() {
            segment.remove(&previous);
        }
        segment.insert(ad.instance.clone(), (ad.clone(), self.source));
        *own = Some(ad.instance.clone());
        Ok(())
    }

    async fn query(&self, _window: Duration) -> Result<Vec<Announcement>> {
        let answers: Vec<Announcement> = self
            .segment
            .lock()
            .values()
            .map(|(ad, source)| Announcement::from_advertisement(ad, Some(*source)))
            .collect();
        trace!(answers = answers.len(), "memory lan query");
        Ok(answers)
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(instance) = self.own.lock().take() {
            self.segment.lock().remove(&instance);
        }
        Ok(())
    }
}
