//! One shared discovery service per host.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::broadcaster::Broadcaster;
use super::events::DiscoveryCallback;
use super::service::LocalDiscovery;
use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::identity::PeerId;
use crate::substrate::Host;

/// Hands out the [`LocalDiscovery`] of a host, starting it on the first
/// attach and stopping it when the last component detaches.
#[derive(Default)]
pub struct DiscoveryHub {
    services: Mutex<HashMap<PeerId, Arc<LocalDiscovery>>>,
}

impl DiscoveryHub {
    /// Empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `component` to the discovery service of `host`, creating
    /// and starting the service if none runs yet. `broadcaster` and
    /// `config` are only used when the service is created.
    pub async fn attach(
        &self,
        host: Arc<dyn Host>,
        broadcaster: Arc<dyn Broadcaster>,
        config: DiscoveryConfig,
        component: &str,
        callback: Arc<dyn DiscoveryCallback>,
    ) -> Result<Arc<LocalDiscovery>> {
        let host_id = host.id();
        let (service, created) = {
            let mut services = self.services.lock();
            match services.get(&host_id) {
                Some(existing) if !existing.is_closed() => (Arc::clone(existing), false),
                _ => {
                    let service = LocalDiscovery::new(host, broadcaster, config, component);
                    services.insert(host_id, Arc::clone(&service));
                    (service, true)
                }
            }
        };

        service.register_callback(component, callback);
        if created {
            if let Err(e) = service.start().await {
                self.remove_if_same(&host_id, &service);
                return Err(e);
            }
            info!(host = %host_id, component, "local discovery attached (new instance)");
        } else {
            debug!(host = %host_id, component, callbacks = service.callback_count(), "local discovery attached (shared)");
        }
        Ok(service)
    }

    /// Unsubscribe `component`. The service is closed once no component
    /// remains. Returns `true` when that happened.
    pub async fn detach(&self, host_id: &PeerId, component: &str) -> Result<bool> {
        let service = {
            let mut services = self.services.lock();
            let Some(service) = services.get(host_id).cloned() else {
                return Ok(false);
            };
            service.unregister_callback(component);
            if service.callback_count() > 0 {
                debug!(host = %host_id, component, remaining = service.callback_count(), "local discovery detached");
                return Ok(false);
            }
            services.remove(host_id);
            service
        };
        service.close().await?;
        info!(host = %host_id, "last component detached, local discovery closed");
        Ok(true)
    }

    /// Close the service of `host_id` regardless of subscribers.
    pub async fn close_host(&self, host_id: &PeerId) -> Result<()> {
        let service = self.services.lock().remove(host_id);
        match service {
            Some(service) => service.close().await,
            None => Ok(()),
        }
    }

    /// The running service of `host_id`, if any.
    pub fn get(&self, host_id: &PeerId) -> Option<Arc<LocalDiscovery>> {
        self.services.lock().get(host_id).cloned()
    }

    /// Number of running services.
    pub fn len(&self) -> usize {
        self.services.lock().len()
    }

    /// Whether no service runs.
    pub fn is_empty(&self) -> bool {
        self.services.lock().is_empty()
    }

    fn remove_if_same(&self, host_id: &PeerId, service: &Arc<LocalDiscovery>) {
        let mut services = self.services.lock();
        if services
            .get(host_id)
            .is_some_and(|s| Arc::ptr_eq(s, service))
        {
            services.remove(host_id);
        }
    }
}
