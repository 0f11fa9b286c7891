//! mDNS broadcaster backed by `mdns-sd`.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use local_ip_address::local_ip;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::announce::{Advertisement, Announcement, TXT_ADDRESSES, TXT_PEER_ID, TXT_PORT};
use super::broadcaster::Broadcaster;
use crate::config::DEFAULT_SERVICE_TYPE;
use crate::error::{Error, Result};

fn mdns_err(e: mdns_sd::Error) -> Error {
    Error::Discovery(e.to_string())
}

/// Local network discovery over multicast DNS.
pub struct MdnsBroadcaster {
    daemon: ServiceDaemon,
    service_type: String,
    registered: Mutex<Option<String>>,
}

impl MdnsBroadcaster {
    /// Start an mDNS daemon for the default service type.
    pub fn new() -> Result<Self> {
        Self::with_service_type(DEFAULT_SERVICE_TYPE)
    }

    /// Start an mDNS daemon for `service_type` (e.g. `_peers-touch._tcp.local.`).
    pub fn with_service_type(service_type: &str) -> Result<Self> {
        let daemon = ServiceDaemon::new().map_err(mdns_err)?;
        Ok(Self {
            daemon,
            service_type: service_type.to_string(),
            registered: Mutex::new(None),
        })
    }
}

fn txt_keys() -> impl Iterator<Item = String> {
    [TXT_PEER_ID.to_string(), TXT_PORT.to_string(), TXT_ADDRESSES.to_string()]
        .into_iter()
        .chain((1..).map(|i| format!("{TXT_ADDRESSES}_{i}")))
}

#[async_trait]
impl Broadcaster for MdnsBroadcaster {
    fn name(&self) -> &'static str {
        "mdns"
    }

    async fn advertise(&self, ad: &Advertisement) -> Result<()> {
        if let Some(previous) = self.registered.lock().take() {
            let _ = self.daemon.unregister(&previous);
        }

        let ip = match ad.addrs.iter().map(|a| a.ip()).find(IpAddr::is_ipv4) {
            Some(ip) => ip,
            None => local_ip().map_err(|e| Error::Discovery(format!("no local ip: {e}")))?,
        };
        let host_name = format!("{}.local.", ad.instance);
        let records = ad.txt_records();
        let properties: Vec<(&str, &str)> = records
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let service_info = ServiceInfo::new(
            &self.service_type,
            &ad.instance,
            &host_name,
            &ip.to_string(),
            ad.port,
            &properties[..],
        )
        .map_err(mdns_err)?;
        let fullname = service_info.get_fullname().to_string();

        self.daemon.register(service_info).map_err(mdns_err)?;
        info!(%fullname, %ip, port = ad.port, "registered mdns service");
        *self.registered.lock() = Some(fullname);
        Ok(())
    }

    async fn query(&self, window: Duration) -> Result<Vec<Announcement>> {
        let receiver = self.daemon.browse(&self.service_type).map_err(mdns_err)?;
        let deadline = Instant::now() + window;
        let mut answers = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, receiver.recv_async()).await {
                Ok(Ok(ServiceEvent::ServiceResolved(info))) => {
                    let mut txt = Vec::new();
                    for key in txt_keys() {
                        match info.get_property_val_str(&key) {
                            Some(value) => txt.push((key, value.to_string())),
                            None if key.starts_with(TXT_ADDRESSES) => break,
                            None => {}
                        }
                    }
                    if !txt.iter().any(|(k, _)| k == TXT_PORT) {
                        txt.push((TXT_PORT.to_string(), info.get_port().to_string()));
                    }
                    let source = info
                        .get_addresses()
                        .iter()
                        .filter_map(|ip| ip.to_string().parse::<IpAddr>().ok())
                        .find(|ip| !ip.is_loopback());
                    answers.push(Announcement { txt, source });
                }
                Ok(Ok(ServiceEvent::ServiceRemoved(_ty, fullname))) => {
                    debug!(%fullname, "mdns service removed");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "mdns browse channel closed");
                    break;
                }
                Err(_) => break,
            }
        }

        if let Err(e) = self.daemon.stop_browse(&self.service_type) {
            debug!(error = %e, "failed to stop mdns browse");
        }
        Ok(answers)
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(fullname) = self.registered.lock().take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!(%fullname, error = %e, "failed to unregister mdns service");
            }
        }
        let _ = self.daemon.shutdown();
        Ok(())
    }
}
