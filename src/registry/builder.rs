use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::{global, spawn_bootstrap, BootstrapFeed, NativeRegistry, DISCOVERY_COMPONENT};
use crate::addr::PeerAddr;
use crate::bootstrap::BootstrapAggregator;
use crate::config::RegistryOptions;
use crate::discovery::{Broadcaster, DiscoveryHub, MdnsBroadcaster};
use crate::error::{Error, Result};
use crate::identity::Keypair;
use crate::keys::PROTOCOL_PREFIX;
use crate::schedule::Periodic;
use crate::store::{RecordStore, REGISTER_RECORD_TABLE};
use crate::substrate::{Host, Substrate, SubstrateConfig};
use crate::traversal::{TraversalDialer, TraversalRefresher, UdpDialer};
use crate::validator::NamespacedValidator;

/// Routing bucket size handed to the substrate.
const BUCKET_SIZE: usize = 20;

/// Collects the collaborators of a [`NativeRegistry`].
pub struct RegistryBuilder {
    options: RegistryOptions,
    store: Option<Arc<dyn RecordStore>>,
    substrate: Option<Arc<dyn Substrate>>,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    hub: Option<Arc<DiscoveryHub>>,
    dialer: Option<Arc<dyn TraversalDialer>>,
    keypair: Option<Keypair>,
    install_default: bool,
}

impl RegistryBuilder {
    pub(super) fn new(options: RegistryOptions) -> Self {
        Self {
            options,
            store: None,
            substrate: None,
            broadcaster: None,
            hub: None,
            dialer: None,
            keypair: None,
            install_default: true,
        }
    }

    /// Persistence for registration rows. Required.
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Builds the host and DHT. Required.
    pub fn substrate(mut self, substrate: Arc<dyn Substrate>) -> Self {
        self.substrate = Some(substrate);
        self
    }

    /// Local discovery backend. Defaults to mDNS.
    pub fn broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Hub that shares discovery services between components of a host.
    pub fn discovery_hub(mut self, hub: Arc<DiscoveryHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    /// NAT traversal dialer. Defaults to UDP against the configured servers.
    pub fn traversal_dialer(mut self, dialer: Arc<dyn TraversalDialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Identity to use instead of the configured key file.
    pub fn keypair(mut self, keypair: Keypair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    /// Whether the built registry becomes the process-wide default.
    pub fn install_default(mut self, install: bool) -> Self {
        self.install_default = install;
        self
    }

    /// Validate the configuration, start every background task and return
    /// the running registry.
    pub async fn init(self) -> Result<Arc<NativeRegistry>> {
        let options = self.options;
        let store = self
            .store
            .ok_or_else(|| Error::config("a record store is required"))?;
        if self.keypair.is_none() && options.identity_key_file.is_none() {
            return Err(Error::config("an identity key file or keypair is required"));
        }
        let substrate = self
            .substrate
            .ok_or_else(|| Error::config("a substrate is required"))?;

        store
            .auto_migrate()
            .await
            .map_err(|e| Error::config(format!("failed to migrate {REGISTER_RECORD_TABLE}: {e}")))?;

        let keypair = match (self.keypair, &options.identity_key_file) {
            (Some(keypair), _) => keypair,
            (None, Some(path)) => Keypair::load_or_generate(path)?,
            (None, None) => return Err(Error::config("an identity key file or keypair is required")),
        };

        let listen_addrs = options
            .effective_listen_addrs()
            .iter()
            .map(|a| {
                a.parse::<PeerAddr>()
                    .map_err(|e| Error::config(format!("invalid listen address {a:?}: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let aggregator = Arc::new(BootstrapAggregator::new(options.bootstrap_nodes.clone()));
        let bootstrap_peers = {
            let aggregator = Arc::clone(&aggregator);
            Arc::new(move || aggregator.peers())
        };

        let node = substrate
            .build(SubstrateConfig {
                keypair: keypair.clone(),
                listen_addrs,
                run_mode: options.run_mode,
                validator: Arc::new(NamespacedValidator::standard()),
                protocol_prefix: PROTOCOL_PREFIX.to_string(),
                bucket_size: BUCKET_SIZE,
                bootstrap_peers,
            })
            .await?;
        let host_id = node.host.id();
        info!(peer = %host_id, addrs = ?node.host.addrs(), run_mode = ?options.run_mode, "host started");

        let (shutdown, _) = broadcast::channel(1);
        let bootstrap = spawn_bootstrap(
            Arc::clone(&node.host),
            Arc::clone(&node.dht),
            &options,
            shutdown.subscribe(),
        );

        let hub = self.hub.unwrap_or_default();
        let discovery = if options.discovery_enabled {
            let broadcaster = match self.broadcaster {
                Some(b) => Ok(b),
                None => MdnsBroadcaster::with_service_type(&options.discovery.service_type)
                    .map(|b| Arc::new(b) as Arc<dyn Broadcaster>),
            };
            let attached = match broadcaster {
                Ok(broadcaster) => {
                    let feed = Arc::new(BootstrapFeed {
                        aggregator: Arc::clone(&aggregator),
                        trigger: bootstrap.trigger(),
                    });
                    hub.attach(
                        Arc::clone(&node.host),
                        broadcaster,
                        options.discovery.clone(),
                        DISCOVERY_COMPONENT,
                        feed,
                    )
                    .await
                }
                Err(e) => Err(e),
            };
            match attached {
                Ok(service) => {
                    info!(peer = %host_id, "local discovery enabled");
                    Some(service)
                }
                Err(e) => {
                    abort_init(&shutdown, bootstrap, node.host.as_ref()).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let traversal = if options.turn.enabled {
            let dialer = self
                .dialer
                .unwrap_or_else(|| Arc::new(UdpDialer::new(&options.turn)));
            let refresher = TraversalRefresher::new(dialer, options.turn.clone());
            refresher.start(shutdown.subscribe());
            info!(realm = %options.turn.realm, servers = ?options.turn.server_addresses, "nat traversal enabled");
            Some(refresher)
        } else {
            None
        };

        let registry = Arc::new(NativeRegistry {
            options,
            keypair,
            store,
            host: node.host,
            dht: node.dht,
            aggregator,
            hub,
            discovery,
            traversal,
            peers: RwLock::new(HashMap::new()),
            loops: Mutex::new(HashMap::new()),
            bootstrap_task: Mutex::new(Some(bootstrap)),
            shutdown,
            closed: AtomicBool::new(false),
        });

        if self.install_default {
            global::set_default(Arc::clone(&registry));
        }
        info!(peer = %host_id, "native registry ready");
        Ok(registry)
    }
}

async fn abort_init(shutdown: &broadcast::Sender<()>, bootstrap: Periodic, host: &dyn Host) {
    let _ = shutdown.send(());
    bootstrap.stop().await;
    if let Err(e) = host.close().await {
        warn!(error = %e, "failed to close host after aborted init");
    }
}
