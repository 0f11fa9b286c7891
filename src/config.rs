//! Registry configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::substrate::RunMode;

/// Listen address used when serving as a bootstrap node without explicit
/// listen addresses.
pub const DEFAULT_BOOTSTRAP_LISTEN_ADDR: &str = "/ip4/0.0.0.0/tcp/4001";

/// mDNS service type advertised and browsed by local discovery.
pub const DEFAULT_SERVICE_TYPE: &str = "_peers-touch._tcp.local.";

/// Local discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// mDNS service type.
    pub service_type: String,
    /// How often to query the local network.
    pub query_interval: Duration,
    /// How long a single query collects answers.
    pub query_timeout: Duration,
    /// How often to re-check connection status of known peers.
    pub refresh_interval: Duration,
    /// Interval of the optional faster connection refresh.
    pub fast_refresh_interval: Duration,
    /// Entries unseen for longer than this are pruned.
    pub stale_after: Duration,
    /// Reconnect attempts per bootstrap peer before giving up.
    pub max_connection_tries: u32,
    /// Per-attempt connect deadline.
    pub connect_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            query_interval: Duration::from_secs(30),
            query_timeout: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(120),
            fast_refresh_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(300),
            max_connection_tries: 5,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// TURN/STUN settings.
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Whether NAT traversal upkeep runs at all.
    pub enabled: bool,
    /// `host:port` of candidate servers, tried in order.
    pub server_addresses: Vec<String>,
    /// Short-term credential user name.
    pub username: String,
    /// Short-term credential password.
    pub password: String,
    /// Realm reported in logs and end stations.
    pub realm: String,
    /// How often allocations and reflexive addresses are refreshed.
    pub refresh_interval: Duration,
    /// Data older than this is refreshed before being served.
    pub max_age: Duration,
    /// Per-transaction deadline.
    pub request_timeout: Duration,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_addresses: Vec::new(),
            username: String::new(),
            password: String::new(),
            realm: "peers-touch".to_string(),
            refresh_interval: Duration::from_secs(10),
            max_age: Duration::from_secs(8),
            request_timeout: Duration::from_secs(3),
        }
    }
}

/// Options for [`NativeRegistry`](crate::registry::NativeRegistry).
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Run local network discovery.
    pub discovery_enabled: bool,
    /// Serve as a bootstrap node for others.
    pub bootstrap_enabled: bool,
    /// Listen addresses when serving as a bootstrap node.
    pub bootstrap_listen_addrs: Vec<String>,
    /// Static seed nodes, `/ip4/<ip>/tcp/<port>/p2p/<id>`.
    pub bootstrap_nodes: Vec<String>,
    /// Relay nodes, same format as seed nodes.
    pub relay_nodes: Vec<String>,
    /// Where the identity key is loaded from or generated into.
    pub identity_key_file: Option<PathBuf>,
    /// Period of DHT bootstrap refreshes.
    pub bootstrap_refresh_interval: Duration,
    /// Default period of registration loops.
    pub register_interval: Duration,
    /// Connection attempts made against each seed at startup.
    pub bootstrap_retry_times: u32,
    /// DHT participation mode.
    pub run_mode: RunMode,
    /// Verify record signatures on the query path.
    pub verify_on_read: bool,
    /// Local discovery settings.
    pub discovery: DiscoveryConfig,
    /// NAT traversal settings.
    pub turn: TurnConfig,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            discovery_enabled: false,
            bootstrap_enabled: false,
            bootstrap_listen_addrs: Vec::new(),
            bootstrap_nodes: Vec::new(),
            relay_nodes: Vec::new(),
            identity_key_file: None,
            bootstrap_refresh_interval: Duration::from_secs(60),
            register_interval: Duration::from_secs(30),
            bootstrap_retry_times: 3,
            run_mode: RunMode::Auto,
            verify_on_read: true,
            discovery: DiscoveryConfig::default(),
            turn: TurnConfig::default(),
        }
    }
}

impl RegistryOptions {
    /// Enable or disable local network discovery.
    pub fn with_discovery(mut self, enabled: bool) -> Self {
        self.discovery_enabled = enabled;
        self
    }

    /// Enable or disable serving as a bootstrap node.
    pub fn with_bootstrap(mut self, enabled: bool) -> Self {
        self.bootstrap_enabled = enabled;
        self
    }

    /// Listen addresses used in bootstrap mode.
    pub fn with_bootstrap_listen_addrs<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bootstrap_listen_addrs = addrs.into_iter().map(Into::into).collect();
        self
    }

    /// Static seed nodes.
    pub fn with_bootstrap_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bootstrap_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Relay nodes.
    pub fn with_relay_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.relay_nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    /// Identity key file.
    pub fn with_identity_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_key_file = Some(path.into());
        self
    }

    /// Period of DHT bootstrap refreshes.
    pub fn with_bootstrap_refresh_interval(mut self, interval: Duration) -> Self {
        self.bootstrap_refresh_interval = interval;
        self
    }

    /// Default registration period.
    pub fn with_register_interval(mut self, interval: Duration) -> Self {
        self.register_interval = interval;
        self
    }

    /// Seed connection attempts at startup.
    pub fn with_bootstrap_retry_times(mut self, times: u32) -> Self {
        self.bootstrap_retry_times = times;
        self
    }

    /// DHT participation mode.
    pub fn with_run_mode(mut self, mode: RunMode) -> Self {
        self.run_mode = mode;
        self
    }

    /// Toggle signature checks on the query path.
    pub fn with_verify_on_read(mut self, verify: bool) -> Self {
        self.verify_on_read = verify;
        self
    }

    /// Local discovery settings.
    pub fn with_discovery_config(mut self, config: DiscoveryConfig) -> Self {
        self.discovery = config;
        self
    }

    /// NAT traversal settings.
    pub fn with_turn(mut self, turn: TurnConfig) -> Self {
        self.turn = turn;
        self
    }

    /// Listen addresses the host should bind, after defaults are applied.
    pub fn effective_listen_addrs(&self) -> Vec<String> {
        if !self.bootstrap_enabled {
            return Vec::new();
        }
        if self.bootstrap_listen_addrs.is_empty() {
            vec![DEFAULT_BOOTSTRAP_LISTEN_ADDR.to_string()]
        } else {
            self.bootstrap_listen_addrs.clone()
        }
    }
}
