//! Peer discovery and registration for a DHT-backed p2p overlay.
//!
//! A [`NativeRegistry`] publishes signed peer records into the DHT, lists
//! and fetches the records of other nodes, finds bootstrap nodes on the
//! local network and keeps relay and reflexive addresses fresh through a
//! STUN/TURN server.

#![deny(missing_docs)]

pub mod addr;
pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod keys;
pub mod peer;
pub mod registry;
pub mod schedule;
pub mod store;
pub mod substrate;
pub mod traversal;
pub mod validator;

// Re-export key types
pub use addr::{AddrInfo, PeerAddr};
pub use config::{DiscoveryConfig, RegistryOptions, TurnConfig};
pub use discovery::{DiscoveryHub, DiscoveryStats, LocalDiscovery};
pub use error::{Error, Result};
pub use identity::{Keypair, PeerId};
pub use peer::{EndStation, Peer, StationType};
pub use registry::{GetOptions, ListOptions, NativeRegistry, RegisterOptions, RegistryBuilder};
pub use store::{MemoryRecordStore, RecordStore, RegisterRecord};
pub use substrate::swarm::SwarmSubstrate;
pub use substrate::RunMode;
