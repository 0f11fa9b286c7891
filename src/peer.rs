//! Peer records exchanged through the directory.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Metadata key tagging how a listed peer was found.
pub const META_REGISTER_TYPE: &str = "registerType";
/// `registerType` value for peers found through the DHT provider index.
pub const REGISTER_TYPE_DHT: &str = "dht";
/// `registerType` value for peers only known from a live connection.
pub const REGISTER_TYPE_CONNECTED: &str = "connected";
/// Metadata key holding a comma separated address list.
pub const META_ADDRESS: &str = "address";
/// Metadata key holding the hosting node's identity.
pub const META_PEER_ID: &str = "ptn:peerId";

/// Kind of a reachability endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StationType {
    /// Server-reflexive address learned from a binding request.
    #[serde(rename = "stun")]
    Stun,
    /// Relayed address allocated on a TURN server.
    #[serde(rename = "turnRelay")]
    TurnRelay,
    /// Plain HTTP endpoint.
    #[serde(rename = "http")]
    Http,
}

impl StationType {
    /// Key used for this station in [`Peer::end_station`].
    pub fn as_str(&self) -> &'static str {
        match self {
            StationType::Stun => "stun",
            StationType::TurnRelay => "turnRelay",
            StationType::Http => "http",
        }
    }
}

/// A reachability endpoint attached to a peer at query time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndStation {
    /// Display name.
    pub name: String,
    /// Endpoint kind.
    pub typ: StationType,
    /// `ip:port` of the endpoint.
    pub net_address: String,
    /// Additional endpoints, if any.
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Application-level peer record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    /// Application identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Record version.
    pub version: String,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Reachability endpoints keyed by station type.
    #[serde(default)]
    pub end_station: BTreeMap<String, EndStation>,
    /// Time the record was last signed.
    pub timestamp: DateTime<Utc>,
    /// Signature over the canonical `{name, version, timestamp}` form.
    #[serde(default)]
    pub signature: Vec<u8>,
}

impl Peer {
    /// Create an unsigned record.
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            metadata: BTreeMap::new(),
            end_station: BTreeMap::new(),
            timestamp: Utc::now(),
            signature: Vec::new(),
        }
    }

    /// Set a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Metadata entry as a string, if present and textual.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Check that the identifying fields are populated.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::validation("peer id is required"));
        }
        if self.name.is_empty() {
            return Err(Error::validation("peer name is required"));
        }
        if self.version.is_empty() {
            return Err(Error::validation("peer version is required"));
        }
        Ok(())
    }

    /// Insert or replace an end station under its type key.
    pub fn attach_station(&mut self, station: EndStation) {
        self.end_station
            .insert(station.typ.as_str().to_string(), station);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_identifying_fields() {
        assert!(Peer::new("p1", "alice", "1.0").validate().is_ok());
        assert!(Peer::new("", "alice", "1.0").validate().is_err());
        assert!(Peer::new("p1", "", "1.0").validate().is_err());
        assert!(Peer::new("p1", "alice", "").validate().is_err());
    }

    #[test]
    fn stations_are_keyed_by_type() {
        let mut peer = Peer::new("p1", "alice", "1.0");
        peer.attach_station(EndStation {
            name: "relay".into(),
            typ: StationType::TurnRelay,
            net_address: "203.0.113.5:49152".into(),
            endpoints: vec![],
        });
        peer.attach_station(EndStation {
            name: "reflexive".into(),
            typ: StationType::Stun,
            net_address: "198.51.100.7:50000".into(),
            endpoints: vec![],
        });
        assert_eq!(peer.end_station.len(), 2);
        assert!(peer.end_station.contains_key("turnRelay"));

        let json = serde_json::to_value(&peer.end_station["turnRelay"]).unwrap();
        assert_eq!(json["typ"], "turnRelay");
    }
}
