//! Signed peer record encoding.
//!
//! Records travel as a postcard [`RecordEnvelope`] wrapping the JSON form of
//! a [`Peer`]. The signature covers the canonical JSON of
//! `{name, version, timestamp}`, hashed with SHA-256 and signed with the
//! node's Ed25519 key. An empty value is a tombstone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::identity::{Keypair, PeerId};
use crate::peer::Peer;

/// Version stamped on records that do not carry one.
pub const RECORD_VERSION: &str = "1.0";

/// Payload kind carried in an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// JSON encoded [`Peer`].
    PeerRecord,
    /// Raw Ed25519 public key bytes.
    PublicKey,
}

/// Generic value envelope stored in the DHT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEnvelope {
    /// What `data` holds.
    pub kind: EnvelopeKind,
    /// Encoded payload.
    pub data: Vec<u8>,
}

impl RecordEnvelope {
    /// Encode to bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    /// Decode from bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

#[derive(Serialize)]
struct SignedFields<'a> {
    name: &'a str,
    version: &'a str,
    timestamp: &'a DateTime<Utc>,
}

fn signing_digest(peer: &Peer) -> Result<[u8; 32]> {
    let canonical = serde_json::to_vec(&SignedFields {
        name: &peer.name,
        version: &peer.version,
        timestamp: &peer.timestamp,
    })?;
    Ok(Sha256::digest(&canonical).into())
}

/// Stamp the timestamp (and a missing version) and sign. The signature is
/// always recomputed.
pub fn sign_peer(peer: &Peer, keypair: &Keypair) -> Result<Peer> {
    let mut record = peer.clone();
    if record.version.is_empty() {
        record.version = RECORD_VERSION.to_string();
    }
    record.timestamp = Utc::now();
    record.signature = keypair.sign(&signing_digest(&record)?);
    Ok(record)
}

/// Encode an already signed record.
pub fn encode_peer(record: &Peer) -> Result<Vec<u8>> {
    RecordEnvelope {
        kind: EnvelopeKind::PeerRecord,
        data: serde_json::to_vec(record)?,
    }
    .encode()
}

/// Stamp, sign and encode `peer`.
pub fn marshal_peer(peer: &Peer, keypair: &Keypair) -> Result<Vec<u8>> {
    encode_peer(&sign_peer(peer, keypair)?)
}

/// Decode a record produced by [`marshal_peer`].
pub fn unmarshal_peer(bytes: &[u8]) -> Result<Peer> {
    if bytes.is_empty() {
        return Err(Error::not_found("peer record was deregistered"));
    }
    let envelope = RecordEnvelope::decode(bytes)
        .map_err(|e| Error::validation(format!("malformed record envelope: {e}")))?;
    if envelope.kind != EnvelopeKind::PeerRecord {
        return Err(Error::validation(format!(
            "expected a peer record, found {:?}",
            envelope.kind
        )));
    }
    serde_json::from_slice(&envelope.data)
        .map_err(|e| Error::validation(format!("malformed peer record: {e}")))
}

/// Encode the public key record published under `/pk/<id>`.
pub fn marshal_public_key(id: &PeerId) -> Result<Vec<u8>> {
    RecordEnvelope {
        kind: EnvelopeKind::PublicKey,
        data: id.as_bytes().to_vec(),
    }
    .encode()
}

/// Check that `peer` was signed by `signer`.
pub fn verify_peer(peer: &Peer, signer: &PeerId) -> Result<()> {
    if peer.signature.is_empty() {
        return Err(Error::validation("peer record is unsigned"));
    }
    signer.verify(&signing_digest(peer)?, &peer.signature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{EndStation, StationType};

    fn sample() -> Peer {
        let mut peer = Peer::new("peer-1", "alice", "0.3.0").with_metadata("region", "eu");
        peer.attach_station(EndStation {
            name: "relay".into(),
            typ: StationType::TurnRelay,
            net_address: "203.0.113.5:49152".into(),
            endpoints: vec![],
        });
        peer
    }

    #[test]
    fn decoded_record_keeps_fields_and_verifies() {
        let keys = Keypair::generate();
        let peer = sample();
        let decoded = unmarshal_peer(&marshal_peer(&peer, &keys).unwrap()).unwrap();

        assert_eq!(decoded.id, peer.id);
        assert_eq!(decoded.name, peer.name);
        assert_eq!(decoded.version, peer.version);
        assert_eq!(decoded.metadata, peer.metadata);
        assert_eq!(decoded.end_station, peer.end_station);
        assert!(verify_peer(&decoded, &keys.peer_id()).is_ok());
    }

    #[test]
    fn tampering_with_a_signed_field_breaks_verification() {
        let keys = Keypair::generate();
        let mut decoded = unmarshal_peer(&marshal_peer(&sample(), &keys).unwrap()).unwrap();
        decoded.name = "mallory".into();
        assert!(verify_peer(&decoded, &keys.peer_id()).is_err());
    }

    #[test]
    fn signature_follows_signed_fields() {
        let keys = Keypair::generate();
        let mut peer = unmarshal_peer(&marshal_peer(&sample(), &keys).unwrap()).unwrap();
        let original = peer.signature.clone();

        let fixed_ts = peer.timestamp;
        let resign = |p: &Peer| keys.sign(&signing_digest(p).unwrap());
        assert_eq!(resign(&peer), original);

        peer.version = "0.3.1".into();
        peer.timestamp = fixed_ts;
        assert_ne!(resign(&peer), original);
    }

    #[test]
    fn metadata_is_not_signed() {
        let keys = Keypair::generate();
        let mut decoded = unmarshal_peer(&marshal_peer(&sample(), &keys).unwrap()).unwrap();
        decoded.metadata.insert("registerType".into(), "dht".into());
        assert!(verify_peer(&decoded, &keys.peer_id()).is_ok());
    }

    #[test]
    fn empty_version_is_stamped() {
        let keys = Keypair::generate();
        let mut peer = sample();
        peer.version.clear();
        let decoded = unmarshal_peer(&marshal_peer(&peer, &keys).unwrap()).unwrap();
        assert_eq!(decoded.version, RECORD_VERSION);
    }

    #[test]
    fn tombstones_and_garbage_are_rejected() {
        assert!(matches!(unmarshal_peer(&[]), Err(Error::NotFound(_))));
        assert!(matches!(unmarshal_peer(b"\xff\xff"), Err(Error::Validation(_))));

        let key_envelope = RecordEnvelope {
            kind: EnvelopeKind::PublicKey,
            data: vec![1, 2, 3],
        }
        .encode()
        .unwrap();
        assert!(matches!(unmarshal_peer(&key_envelope), Err(Error::Validation(_))));
    }
}
