//! Directory key layout.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::identity::PeerId;

/// Namespace of peer records: `/pst/<peer-id>`.
pub const NETWORK_NAMESPACE: &str = "/pst";
/// Namespace of public key records: `/pk/<peer-id>`.
pub const PUBLIC_KEY_NAMESPACE: &str = "/pk";
/// Name advertised in the provider index by every registry node.
pub const SERVICE_NAME: &str = "/pst:peers-node";
/// DHT protocol prefix handed to the substrate.
pub const PROTOCOL_PREFIX: &str = "/pst";

/// Directory key for the record published by `peer`.
pub fn peer_key(peer: &PeerId) -> String {
    format!("{NETWORK_NAMESPACE}/{peer}")
}

/// Directory key for the public key of `peer`.
pub fn public_key_key(peer: &PeerId) -> String {
    format!("{PUBLIC_KEY_NAMESPACE}/{peer}")
}

/// Content identifier used in the provider index.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentKey([u8; 32]);

impl ContentKey {
    /// SHA-256 of `name`.
    pub fn for_name(name: &str) -> Self {
        Self(Sha256::digest(name.as_bytes()).into())
    }

    /// The provider key all registry nodes announce.
    pub fn service() -> Self {
        Self::for_name(SERVICE_NAME)
    }

    /// Digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentKey({})", hex::encode(&self.0[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Keypair;

    #[test]
    fn key_layout() {
        let id = Keypair::generate().peer_id();
        assert_eq!(peer_key(&id), format!("/pst/{id}"));
        assert_eq!(public_key_key(&id), format!("/pk/{id}"));
        assert_eq!(ContentKey::service(), ContentKey::for_name("/pst:peers-node"));
        assert_ne!(ContentKey::service(), ContentKey::for_name("/pst"));
    }
}
