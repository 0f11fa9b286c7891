//! Peer identities and the node's signing key.
//!
//! A [`PeerId`] is the raw Ed25519 public key of a node, rendered as
//! lowercase hex. It converts losslessly to the libp2p identity used in
//! `/p2p` address components. The matching [`Keypair`] is loaded from (or
//! generated into) a key file that must live under the process working
//! directory.

use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use libp2p::identity::{self, ed25519};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Length in bytes of an encoded peer identity.
pub const PEER_ID_LEN: usize = 32;

/// Public identity of a peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId {
    key: [u8; PEER_ID_LEN],
    p2p: libp2p::PeerId,
}

impl PeerId {
    /// Build an identity from raw public key bytes, rejecting invalid points.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PEER_ID_LEN {
            return Err(Error::validation(format!("peer id must be {PEER_ID_LEN} bytes")));
        }
        let public = ed25519::PublicKey::try_from_bytes(bytes)
            .map_err(|e| Error::validation(format!("peer id is not a public key: {e}")))?;
        Ok(Self::from_public(&public))
    }

    fn from_public(public: &ed25519::PublicKey) -> Self {
        Self {
            key: public.to_bytes(),
            p2p: identity::PublicKey::from(public.clone()).to_peer_id(),
        }
    }

    /// Recover the identity from a libp2p peer id. Only ids that inline an
    /// Ed25519 key are accepted.
    pub fn from_libp2p(id: &libp2p::PeerId) -> Result<Self> {
        let bytes = id.to_bytes();
        // identity multihash: code 0x00, digest length, protobuf public key
        let [0x00, len, digest @ ..] = bytes.as_slice() else {
            return Err(Error::validation(format!("peer id {id} does not inline its public key")));
        };
        if usize::from(*len) != digest.len() {
            return Err(Error::validation(format!("peer id {id} has a truncated digest")));
        }
        let public = identity::PublicKey::try_decode_protobuf(digest)
            .map_err(|e| Error::validation(format!("peer id {id} holds no public key: {e}")))?
            .try_into_ed25519()
            .map_err(|e| Error::validation(format!("peer id {id} is not ed25519: {e}")))?;
        Ok(Self::from_public(&public))
    }

    /// The same identity as a libp2p peer id.
    pub fn to_libp2p(&self) -> libp2p::PeerId {
        self.p2p
    }

    /// Raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.key
    }

    /// Last `n` characters of the textual form, used in instance names.
    pub fn short(&self, n: usize) -> String {
        let text = self.to_string();
        text[text.len().saturating_sub(n)..].to_string()
    }

    /// Verify an Ed25519 signature made by this identity over `msg`.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<()> {
        let key = VerifyingKey::from_bytes(&self.key)
            .map_err(|e| Error::validation(format!("invalid public key: {e}")))?;
        let sig = Signature::from_slice(signature)
            .map_err(|e| Error::validation(format!("malformed signature: {e}")))?;
        key.verify(msg, &sig)
            .map_err(|_| Error::validation(format!("signature mismatch for {self}")))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.key))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short(8))
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::validation(format!("peer id {s:?} is not hex: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Signing key of the local node.
#[derive(Clone)]
pub struct Keypair {
    secret: SigningKey,
    id: PeerId,
}

impl Keypair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        Self::from_ed25519(ed25519::Keypair::generate())
    }

    /// Build a keypair from a 32-byte secret seed.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(Error::config("identity key must hold a 32 byte secret"));
        }
        let mut seed = bytes.to_vec();
        let secret = ed25519::SecretKey::try_from_bytes(&mut seed)
            .map_err(|e| Error::config(format!("identity key is invalid: {e}")))?;
        Ok(Self::from_ed25519(ed25519::Keypair::from(secret)))
    }

    fn from_ed25519(keypair: ed25519::Keypair) -> Self {
        // secret half first, public half second
        let bytes = keypair.to_bytes();
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes[..32]);
        Self {
            secret: SigningKey::from_bytes(&seed),
            id: PeerId::from_public(&keypair.public()),
        }
    }

    /// Identity derived from the public half.
    pub fn peer_id(&self) -> PeerId {
        self.id
    }

    /// The same key as a libp2p identity, for building a swarm.
    pub fn to_libp2p(&self) -> Result<identity::Keypair> {
        identity::Keypair::ed25519_from_bytes(self.secret.to_bytes())
            .map_err(|e| Error::config(format!("identity key is invalid: {e}")))
    }

    /// Sign `msg` and return the 64 byte signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.secret.sign(msg).to_bytes().to_vec()
    }

    /// Load the key stored at `path`, generating and persisting one if the
    /// file does not exist yet. The path must resolve inside the working
    /// directory.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        let path = resolve_key_path(path)?;

        if path.exists() {
            let text = fs::read_to_string(&path)?;
            let bytes = hex::decode(text.trim())
                .map_err(|e| Error::config(format!("identity key file {} is corrupt: {e}", path.display())))?;
            let keypair = Self::from_secret_bytes(&bytes)?;
            debug!(path = %path.display(), peer_id = %keypair.peer_id(), "loaded identity key");
            return Ok(keypair);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let keypair = Self::generate();
        write_private(&path, hex::encode(keypair.secret.to_bytes()).as_bytes())?;
        info!(path = %path.display(), peer_id = %keypair.peer_id(), "generated new identity key");
        Ok(keypair)
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id())
            .finish_non_exhaustive()
    }
}

fn resolve_key_path(path: &Path) -> Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(Error::config("identity key path escapes the filesystem root"));
                }
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }

    if !normalized.starts_with(&cwd) {
        return Err(Error::config(format!(
            "identity key path {} is outside the working directory",
            path.display()
        )));
    }
    Ok(normalized)
}

#[cfg(unix)]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)?;
    Ok(())
}
