//! Record validators installed into the DHT.
//!
//! Every value written under a key is checked by the validator registered
//! for the key's first path segment. [`NamespacedValidator`] performs that
//! dispatch and rejects keys in namespaces it does not know.

use std::collections::HashMap;
use std::sync::Arc;

use crate::codec::{unmarshal_peer, EnvelopeKind, RecordEnvelope};
use crate::error::{Error, Result};
use crate::identity::PeerId;
use crate::keys::{NETWORK_NAMESPACE, PUBLIC_KEY_NAMESPACE};

/// Accepts or rejects a key/value pair before it is stored.
pub trait Validator: Send + Sync + 'static {
    /// Return `Ok` if `value` may be stored under `key`.
    fn validate(&self, key: &str, value: &[u8]) -> Result<()>;
}

/// Split `/<ns>/<rest>` into (`ns`, `rest`).
fn split_key(key: &str) -> Result<(&str, &str)> {
    let body = key
        .strip_prefix('/')
        .ok_or_else(|| Error::validation(format!("key {key:?} must start with '/'")))?;
    body.split_once('/')
        .filter(|(ns, rest)| !ns.is_empty() && !rest.is_empty())
        .ok_or_else(|| Error::validation(format!("key {key:?} must look like /<namespace>/<id>")))
}

/// Validator for peer records under `/pst/<peer-id>`.
#[derive(Debug, Clone)]
pub struct NamespaceValidator {
    namespace: String,
}

impl NamespaceValidator {
    /// Validator for keys under `namespace` (e.g. `/pst`).
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

impl Default for NamespaceValidator {
    fn default() -> Self {
        Self::new(NETWORK_NAMESPACE)
    }
}

impl Validator for NamespaceValidator {
    fn validate(&self, key: &str, value: &[u8]) -> Result<()> {
        let suffix = key
            .strip_prefix(self.namespace.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                Error::validation(format!("key {key:?} is outside namespace {}", self.namespace))
            })?;
        suffix.parse::<PeerId>()?;

        if value.is_empty() {
            return Ok(());
        }
        unmarshal_peer(value).map(|_| ())
    }
}

/// Validator for public keys under `/pk/<peer-id>`.
#[derive(Debug, Clone, Default)]
pub struct PublicKeyValidator;

impl Validator for PublicKeyValidator {
    fn validate(&self, key: &str, value: &[u8]) -> Result<()> {
        let (ns, id) = split_key(key)?;
        if format!("/{ns}") != PUBLIC_KEY_NAMESPACE {
            return Err(Error::validation(format!("key {key:?} is not a public key record")));
        }
        let id: PeerId = id.parse()?;
        let envelope = RecordEnvelope::decode(value)
            .map_err(|e| Error::validation(format!("malformed public key record: {e}")))?;
        if envelope.kind != EnvelopeKind::PublicKey || envelope.data != id.as_bytes() {
            return Err(Error::validation(format!("public key record does not match {id}")));
        }
        Ok(())
    }
}

/// Dispatches to per-namespace validators by the key's first path segment.
#[derive(Clone, Default)]
pub struct NamespacedValidator {
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl NamespacedValidator {
    /// Empty dispatcher; every key is rejected until a namespace is added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Standard layout: `pk` public keys and `pst` peer records.
    pub fn standard() -> Self {
        Self::new()
            .with("pk", PublicKeyValidator)
            .with("pst", NamespaceValidator::default())
    }

    /// Register `validator` for keys starting with `/<namespace>/`.
    pub fn with(mut self, namespace: &str, validator: impl Validator) -> Self {
        self.validators
            .insert(namespace.to_string(), Arc::new(validator));
        self
    }
}

impl std::fmt::Debug for NamespacedValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.validators.keys().collect();
        names.sort();
        f.debug_struct("NamespacedValidator")
            .field("namespaces", &names)
            .finish()
    }
}

impl Validator for NamespacedValidator {
    fn validate(&self, key: &str, value: &[u8]) -> Result<()> {
        let (ns, _) = split_key(key)?;
        match self.validators.get(ns) {
            Some(v) => v.validate(key, value),
            None => Err(Error::validation(format!("no validator for namespace {ns:?}"))),
        }
    }
}
