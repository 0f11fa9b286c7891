//! Process-wide default registry.

use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::debug;

use super::{GetOptions, ListOptions, NativeRegistry};
use crate::error::{Error, Result};
use crate::peer::Peer;

static DEFAULT: Lazy<RwLock<Option<Arc<NativeRegistry>>>> = Lazy::new(|| RwLock::new(None));

/// Install `registry` as the default, returning the one it replaces.
pub fn set_default(registry: Arc<NativeRegistry>) -> Option<Arc<NativeRegistry>> {
    debug!(peer = %registry.local_id(), "installing default registry");
    DEFAULT.write().replace(registry)
}

/// The current default registry.
pub fn default_registry() -> Option<Arc<NativeRegistry>> {
    DEFAULT.read().clone()
}

/// Remove the default registry.
pub fn clear_default() -> Option<Arc<NativeRegistry>> {
    DEFAULT.write().take()
}

/// Remove the default when it is `registry`.
pub(crate) fn clear_if(registry: &NativeRegistry) {
    let mut slot = DEFAULT.write();
    if slot
        .as_ref()
        .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), registry))
    {
        slot.take();
    }
}

fn require() -> Result<Arc<NativeRegistry>> {
    default_registry().ok_or_else(|| Error::config("no default registry installed"))
}

/// [`NativeRegistry::get_peer`] on the default registry.
pub async fn get_peer(opts: GetOptions) -> Result<Peer> {
    require()?.get_peer(opts).await
}

/// [`NativeRegistry::list_peers`] on the default registry.
pub async fn list_peers(opts: ListOptions) -> Result<Vec<Peer>> {
    require()?.list_peers(opts).await
}
