//! Error types for peer-registry.

use std::time::Duration;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or invalid configuration. Fatal at init.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network failure that the next scheduled tick may recover from.
    #[error("Network error: {0}")]
    Network(String),

    /// An operation did not finish within its deadline.
    #[error("{op} timed out after {after:?}")]
    Timeout {
        /// Name of the operation that timed out.
        op: &'static str,
        /// The deadline that elapsed.
        after: Duration,
    },

    /// Input rejected by a validator. Never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested record or peer does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation is intentionally unsupported.
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// Persistence layer failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Local discovery (mDNS) failure.
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// JSON encoding or decoding failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Record envelope encoding or decoding failure.
    #[error("Envelope error: {0}")]
    Envelope(#[from] postcard::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The component has been shut down.
    #[error("Component closed")]
    Closed,
}

impl Error {
    /// Create a configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a transient network error.
    pub fn network<S: Into<String>>(msg: S) -> Self {
        Self::Network(msg.into())
    }

    /// Create a validation error.
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a store error.
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    /// Whether a later retry of the same operation might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout { .. } | Self::Io(_))
    }
}

/// Run `fut` under a deadline, mapping expiry to [`Error::Timeout`].
pub(crate) async fn with_timeout<T, F>(op: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout { op, after }),
    }
}
