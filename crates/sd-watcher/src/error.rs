//! Error types for the sd-watcher crate.
//!
//! - [`WatchError`] - construction and shutdown failures, surfaced to the caller
//! - [`CatalogError`] - failed blocking queries, absorbed by the watch loops

use sd_core::ConfigError;

/// Errors surfaced to the caller of the watcher.
///
/// # Error Recovery Strategy
///
/// - **Config** ([`WatchError::Config`]): Fatal - fix the configuration
/// - **Client** ([`WatchError::Client`]): Fatal - the HTTP client could not be built
/// - **Task** ([`WatchError::Task`]): Fatal - the registry task panicked or was aborted
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The catalog HTTP client could not be constructed.
    #[error("failed to build catalog client: {0}")]
    Client(#[source] reqwest::Error),

    /// The registry task did not finish cleanly.
    #[error("registry task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl WatchError {
    /// Returns `true` if this error came from configuration validation.
    #[inline]
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

/// A failed blocking query against the catalog.
///
/// Every variant is transient from the watcher's point of view: the loop that
/// issued the query logs it, waits the fixed retry interval, and tries again.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The request could not be sent or its body could not be decoded.
    #[error("catalog request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The catalog answered with a non-success status.
    #[error("catalog returned HTTP {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, or the canonical reason if the body was empty.
        message: String,
    },

    /// The response had no `X-Consul-Index` header.
    #[error("catalog response is missing the X-Consul-Index header")]
    MissingIndex,

    /// The `X-Consul-Index` header was not a valid index.
    #[error("invalid X-Consul-Index header: {0}")]
    InvalidIndex(String),
}

impl CatalogError {
    /// Creates a new [`CatalogError::Status`] error.
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    /// Returns the HTTP status code, if the catalog answered at all.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::MissingIndex | Self::InvalidIndex(_) => None,
        }
    }
}
