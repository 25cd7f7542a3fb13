//! Configuration structures for the service-discovery watcher.
//!
//! - [`RegistryConfig`] - Catalog address, watched tags, and long-poll timing
//! - [`Config`] - Root configuration, loadable from a JSON file
//!
//! All configuration types implement [`Default`]. The defaults match the
//! Consul blocking-query conventions the watcher was built around: a 30 second
//! long-poll wait and a fixed 15 second retry interval after a failed query.

use std::time::Duration;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default long-poll wait passed to every blocking query, in seconds.
pub const DEFAULT_WATCH_TIMEOUT_SECS: u64 = 30;

/// Default delay before retrying a failed query, in seconds.
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 15;

/// Default capacity of the consumer event channel.
pub const DEFAULT_EVENT_BUFFER: usize = 100;

/// Configuration for the catalog registry.
///
/// # Examples
///
/// ```
/// use sd_core::RegistryConfig;
///
/// let config = RegistryConfig::new(["127.0.0.1:8500"], ["prod"]);
/// assert_eq!(config.primary_address(), Some("127.0.0.1:8500"));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Catalog agent addresses. Only the first one is used.
    pub addresses: Vec<String>,

    /// Tags to watch. A service is watched if any of its tags is listed here.
    pub tags_to_watch: Vec<String>,

    /// Datacenter to query. `None` uses the agent's own datacenter.
    pub datacenter: Option<String>,

    /// ACL token sent with every request.
    pub token: Option<String>,

    /// Maximum time a blocking query may wait for a change, in seconds.
    pub watch_timeout_secs: u64,

    /// Fixed delay before retrying a failed query, in seconds.
    pub retry_interval_secs: u64,

    /// Capacity of the channel delivering events to the consumer.
    pub event_buffer: usize,
}

impl RegistryConfig {
    /// Creates a configuration with the given addresses and tags and default
    /// timing.
    #[must_use]
    pub fn new<A, T>(addresses: A, tags_to_watch: T) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        T: IntoIterator,
        T::Item: Into<String>,
    {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
            tags_to_watch: tags_to_watch.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Returns the address the watcher connects to.
    #[must_use]
    pub fn primary_address(&self) -> Option<&str> {
        self.addresses.first().map(String::as_str)
    }

    /// Returns the long-poll wait as a [`Duration`].
    #[inline]
    #[must_use]
    pub const fn watch_timeout(&self) -> Duration {
        Duration::from_secs(self.watch_timeout_secs)
    }

    /// Returns the retry interval as a [`Duration`].
    #[inline]
    #[must_use]
    pub const fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Checks that the configuration can be used to start watching.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoAddress`] if no address is configured, or
    /// [`ConfigError::InvalidOption`] for a zero timeout, retry interval, or
    /// event buffer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addresses.is_empty() {
            return Err(ConfigError::NoAddress);
        }
        if self.watch_timeout_secs == 0 {
            return Err(ConfigError::invalid_option(
                "watch_timeout_secs",
                "must be greater than zero",
            ));
        }
        if self.retry_interval_secs == 0 {
            return Err(ConfigError::invalid_option(
                "retry_interval_secs",
                "must be greater than zero",
            ));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::invalid_option(
                "event_buffer",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            tags_to_watch: Vec::new(),
            datacenter: None,
            token: None,
            watch_timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS,
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

/// Root configuration for the watcher.
///
/// # Examples
///
/// ```
/// use sd_core::Config;
///
/// let config: Config = serde_json::from_str(r#"{"registry": {"tags_to_watch": ["prod"]}}"#).unwrap();
/// assert_eq!(config.registry.tags_to_watch, vec!["prod"]);
/// assert_eq!(config.registry.watch_timeout_secs, 30);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Catalog registry configuration.
    pub registry: RegistryConfig,
}

impl Config {
    /// Loads a configuration from a JSON file.
    ///
    /// Missing fields fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Parse`] if it is not valid JSON.
    pub fn from_file(path: &Utf8Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}
