//! Error types for the sd-core crate.
//!
//! This module provides the [`ConfigError`] type for configuration errors
//! that are detected before any watching starts.

/// Errors that can occur while loading or validating configuration.
///
/// Every variant is fatal at construction time: the watcher refuses to start
/// rather than running against an unusable catalog address.
///
/// # Examples
///
/// ```
/// use sd_core::ConfigError;
///
/// let error = ConfigError::NoAddress;
/// assert_eq!(error.to_string(), "no Consul address specified");
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The address list is empty.
    #[error("no Consul address specified")]
    NoAddress,

    /// The catalog address could not be parsed into an HTTP endpoint.
    #[error("invalid Consul address '{address}': {reason}")]
    InvalidAddress {
        /// The address as configured.
        address: String,
        /// Explanation of why the address is invalid.
        reason: String,
    },

    /// A configuration option has an invalid value.
    #[error("invalid configuration option '{option}': {reason}")]
    InvalidOption {
        /// The name of the invalid option.
        option: String,
        /// Explanation of why the option is invalid.
        reason: String,
    },

    /// An I/O error occurred while reading configuration.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    /// Creates a new [`ConfigError::InvalidAddress`] error.
    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    /// Creates a new [`ConfigError::InvalidOption`] error.
    pub fn invalid_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            option: option.into(),
            reason: reason.into(),
        }
    }
}
