//! Service instance types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Instances of one service keyed by [`instance_key`].
///
/// Ordered so that consumers rendering backend configuration get a stable
/// iteration order between updates.
pub type InstanceMap = BTreeMap<String, ServiceInstance>;

/// Builds the key identifying an instance within its service.
///
/// # Examples
///
/// ```
/// use sd_core::instance_key;
///
/// assert_eq!(instance_key("10.0.0.5", 8080), "10.0.0.5:8080");
/// ```
#[inline]
#[must_use]
pub fn instance_key(address: &str, port: u16) -> String {
    format!("{address}:{port}")
}

/// One backend endpoint of a service.
///
/// Instances are never patched in place: every refresh of a service produces
/// a complete new [`InstanceMap`].
///
/// # Examples
///
/// ```
/// use sd_core::ServiceInstance;
///
/// let instance = ServiceInstance::new("node-1", "10.0.0.5", 8080).with_tags(["prod"]);
/// assert_eq!(instance.endpoint(), "10.0.0.5:8080");
/// assert!(instance.has_tag("prod"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Name of the node hosting the instance.
    pub host: String,

    /// Network address of the node.
    pub address: String,

    /// Port the service listens on.
    pub port: u16,

    /// Tags registered with this instance.
    pub tags: Vec<String>,
}

impl ServiceInstance {
    /// Creates an instance without tags.
    #[must_use]
    pub fn new(host: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            address: address.into(),
            port,
            tags: Vec::new(),
        }
    }

    /// Replaces the instance tags.
    #[must_use]
    pub fn with_tags<I>(mut self, tags: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Returns `address:port`.
    #[must_use]
    pub fn endpoint(&self) -> String {
        instance_key(&self.address, self.port)
    }

    /// Returns `true` if the instance carries the given tag.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}
