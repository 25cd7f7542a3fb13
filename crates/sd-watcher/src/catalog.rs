//! The blocking-query contract the watch loops run against.
//!
//! A blocking query takes the last index the caller has seen and a maximum
//! wait. The catalog holds the request open until its data moves past that
//! index or the wait elapses:
//!
//! ```text
//! returned index == last index  ──► wait elapsed, nothing changed
//! returned index != last index  ──► data reflects the state at the new index
//! Err(CatalogError)             ──► transient failure, retry after a delay
//! ```
//!
//! [`ConsulClient`](crate::ConsulClient) implements [`CatalogClient`] over
//! the Consul HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use sd_core::{InstanceMap, ServiceInstance, instance_key};
use serde::Deserialize;

use crate::error::CatalogError;

/// Service name to registered tags, as listed by the catalog.
pub type ServiceTags = FxHashMap<String, Vec<String>>;

/// A blocking-query result together with the index it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indexed<T> {
    /// Change index of the returned data.
    pub index: u64,
    /// The data itself.
    pub value: T,
}

impl<T> Indexed<T> {
    /// Pairs a value with its index.
    pub const fn new(index: u64, value: T) -> Self {
        Self { index, value }
    }
}

/// One registration of a service on a catalog node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogNode {
    /// Node name.
    pub node: String,

    /// Node address.
    pub address: String,

    /// Address the service registered with. Empty means "the node address".
    #[serde(default)]
    pub service_address: String,

    /// Port the service registered with.
    pub service_port: u16,

    /// Tags the service registered with.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub service_tags: Vec<String>,
}

impl CatalogNode {
    /// Address the instance is reachable at.
    #[must_use]
    pub fn effective_address(&self) -> &str {
        if self.service_address.is_empty() {
            &self.address
        } else {
            &self.service_address
        }
    }

    /// Key of this registration within its service's [`InstanceMap`].
    #[must_use]
    pub fn instance_key(&self) -> String {
        instance_key(self.effective_address(), self.service_port)
    }

    /// Converts the registration into the consumer-facing instance record.
    #[must_use]
    pub fn to_instance(&self) -> ServiceInstance {
        ServiceInstance::new(&self.node, &self.address, self.service_port)
            .with_tags(self.service_tags.iter().cloned())
    }
}

/// Builds a fresh instance map from a catalog listing.
///
/// The result replaces the previous map wholesale. Two registrations sharing
/// an address and port collapse to the last one listed.
#[must_use]
pub fn build_instance_map(nodes: &[CatalogNode]) -> InstanceMap {
    nodes
        .iter()
        .map(|node| (node.instance_key(), node.to_instance()))
        .collect()
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A catalog that supports blocking queries.
///
/// Implementations must be cheap to share: the watcher holds one instance
/// behind an [`Arc`](std::sync::Arc) and calls it from every watch loop
/// concurrently.
#[async_trait]
pub trait CatalogClient: Send + Sync + 'static {
    /// Lists every service in the catalog with its tags.
    async fn list_services(
        &self,
        last_index: u64,
        max_wait: Duration,
    ) -> Result<Indexed<ServiceTags>, CatalogError>;

    /// Lists every registration of one service.
    async fn list_instances(
        &self,
        service: &str,
        last_index: u64,
        max_wait: Duration,
    ) -> Result<Indexed<Vec<CatalogNode>>, CatalogError>;
}
