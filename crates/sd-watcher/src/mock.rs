//! In-memory catalog with blocking-query semantics, for tests.
//!
//! Queries return immediately when the caller's index is stale and otherwise
//! park until the catalog changes or the wait elapses, like Consul does. The
//! catalog also records how many `list_instances` calls are in flight per
//! service so tests can assert that no service is ever watched twice.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::sync::watch;

use crate::catalog::{CatalogClient, CatalogNode, Indexed, ServiceTags};
use crate::error::CatalogError;

#[derive(Debug, Default)]
struct MockState {
    services_index: u64,
    services: ServiceTags,
    instances: FxHashMap<String, (u64, Vec<CatalogNode>)>,
    service_failures: usize,
    instance_failures: usize,
    service_calls: usize,
    in_flight: FxHashMap<String, usize>,
    max_in_flight: FxHashMap<String, usize>,
}

#[derive(Debug)]
pub(crate) struct MockCatalog {
    state: Mutex<MockState>,
    changed: watch::Sender<u64>,
}

impl MockCatalog {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            changed: watch::Sender::new(0),
        }
    }

    /// Replaces the service listing and moves its index to `index`.
    pub(crate) fn set_services(&self, index: u64, services: &[(&str, &[&str])]) {
        {
            let mut state = self.state.lock();
            state.services_index = index;
            state.services = services
                .iter()
                .map(|(name, tags)| {
                    (
                        (*name).to_owned(),
                        tags.iter().map(|t| (*t).to_owned()).collect(),
                    )
                })
                .collect();
        }
        self.notify();
    }

    /// Replaces the registrations of one service and moves its index.
    pub(crate) fn set_instances(&self, service: &str, index: u64, nodes: Vec<CatalogNode>) {
        self.state
            .lock()
            .instances
            .insert(service.to_owned(), (index, nodes));
        self.notify();
    }

    /// Wakes every parked query without changing any index.
    pub(crate) fn touch(&self) {
        self.notify();
    }

    /// Makes the next `count` service listings fail.
    pub(crate) fn fail_services(&self, count: usize) {
        self.state.lock().service_failures = count;
    }

    /// Makes the next `count` instance listings fail.
    pub(crate) fn fail_instances(&self, count: usize) {
        self.state.lock().instance_failures = count;
    }

    pub(crate) fn service_calls(&self) -> usize {
        self.state.lock().service_calls
    }

    pub(crate) fn in_flight(&self, service: &str) -> usize {
        self.state.lock().in_flight.get(service).copied().unwrap_or(0)
    }

    pub(crate) fn max_in_flight(&self, service: &str) -> usize {
        self.state
            .lock()
            .max_in_flight
            .get(service)
            .copied()
            .unwrap_or(0)
    }

    fn notify(&self) {
        self.changed.send_modify(|version| *version += 1);
    }

    fn current_instances(&self, service: &str) -> Indexed<Vec<CatalogNode>> {
        let state = self.state.lock();
        state
            .instances
            .get(service)
            .map_or_else(|| Indexed::new(0, Vec::new()), |(index, nodes)| {
                Indexed::new(*index, nodes.clone())
            })
    }
}

/// Decrements the in-flight counter even when the query future is dropped.
struct InFlight<'a> {
    catalog: &'a MockCatalog,
    service: String,
}

impl<'a> InFlight<'a> {
    fn enter(catalog: &'a MockCatalog, service: &str) -> Self {
        let mut state = catalog.state.lock();
        let active = state.in_flight.entry(service.to_owned()).or_default();
        *active += 1;
        let active = *active;
        let max = state.max_in_flight.entry(service.to_owned()).or_default();
        *max = (*max).max(active);
        Self {
            catalog,
            service: service.to_owned(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(active) = self.catalog.state.lock().in_flight.get_mut(&self.service) {
            *active = active.saturating_sub(1);
        }
    }
}

#[async_trait]
impl CatalogClient for MockCatalog {
    async fn list_services(
        &self,
        last_index: u64,
        max_wait: Duration,
    ) -> Result<Indexed<ServiceTags>, CatalogError> {
        let mut changed = self.changed.subscribe();
        {
            let mut state = self.state.lock();
            state.service_calls += 1;
            if state.service_failures > 0 {
                state.service_failures -= 1;
                return Err(CatalogError::status(500, "injected failure"));
            }
            if state.services_index != last_index {
                return Ok(Indexed::new(state.services_index, state.services.clone()));
            }
        }

        let _ = tokio::time::timeout(max_wait, changed.changed()).await;
        let state = self.state.lock();
        Ok(Indexed::new(state.services_index, state.services.clone()))
    }

    async fn list_instances(
        &self,
        service: &str,
        last_index: u64,
        max_wait: Duration,
    ) -> Result<Indexed<Vec<CatalogNode>>, CatalogError> {
        let _in_flight = InFlight::enter(self, service);
        let mut changed = self.changed.subscribe();
        {
            let mut state = self.state.lock();
            if state.instance_failures > 0 {
                state.instance_failures -= 1;
                return Err(CatalogError::status(500, "injected failure"));
            }
        }

        let current = self.current_instances(service);
        if current.index != last_index {
            return Ok(current);
        }

        let _ = tokio::time::timeout(max_wait, changed.changed()).await;
        Ok(self.current_instances(service))
    }
}

pub(crate) fn node(name: &str, address: &str, port: u16) -> CatalogNode {
    CatalogNode {
        node: name.to_owned(),
        address: address.to_owned(),
        service_address: address.to_owned(),
        service_port: port,
        service_tags: vec!["prod".to_owned()],
    }
}
