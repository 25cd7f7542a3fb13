//! The cache of watched services.
//!
//! [`ServiceCache`] maps service names to watched-service records behind a
//! single async lock. The map is never handed out: callers take the lock with
//! [`ServiceCache::lock`] and operate on the returned [`CacheGuard`], whose
//! methods are the only way to read or mutate a record.
//!
//! # Records and handles
//!
//! A record's immutable identity (name, tag, cancellation token) lives in a
//! shared [`ServiceHandle`]. The mutable part (last index, instances, running
//! flag) lives in the map and is only reachable through the guard. Handles
//! are compared by pointer, so a service that is removed and re-added gets a
//! new record that the old watch loop can never touch.
//!
//! # Cancellation
//!
//! Every handle's token is a child of the cache's root token. Removing a
//! service cancels its own token; [`ServiceCache::close`] cancels the root and
//! with it every record at once, without taking the lock.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use sd_core::{InstanceMap, ServiceUpdate};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::catalog::ServiceTags;

/// Identity of one watched-service record.
#[derive(Debug)]
pub struct ServiceHandle {
    name: String,
    tag: String,
    cancel: CancellationToken,
}

impl ServiceHandle {
    /// Name of the service.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Watched tag the service was discovered under.
    #[must_use]
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns `true` once the record has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes when the record is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Cancels the record. Repeated calls have no further effect.
    pub(crate) fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Mutable state of a watched service, guarded by the cache lock.
#[derive(Debug)]
struct WatchedService {
    handle: Arc<ServiceHandle>,
    last_index: u64,
    instances: InstanceMap,
    running: bool,
}

/// Outcome of [`CacheGuard::mark_running`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// The running flag was set by this call; the caller starts the watch loop.
    Started,
    /// A watch loop was already started for this record.
    AlreadyRunning,
    /// The record left the cache before it could be started.
    Detached,
}

/// Point-in-time copy of a cached record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSnapshot {
    /// Name of the service.
    pub name: String,
    /// Watched tag the service was discovered under.
    pub tag: String,
    /// Last instance-list index applied to the record.
    pub last_index: u64,
    /// Current instance set.
    pub instances: InstanceMap,
    /// Whether a watch loop was started for the record.
    pub running: bool,
    /// Whether the record has been cancelled.
    pub cancelled: bool,
}

/// The shared cache of watched services.
#[derive(Debug, Default)]
pub struct ServiceCache {
    services: Mutex<FxHashMap<String, WatchedService>>,
    root: CancellationToken,
}

impl ServiceCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the cache lock.
    pub async fn lock(&self) -> CacheGuard<'_> {
        CacheGuard {
            services: self.services.lock().await,
            root: &self.root,
        }
    }

    /// Cancels every record, present and future, without taking the lock.
    pub fn close(&self) {
        self.root.cancel();
    }

    /// Returns `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Returns a copy of one record.
    pub async fn snapshot(&self, name: &str) -> Option<ServiceSnapshot> {
        self.lock().await.snapshot(name)
    }

    /// Returns copies of every record, sorted by name.
    pub async fn snapshots(&self) -> Vec<ServiceSnapshot> {
        self.lock().await.snapshots()
    }

    /// Returns the number of cached records.
    pub async fn len(&self) -> usize {
        self.lock().await.len()
    }

    /// Returns `true` if no service is cached.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Exclusive access to the cache.
///
/// Holding a guard is what makes a check-then-act sequence atomic with
/// respect to every other watch loop, so callers keep it across the event
/// send whenever the send depends on the check.
#[derive(Debug)]
pub struct CacheGuard<'a> {
    services: MutexGuard<'a, FxHashMap<String, WatchedService>>,
    root: &'a CancellationToken,
}

impl CacheGuard<'_> {
    /// Inserts a new record unless one already exists for `name`.
    ///
    /// Returns the new record's handle, or `None` if the service was already
    /// cached.
    pub fn insert_if_absent(&mut self, name: &str, tag: &str) -> Option<Arc<ServiceHandle>> {
        if self.services.contains_key(name) {
            return None;
        }

        let handle = Arc::new(ServiceHandle {
            name: name.to_owned(),
            tag: tag.to_owned(),
            cancel: self.root.child_token(),
        });
        self.services.insert(
            name.to_owned(),
            WatchedService {
                handle: Arc::clone(&handle),
                last_index: 0,
                instances: InstanceMap::new(),
                running: false,
            },
        );
        Some(handle)
    }

    /// Removes every record whose service is absent from `catalog`.
    ///
    /// Returns the handles of the removed records. Their tokens are left
    /// untouched: cancelling is the dispatcher's job, right before it reports
    /// the deletion.
    pub fn detach_missing(&mut self, catalog: &ServiceTags) -> Vec<Arc<ServiceHandle>> {
        let missing: Vec<String> = self
            .services
            .keys()
            .filter(|name| !catalog.contains_key(name.as_str()))
            .cloned()
            .collect();

        missing
            .into_iter()
            .filter_map(|name| self.services.remove(&name))
            .map(|record| record.handle)
            .collect()
    }

    /// Sets the running flag of the record behind `handle`.
    pub fn mark_running(&mut self, handle: &Arc<ServiceHandle>) -> RunState {
        match self.record_mut(handle) {
            None => RunState::Detached,
            Some(record) if record.running => RunState::AlreadyRunning,
            Some(record) => {
                record.running = true;
                RunState::Started
            }
        }
    }

    /// Replaces the instance set of the record behind `handle`.
    ///
    /// Returns the `CHANGED` event to emit, or `None` if the record was
    /// cancelled or has left the cache, in which case nothing is modified and
    /// nothing may be emitted.
    pub fn update_instances(
        &mut self,
        handle: &Arc<ServiceHandle>,
        index: u64,
        instances: InstanceMap,
    ) -> Option<ServiceUpdate> {
        if handle.is_cancelled() {
            return None;
        }
        let record = self.record_mut(handle)?;
        record.last_index = index;
        record.instances = instances;
        Some(ServiceUpdate::changed(
            handle.name(),
            handle.tag(),
            record.instances.clone(),
        ))
    }

    /// Cancels every cached record. Returns how many were cached.
    pub fn cancel_all(&mut self) -> usize {
        for record in self.services.values() {
            record.handle.cancel();
        }
        self.services.len()
    }

    /// Returns `true` if a record exists for `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.services.contains_key(name)
    }

    /// Returns the number of cached records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Returns `true` if no service is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Returns a copy of one record.
    #[must_use]
    pub fn snapshot(&self, name: &str) -> Option<ServiceSnapshot> {
        self.services.get(name).map(to_snapshot)
    }

    /// Returns copies of every record, sorted by name.
    #[must_use]
    pub fn snapshots(&self) -> Vec<ServiceSnapshot> {
        let mut snapshots: Vec<_> = self.services.values().map(to_snapshot).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    fn record_mut(&mut self, handle: &Arc<ServiceHandle>) -> Option<&mut WatchedService> {
        self.services
            .get_mut(handle.name())
            .filter(|record| Arc::ptr_eq(&record.handle, handle))
    }
}

fn to_snapshot(record: &WatchedService) -> ServiceSnapshot {
    ServiceSnapshot {
        name: record.handle.name.clone(),
        tag: record.handle.tag.clone(),
        last_index: record.last_index,
        instances: record.instances.clone(),
        running: record.running,
        cancelled: record.handle.is_cancelled(),
    }
}
