//! The catalog registry: watch loops and event dispatch.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐  CatalogChange   ┌──────────────┐  ServiceUpdate
//! │ watch_catalog      │ ───────────────► │ Dispatcher   │ ─────────────────► consumer
//! │ (services long-poll)│  bounded (16)    │ (Registry::  │  NEW / DELETED        ▲
//! └─────────┬──────────┘                  │  run)        │                       │
//!           │ insert / detach             └──────┬───────┘                       │
//!           ▼                                    │ spawns, one per service       │
//! ┌────────────────────┐  update + emit   ┌──────▼───────┐  CHANGED              │
//! │ ServiceCache       │ ◄─────────────── │ watch_service│ ──────────────────────┘
//! │ (single lock)      │  under the lock  │ (instances   │
//! └────────────────────┘                  │  long-poll)  │
//!                                         └──────────────┘
//! ```
//!
//! # Long-poll state machine
//!
//! Both loops run the same three-way branch on every query result:
//!
//! - **error**: log, wait the fixed retry interval, query again with the same index
//! - **same index**: the wait elapsed with nothing new, query again immediately
//! - **new index**: remember it and process the data
//!
//! # Shutdown
//!
//! When the shutdown token fires (or the consumer drops its receiver) the
//! dispatcher stops taking catalog changes, cancels every cached record, waits
//! for every service loop and the catalog loop to exit, and only then drops
//! the last event sender. The consumer therefore sees its channel close
//! exactly once, after all teardown.

use std::sync::Arc;
use std::time::Duration;

use sd_core::{RegistryConfig, ServiceUpdate};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheGuard, RunState, ServiceCache, ServiceHandle};
use crate::catalog::{CatalogClient, ServiceTags, build_instance_map};
use crate::consul::ConsulClient;
use crate::error::WatchError;
use crate::filter::TagFilter;

/// Capacity of the channel between the catalog loop and the dispatcher.
pub const DISPATCH_CAPACITY: usize = 16;

/// Long-poll timing shared by every loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchTiming {
    /// Maximum wait of one blocking query.
    pub watch_timeout: Duration,
    /// Delay before retrying a failed query.
    pub retry_interval: Duration,
}

impl WatchTiming {
    /// Reads the timing from the configuration.
    #[must_use]
    pub const fn from_config(config: &RegistryConfig) -> Self {
        Self {
            watch_timeout: config.watch_timeout(),
            retry_interval: config.retry_interval(),
        }
    }
}

/// A catalog change handed from the catalog loop to the dispatcher.
#[derive(Debug)]
enum CatalogChange {
    /// A tag-matching service appeared and was cached.
    Discovered(Arc<ServiceHandle>),
    /// A cached service left the catalog and was detached from the cache.
    Removed(Arc<ServiceHandle>),
}

/// A catalog-backed service registry.
///
/// [`run`](Self::run) drives the whole watcher until shutdown. Most callers
/// use [`RegistryWatcher`](crate::RegistryWatcher), which runs it on a task
/// and owns the event receiver.
#[derive(Debug)]
pub struct Registry<C> {
    client: Arc<C>,
    cache: Arc<ServiceCache>,
    filter: TagFilter,
    timing: WatchTiming,
}

impl Registry<ConsulClient> {
    /// Creates a registry backed by the Consul agent at the first configured
    /// address.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Config`] if the configuration is invalid (for
    /// example no address) or [`WatchError::Client`] if the HTTP client
    /// cannot be built.
    pub fn new(config: &RegistryConfig) -> Result<Self, WatchError> {
        config.validate()?;
        let client = ConsulClient::from_config(config)?;
        Ok(Self::with_client(Arc::new(client), config))
    }
}

impl<C: CatalogClient> Registry<C> {
    /// Creates a registry over any catalog client.
    #[must_use]
    pub fn with_client(client: Arc<C>, config: &RegistryConfig) -> Self {
        Self {
            client,
            cache: Arc::new(ServiceCache::new()),
            filter: TagFilter::new(config.tags_to_watch.iter().cloned()),
            timing: WatchTiming::from_config(config),
        }
    }

    /// Returns the cache of watched services.
    #[must_use]
    pub fn cache(&self) -> Arc<ServiceCache> {
        Arc::clone(&self.cache)
    }

    /// Runs the watcher until `shutdown` fires or `upstream` is closed.
    ///
    /// Events are sent on `upstream`. The sender is dropped when this future
    /// completes, after every watch loop has exited.
    pub async fn run(self, upstream: mpsc::Sender<ServiceUpdate>, shutdown: CancellationToken) {
        if self.filter.is_empty() {
            warn!("No tags to watch configured, no service will be watched");
        }
        info!(tags = ?self.filter.iter().collect::<Vec<_>>(), "Registry started");

        // Cancelled by the caller, or by the dispatcher when the consumer is gone.
        let stop = shutdown.child_token();
        let (change_tx, change_rx) = mpsc::channel(DISPATCH_CAPACITY);

        let catalog_task = tokio::spawn(watch_catalog(
            Arc::clone(&self.client),
            Arc::clone(&self.cache),
            self.filter,
            change_tx,
            stop.clone(),
            self.timing,
        ));

        let mut dispatcher = Dispatcher {
            client: self.client,
            cache: self.cache,
            upstream,
            stop,
            timing: self.timing,
            tasks: JoinSet::new(),
        };
        dispatcher.run(change_rx).await;
        dispatcher.shutdown().await;

        if let Err(err) = catalog_task.await {
            warn!(error = %err, "Catalog watch task failed");
        }
        // Last sender goes here, once nothing is left running.
        drop(dispatcher);
        info!("Registry stopped");
    }
}

/// Consumes catalog changes, starts and stops service loops, and forwards
/// `NEW` and `DELETED` events.
struct Dispatcher<C> {
    client: Arc<C>,
    cache: Arc<ServiceCache>,
    upstream: mpsc::Sender<ServiceUpdate>,
    stop: CancellationToken,
    timing: WatchTiming,
    tasks: JoinSet<()>,
}

impl<C: CatalogClient> Dispatcher<C> {
    async fn run(&mut self, mut changes: mpsc::Receiver<CatalogChange>) {
        loop {
            tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                () = self.upstream.closed() => {
                    info!("Event receiver dropped, stopping registry");
                    self.stop.cancel();
                    break;
                }
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(err) = result {
                        warn!(error = %err, "Service watch task failed");
                    }
                }
                change = changes.recv() => match change {
                    Some(change) => self.dispatch(change).await,
                    None => break,
                },
            }
        }
    }

    async fn dispatch(&mut self, change: CatalogChange) {
        match change {
            CatalogChange::Removed(handle) => {
                handle.cancel();
                info!(service = handle.name(), tag = handle.tag(), "Service removed");
                self.emit(ServiceUpdate::deleted(handle.name(), handle.tag()))
                    .await;
            }
            CatalogChange::Discovered(handle) => {
                // A service loop may hold the lock while parked on a full channel.
                let state = tokio::select! {
                    biased;
                    () = self.stop.cancelled() => return,
                    mut guard = self.cache.lock() => guard.mark_running(&handle),
                };
                match state {
                    RunState::AlreadyRunning => {}
                    RunState::Detached => {
                        // Its removal is queued right behind; report both.
                        debug!(service = handle.name(), "Service left the catalog before its watch started");
                        self.emit(ServiceUpdate::new(handle.name(), handle.tag()))
                            .await;
                    }
                    RunState::Started => {
                        info!(service = handle.name(), tag = handle.tag(), "Service discovered");
                        // NEW goes out before the loop exists, so it precedes every CHANGED.
                        if self
                            .emit(ServiceUpdate::new(handle.name(), handle.tag()))
                            .await
                        {
                            self.tasks.spawn(watch_service(
                                Arc::clone(&self.client),
                                Arc::clone(&self.cache),
                                handle,
                                self.upstream.clone(),
                                self.timing,
                            ));
                        }
                    }
                }
            }
        }
    }

    /// Sends an event to the consumer. Returns `false` if the registry is
    /// stopping, in which case the event was not delivered.
    async fn emit(&self, update: ServiceUpdate) -> bool {
        tokio::select! {
            biased;
            () = self.stop.cancelled() => false,
            sent = self.upstream.send(update) => {
                if sent.is_err() {
                    info!("Event receiver dropped, stopping registry");
                    self.stop.cancel();
                }
                sent.is_ok()
            }
        }
    }

    async fn shutdown(&mut self) {
        self.stop.cancel();
        // Releases any service loop parked on a full consumer channel.
        self.cache.close();
        let cancelled = self.cache.lock().await.cancel_all();
        debug!(cancelled, "Cancelled cached services");

        while let Some(result) = self.tasks.join_next().await {
            if let Err(err) = result {
                warn!(error = %err, "Service watch task failed");
            }
        }
    }
}

/// Waits `delay` unless `cancel` fires first. Returns `true` if cancelled.
async fn backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}

/// Watches the service listing and reconciles it into the cache.
async fn watch_catalog<C: CatalogClient>(
    client: Arc<C>,
    cache: Arc<ServiceCache>,
    filter: TagFilter,
    changes: mpsc::Sender<CatalogChange>,
    stop: CancellationToken,
    timing: WatchTiming,
) {
    let mut last_index = 0;
    loop {
        let result = tokio::select! {
            biased;
            () = stop.cancelled() => return,
            result = client.list_services(last_index, timing.watch_timeout) => result,
        };

        let catalog = match result {
            Ok(catalog) => catalog,
            Err(err) => {
                warn!(error = %err, status = err.status_code(), retry_in = ?timing.retry_interval, "Error refreshing service list");
                if backoff(timing.retry_interval, &stop).await {
                    return;
                }
                continue;
            }
        };

        if catalog.index == last_index {
            trace!(index = last_index, "Service list unchanged");
            continue;
        }
        last_index = catalog.index;
        debug!(index = last_index, services = catalog.value.len(), "Service list changed");

        let batch = {
            let mut guard = cache.lock().await;
            if stop.is_cancelled() {
                return;
            }
            reconcile(&mut guard, &filter, &catalog.value)
        };

        for change in batch {
            tokio::select! {
                biased;
                () = stop.cancelled() => return,
                sent = changes.send(change) => if sent.is_err() {
                    return;
                },
            }
        }
    }
}

/// Applies one service listing to the cache and returns the resulting changes.
fn reconcile(guard: &mut CacheGuard<'_>, filter: &TagFilter, services: &ServiceTags) -> Vec<CatalogChange> {
    let mut changes = Vec::new();

    for (name, tags) in services {
        let Some(tag) = filter.select_tag(tags) else {
            continue;
        };
        if let Some(handle) = guard.insert_if_absent(name, tag) {
            changes.push(CatalogChange::Discovered(handle));
        }
    }

    changes.extend(
        guard
            .detach_missing(services)
            .into_iter()
            .map(CatalogChange::Removed),
    );
    changes
}

/// Watches the instances of one service until its record is cancelled.
async fn watch_service<C: CatalogClient>(
    client: Arc<C>,
    cache: Arc<ServiceCache>,
    handle: Arc<ServiceHandle>,
    upstream: mpsc::Sender<ServiceUpdate>,
    timing: WatchTiming,
) {
    debug!(service = handle.name(), "Service watch started");
    let mut last_index = 0;

    loop {
        let result = tokio::select! {
            biased;
            () = handle.cancelled() => break,
            result = client.list_instances(handle.name(), last_index, timing.watch_timeout) => result,
        };

        let nodes = match result {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(service = handle.name(), error = %err, status = err.status_code(), retry_in = ?timing.retry_interval, "Error refreshing service");
                let cancelled = tokio::select! {
                    () = handle.cancelled() => true,
                    () = tokio::time::sleep(timing.retry_interval) => false,
                };
                if cancelled {
                    break;
                }
                continue;
            }
        };

        if nodes.index == last_index {
            trace!(service = handle.name(), index = last_index, "Instances unchanged");
            continue;
        }
        last_index = nodes.index;
        let instances = build_instance_map(&nodes.value);

        let mut guard = cache.lock().await;
        let Some(update) = guard.update_instances(&handle, last_index, instances) else {
            // Cancelled, or detached and about to be.
            continue;
        };
        debug!(service = handle.name(), index = last_index, instances = update.instances.len(), "Instances changed");

        // The guard stays held across the send: a record cannot be cancelled
        // between the check above and this emit.
        tokio::select! {
            biased;
            () = handle.cancelled() => break,
            sent = upstream.send(update) => if sent.is_err() {
                break;
            },
        }
        drop(guard);
    }

    debug!(service = handle.name(), "Service watch stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCatalog, node};
    use sd_core::UpdateKind;
    use tokio::task::JoinHandle;
    use tokio::time::{Instant, timeout};

    /// Generous virtual-time budget for an expected event.
    const EVENT_WAIT: Duration = Duration::from_secs(600);

    /// Virtual time with no event that counts as "nothing more happens".
    const QUIET_WAIT: Duration = Duration::from_secs(120);

    struct Harness {
        catalog: Arc<MockCatalog>,
        cache: Arc<ServiceCache>,
        events: mpsc::Receiver<ServiceUpdate>,
        shutdown: CancellationToken,
        task: JoinHandle<()>,
    }

    fn start(tags: &[&str]) -> Harness {
        start_with(Arc::new(MockCatalog::new()), tags)
    }

    fn start_with(catalog: Arc<MockCatalog>, tags: &[&str]) -> Harness {
        let config = RegistryConfig::new(["127.0.0.1:8500"], tags.iter().copied());
        let registry = Registry::with_client(Arc::clone(&catalog), &config);
        let cache = registry.cache();
        let (tx, events) = mpsc::channel(16);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(registry.run(tx, shutdown.clone()));
        Harness {
            catalog,
            cache,
            events,
            shutdown,
            task,
        }
    }

    impl Harness {
        async fn next(&mut self) -> ServiceUpdate {
            timeout(EVENT_WAIT, self.events.recv())
                .await
                .expect("timed out waiting for an event")
                .expect("event channel closed")
        }

        async fn assert_quiet(&mut self) {
            if let Ok(event) = timeout(QUIET_WAIT, self.events.recv()).await {
                panic!("unexpected event: {event:?}");
            }
        }

        async fn stop(mut self) -> Vec<ServiceUpdate> {
            self.shutdown.cancel();
            let mut drained = Vec::new();
            while let Some(event) = self.events.recv().await {
                drained.push(event);
            }
            self.task.await.expect("registry task panicked");
            drained
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_lifecycle_new_changed_deleted() {
        let mut h = start(&["prod"]);
        h.catalog.set_services(1, &[("web", &["prod"])]);

        let event = h.next().await;
        assert_eq!(event.kind, UpdateKind::New);
        assert_eq!(event.service_name, "web");
        assert_eq!(event.tag, "prod");
        assert!(event.instances.is_empty());

        h.catalog
            .set_instances("web", 7, vec![node("node-1", "10.0.0.5", 8080)]);
        let event = h.next().await;
        assert_eq!(event.kind, UpdateKind::Changed);
        assert_eq!(event.service_name, "web");
        assert_eq!(event.instances.len(), 1);
        let instance = &event.instances["10.0.0.5:8080"];
        assert_eq!(instance.port, 8080);
        assert_eq!(instance.host, "node-1");

        h.catalog.set_services(2, &[]);
        let event = h.next().await;
        assert_eq!(event.kind, UpdateKind::Deleted);
        assert_eq!(event.service_name, "web");
        assert_eq!(event.tag, "prod");

        h.assert_quiet().await;
        assert!(h.cache.is_empty().await);
        assert!(h.stop().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_service_is_never_watched() {
        let mut h = start(&["prod"]);
        h.catalog
            .set_services(1, &[("db", &["internal"]), ("cache", &[])]);

        h.assert_quiet().await;
        assert!(h.cache.is_empty().await);
        assert_eq!(h.catalog.max_in_flight("db"), 0);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_matching_tag_is_used() {
        let mut h = start(&["prod", "canary"]);
        h.catalog.set_services(1, &[("web", &["v2", "canary", "prod"])]);

        let event = h.next().await;
        assert_eq!(event.kind, UpdateKind::New);
        assert_eq!(event.tag, "canary");
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_index_emits_nothing() {
        let mut h = start(&["prod"]);
        h.catalog.set_services(1, &[("web", &["prod"])]);
        assert_eq!(h.next().await.kind, UpdateKind::New);

        h.catalog
            .set_instances("web", 3, vec![node("node-1", "10.0.0.5", 8080)]);
        assert_eq!(h.next().await.kind, UpdateKind::Changed);

        // Same index again: the parked queries wake up and see nothing new.
        h.catalog
            .set_instances("web", 3, vec![node("node-2", "10.0.0.9", 9090)]);
        h.catalog.touch();
        h.assert_quiet().await;

        let snapshot = h.cache.snapshot("web").await.expect("web is cached");
        assert_eq!(snapshot.last_index, 3);
        assert!(snapshot.instances.contains_key("10.0.0.5:8080"));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_changed_after_deleted_with_poll_in_flight() {
        let mut h = start(&["prod"]);
        h.catalog.set_services(1, &[("web", &["prod"])]);
        assert_eq!(h.next().await.kind, UpdateKind::New);

        // Let the service loop park on its blocking query.
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.catalog.in_flight("web"), 1);

        h.catalog.set_services(2, &[]);
        assert_eq!(h.next().await.kind, UpdateKind::Deleted);

        h.catalog
            .set_instances("web", 9, vec![node("node-1", "10.0.0.5", 8080)]);
        h.assert_quiet().await;
        assert_eq!(h.catalog.in_flight("web"), 0);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_watch_loop_per_service() {
        let mut h = start(&["prod"]);
        h.catalog
            .set_services(1, &[("web", &["prod"]), ("api", &["prod"])]);

        let mut new_events = 0;
        for _ in 0..2 {
            assert_eq!(h.next().await.kind, UpdateKind::New);
            new_events += 1;
        }

        // The listing keeps moving but the services stay the same.
        for index in 2..6 {
            h.catalog
                .set_services(index, &[("web", &["prod"]), ("api", &["prod", "v2"])]);
            h.catalog
                .set_instances("web", index, vec![node("node-1", "10.0.0.5", 8080)]);
            let event = h.next().await;
            assert_eq!(event.kind, UpdateKind::Changed);
            assert_eq!(event.service_name, "web");
        }

        h.assert_quiet().await;
        assert_eq!(new_events, 2);
        assert_eq!(h.catalog.max_in_flight("web"), 1);
        assert_eq!(h.catalog.max_in_flight("api"), 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_readded_service_gets_new_record() {
        let mut h = start(&["prod"]);
        h.catalog.set_services(1, &[("web", &["prod"])]);
        assert_eq!(h.next().await.kind, UpdateKind::New);

        h.catalog.set_services(2, &[]);
        assert_eq!(h.next().await.kind, UpdateKind::Deleted);

        h.catalog.set_services(3, &[("web", &["prod"])]);
        assert_eq!(h.next().await.kind, UpdateKind::New);

        h.catalog
            .set_instances("web", 4, vec![node("node-1", "10.0.0.5", 8080)]);
        assert_eq!(h.next().await.kind, UpdateKind::Changed);
        assert_eq!(h.catalog.max_in_flight("web"), 1);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_catalog_errors_retry_after_interval() {
        let catalog = Arc::new(MockCatalog::new());
        catalog.fail_services(2);
        catalog.set_services(1, &[("web", &["prod"])]);

        let started = Instant::now();
        let mut h = start_with(catalog, &["prod"]);
        assert_eq!(h.next().await.kind, UpdateKind::New);

        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(h.catalog.service_calls() >= 3);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_errors_retry_after_interval() {
        let mut h = start(&["prod"]);
        h.catalog.fail_instances(1);
        h.catalog
            .set_instances("web", 5, vec![node("node-1", "10.0.0.5", 8080)]);
        h.catalog.set_services(1, &[("web", &["prod"])]);
        assert_eq!(h.next().await.kind, UpdateKind::New);

        let started = Instant::now();
        let event = h.next().await;
        assert_eq!(event.kind, UpdateKind::Changed);
        assert!(started.elapsed() >= Duration::from_secs(15));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_every_record_before_close() {
        let mut h = start(&["prod"]);
        h.catalog
            .set_services(1, &[("web", &["prod"]), ("api", &["prod"])]);
        assert_eq!(h.next().await.kind, UpdateKind::New);
        assert_eq!(h.next().await.kind, UpdateKind::New);
        tokio::time::sleep(Duration::from_secs(1)).await;

        let cache = Arc::clone(&h.cache);
        let catalog = Arc::clone(&h.catalog);
        let drained = h.stop().await;
        assert!(drained.is_empty());

        let snapshots = cache.snapshots().await;
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.iter().all(|s| s.cancelled));
        assert_eq!(catalog.in_flight("web"), 0);
        assert_eq!(catalog.in_flight("api"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_with_blocked_consumer() {
        let catalog = Arc::new(MockCatalog::new());
        let config = RegistryConfig::new(["127.0.0.1:8500"], ["prod"]);
        let registry = Registry::with_client(Arc::clone(&catalog), &config);
        let (tx, mut events) = mpsc::channel(1);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(registry.run(tx, shutdown.clone()));

        catalog.set_services(1, &[("web", &["prod"]), ("api", &["prod"])]);
        // Nobody reads: the channel fills and the registry blocks on it.
        tokio::time::sleep(Duration::from_secs(5)).await;

        shutdown.cancel();
        timeout(EVENT_WAIT, task)
            .await
            .expect("registry did not stop")
            .expect("registry task panicked");
        while events.recv().await.is_some() {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_receiver_stops_registry() {
        let h = start(&["prod"]);
        let Harness {
            catalog,
            events,
            task,
            ..
        } = h;
        drop(events);

        catalog.set_services(1, &[("web", &["prod"])]);
        timeout(EVENT_WAIT, task)
            .await
            .expect("registry did not stop")
            .expect("registry task panicked");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_receiver_after_new_stops_registry() {
        let mut h = start(&["prod"]);
        h.catalog.set_services(1, &[("web", &["prod"])]);
        assert_eq!(h.next().await.kind, UpdateKind::New);

        let Harness {
            catalog,
            events,
            task,
            ..
        } = h;
        drop(events);

        // Only instance traffic from here on; the catalog listing stays put.
        catalog.set_instances("web", 7, vec![node("node-1", "10.0.0.5", 8080)]);
        timeout(EVENT_WAIT, task)
            .await
            .expect("registry did not stop")
            .expect("registry task panicked");
        assert_eq!(catalog.in_flight("web"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detached_before_dispatch_reports_new_then_deleted() {
        let catalog = Arc::new(MockCatalog::new());
        let cache = Arc::new(ServiceCache::new());
        let (upstream, mut events) = mpsc::channel(4);
        let mut dispatcher = Dispatcher {
            client: Arc::clone(&catalog),
            cache: Arc::clone(&cache),
            upstream,
            stop: CancellationToken::new(),
            timing: WatchTiming {
                watch_timeout: Duration::from_secs(30),
                retry_interval: Duration::from_secs(15),
            },
            tasks: JoinSet::new(),
        };

        // Discovered and removed by two catalog batches before dispatch ran.
        let handle = {
            let mut guard = cache.lock().await;
            let handle = guard
                .insert_if_absent("web", "prod")
                .expect("web is new");
            let removed = guard.detach_missing(&ServiceTags::default());
            assert_eq!(removed.len(), 1);
            handle
        };

        dispatcher
            .dispatch(CatalogChange::Discovered(Arc::clone(&handle)))
            .await;
        dispatcher.dispatch(CatalogChange::Removed(handle)).await;

        let first = events.try_recv().expect("NEW expected");
        assert_eq!(first.kind, UpdateKind::New);
        assert_eq!(first.service_name, "web");
        let second = events.try_recv().expect("DELETED expected");
        assert_eq!(second.kind, UpdateKind::Deleted);
        assert!(events.try_recv().is_err());

        assert!(dispatcher.tasks.is_empty());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(catalog.max_in_flight("web"), 0);
        assert!(cache.is_empty().await);
    }
}
