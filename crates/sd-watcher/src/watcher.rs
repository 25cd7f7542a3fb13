//! Registry watcher with async event streaming.
//!
//! This module provides the [`RegistryWatcher`] type that runs a
//! [`Registry`] on a background task and hands its events to the caller
//! through a bounded channel.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Background Task (tokio::spawn)               │
//! │  ┌──────────────────┐    ┌────────────────┐    ┌────────────┐  │
//! │  │ watch_catalog    │ -> │ Dispatcher     │ -> │ watch_     │  │
//! │  │ (services poll)  │    │ (NEW/DELETED)  │    │ service xN │  │
//! │  └──────────────────┘    └───────┬────────┘    └─────┬──────┘  │
//! └──────────────────────────────────│───────────────────│─────────┘
//!                                    │          send     │
//!                                    ▼                   ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Caller                                       │
//! │  ┌──────────────────┐    ┌────────────────┐                     │
//! │  │ RegistryWatcher  │    │ mpsc::Receiver │ -> event loop       │
//! │  │ (shutdown ctrl)  │    │ (updates)      │                     │
//! │  └──────────────────┘    └────────────────┘                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use sd_core::RegistryConfig;
//! use sd_watcher::RegistryWatcher;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RegistryConfig::new(["127.0.0.1:8500"], ["prod"]);
//!     let mut watcher = RegistryWatcher::new(&config).await?;
//!
//!     while let Some(update) = watcher.recv().await {
//!         println!("{} {} ({})", update.kind, update.service_name, update.tag);
//!     }
//!
//!     Ok(())
//! }
//! ```

use sd_core::{RegistryConfig, ServiceUpdate};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::catalog::CatalogClient;
use crate::error::WatchError;
use crate::registry::Registry;

/// A running registry that streams [`ServiceUpdate`]s to an async context.
///
/// # Lifecycle
///
/// 1. **Creation**: [`RegistryWatcher::new()`] validates the configuration,
///    creates the event channel, and spawns the registry task.
///
/// 2. **Event Reception**: Use [`recv()`](Self::recv) or
///    [`try_recv()`](Self::try_recv). Events of one service arrive in order:
///    `NEW`, any number of `CHANGED`, then `DELETED`.
///
/// 3. **Shutdown**: Call [`shutdown()`](Self::shutdown) to stop every watch
///    loop and wait for them, or drop the watcher, which only signals.
///
/// If the consumer stops receiving for long enough, the channel fills and
/// the watch loops wait for room. Nothing is dropped.
pub struct RegistryWatcher {
    /// Cancelled to stop the registry.
    shutdown: CancellationToken,

    /// Handle to the registry task. Taken on shutdown.
    task: Option<JoinHandle<()>>,

    /// Event receiver for async consumption.
    events: mpsc::Receiver<ServiceUpdate>,
}

impl std::fmt::Debug for RegistryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryWatcher")
            .field("is_running", &self.is_running())
            .field("pending", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl RegistryWatcher {
    /// Starts watching the Consul agent named by `config`.
    ///
    /// The event channel holds `config.event_buffer` updates.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Config`] if the configuration is invalid, or
    /// [`WatchError::Client`] if the HTTP client cannot be built.
    #[allow(clippy::unused_async)] // Async for API consistency with shutdown()
    pub async fn new(config: &RegistryConfig) -> Result<Self, WatchError> {
        let registry = Registry::new(config)?;
        Ok(Self::spawn(registry, config.event_buffer))
    }

    /// Runs an already-built registry on a new task.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn<C: CatalogClient>(registry: Registry<C>, capacity: usize) -> Self {
        let (tx, events) = mpsc::channel(capacity.max(1));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(registry.run(tx, shutdown.clone()));

        Self {
            shutdown,
            task: Some(task),
            events,
        }
    }

    /// Receives the next update.
    ///
    /// Returns `None` once the registry has stopped and every buffered
    /// update has been received.
    pub async fn recv(&mut self) -> Option<ServiceUpdate> {
        self.events.recv().await
    }

    /// Tries to receive an update without waiting.
    pub fn try_recv(&mut self) -> Result<ServiceUpdate, mpsc::error::TryRecvError> {
        self.events.try_recv()
    }

    /// Returns a mutable reference to the event receiver, for use with
    /// `tokio::select!`.
    pub fn events(&mut self) -> &mut mpsc::Receiver<ServiceUpdate> {
        &mut self.events
    }

    /// Returns a token that stops the registry when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Returns `true` if the registry task is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && self.task.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stops the registry and waits until every watch loop has exited.
    ///
    /// Buffered updates are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Task`] if the registry task panicked.
    pub async fn shutdown(mut self) -> Result<(), WatchError> {
        self.shutdown.cancel();
        // Unblocks any loop waiting for room in the channel.
        self.events.close();

        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for RegistryWatcher {
    fn drop(&mut self) {
        // The task notices on its own; Drop cannot await it.
        self.shutdown.cancel();
    }
}
