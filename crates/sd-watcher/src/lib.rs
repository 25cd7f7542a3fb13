//! Consul catalog watcher with long-poll loops and async event streaming.
//!
//! This crate watches a Consul catalog with blocking queries and reports the
//! lifecycle of every service that carries an allow-listed tag.
//!
//! # Overview
//!
//! The sd-watcher crate is designed to:
//!
//! - Long-poll the service listing and start one watch loop per matching service
//! - Long-poll each watched service and keep its instance set in a shared cache
//! - Stream `NEW`, `CHANGED` and `DELETED` updates to a single consumer
//! - Stop every loop cleanly on shutdown, before the update stream closes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Registry task                                │
//! │  ┌──────────────────┐    ┌────────────────┐    ┌────────────┐  │
//! │  │ watch_catalog    │ -> │ Dispatcher     │ -> │ watch_     │  │
//! │  │ (services poll)  │    │ (NEW/DELETED)  │    │ service xN │  │
//! │  └────────┬─────────┘    └────────────────┘    └─────┬──────┘  │
//! │           └──────────► ServiceCache (one lock) ◄─────┘         │
//! └─────────────────────────────────────────────────────────────────┘
//!                                    │ mpsc
//!                                    ▼
//!                     RegistryWatcher::recv() -> consumer
//! ```
//!
//! # Crate Dependencies
//!
//! ```text
//! sd-cli ──► sd-watcher ──► sd-core
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use sd_core::{RegistryConfig, UpdateKind};
//! use sd_watcher::RegistryWatcher;
//!
//! # async fn example() -> Result<(), sd_watcher::WatchError> {
//! let config = RegistryConfig::new(["127.0.0.1:8500"], ["prod", "canary"]);
//! let mut watcher = RegistryWatcher::new(&config).await?;
//!
//! while let Some(update) = watcher.recv().await {
//!     match update.kind {
//!         UpdateKind::New => println!("watching {}", update.service_name),
//!         UpdateKind::Changed => println!("{} now has {} instances", update.service_name, update.instances.len()),
//!         UpdateKind::Deleted => println!("{} is gone", update.service_name),
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Catalogs
//!
//! [`Registry::with_client`] accepts any [`CatalogClient`], which is how the
//! watch loops are tested without an agent.
//!
//! # Error Handling
//!
//! Only construction fails with a [`WatchError`]. Once running, catalog
//! failures ([`CatalogError`]) are logged and retried after the configured
//! interval; they never reach the consumer.

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod cache;
pub mod catalog;
pub mod consul;
pub mod error;
pub mod filter;
pub mod registry;
pub mod watcher;

#[cfg(test)]
mod mock;

// Re-export error types
pub use error::{CatalogError, WatchError};

// Re-export catalog types
pub use catalog::{CatalogClient, CatalogNode, Indexed, ServiceTags, build_instance_map};
pub use consul::ConsulClient;

// Re-export cache types
pub use cache::{CacheGuard, RunState, ServiceCache, ServiceHandle, ServiceSnapshot};

pub use filter::TagFilter;
pub use registry::{DISPATCH_CAPACITY, Registry, WatchTiming};
pub use watcher::RegistryWatcher;
