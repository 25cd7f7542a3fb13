//! Core types, configuration, and errors for the sd-watch workspace.
//!
//! This crate provides the foundational types shared by the watcher and its
//! consumers:
//!
//! - [`ServiceUpdate`] events (`NEW`, `CHANGED`, `DELETED`) and the
//!   [`ServiceInstance`] records they carry
//! - [`RegistryConfig`] and the root [`Config`]
//! - [`ConfigError`] for construction-time failures

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    Config, DEFAULT_EVENT_BUFFER, DEFAULT_RETRY_INTERVAL_SECS, DEFAULT_WATCH_TIMEOUT_SECS,
    RegistryConfig,
};
pub use error::ConfigError;
pub use types::{InstanceMap, ServiceInstance, ServiceUpdate, UpdateKind, instance_key};
