//! Domain types shared between the watcher and its consumers.
//!
//! - [`instance`] - Backend endpoints of a service
//! - [`update`] - Events delivered to the consumer
//!
//! All public types are re-exported at the crate root:
//!
//! ```
//! use sd_core::{InstanceMap, ServiceInstance, ServiceUpdate, UpdateKind};
//! ```

mod instance;
mod update;

pub use instance::{InstanceMap, ServiceInstance, instance_key};
pub use update::{ServiceUpdate, UpdateKind};
