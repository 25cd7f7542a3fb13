//! Events delivered to the consumer of the watcher.
//!
//! # Event Order
//!
//! ```text
//! service appears in catalog ──► NEW       (no instances yet)
//! instance list refreshed    ──► CHANGED   (full instance set, 0..n times)
//! service leaves catalog     ──► DELETED
//! ```
//!
//! Events for one service always arrive in this order. Events for different
//! services interleave freely.

use serde::{Deserialize, Serialize};

use super::instance::InstanceMap;

/// The kind of change a [`ServiceUpdate`] describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// The service started being watched. Its instances are not known yet.
    New,
    /// The instance set of the service was refreshed.
    Changed,
    /// The service left the catalog.
    Deleted,
}

impl UpdateKind {
    /// Returns the upper-case label used in log output.
    ///
    /// # Examples
    ///
    /// ```
    /// use sd_core::UpdateKind;
    ///
    /// assert_eq!(UpdateKind::Changed.label(), "CHANGED");
    /// ```
    #[inline]
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Changed => "CHANGED",
            Self::Deleted => "DELETED",
        }
    }
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A change to one watched service.
///
/// `instances` is only populated for [`UpdateKind::Changed`], where it holds
/// the complete instance set replacing whatever the consumer knew before.
///
/// # Examples
///
/// ```
/// use sd_core::{ServiceUpdate, UpdateKind};
///
/// let update = ServiceUpdate::new("web", "prod");
/// assert_eq!(update.kind, UpdateKind::New);
/// assert!(update.instances.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceUpdate {
    /// Name of the service.
    pub service_name: String,

    /// The watched tag that selected this service.
    pub tag: String,

    /// What happened to the service.
    pub kind: UpdateKind,

    /// Complete instance set, for [`UpdateKind::Changed`].
    pub instances: InstanceMap,
}

impl ServiceUpdate {
    /// Creates a `NEW` event.
    #[must_use]
    pub fn new(service_name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            tag: tag.into(),
            kind: UpdateKind::New,
            instances: InstanceMap::new(),
        }
    }

    /// Creates a `CHANGED` event carrying the full instance set.
    #[must_use]
    pub fn changed(
        service_name: impl Into<String>,
        tag: impl Into<String>,
        instances: InstanceMap,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            tag: tag.into(),
            kind: UpdateKind::Changed,
            instances,
        }
    }

    /// Creates a `DELETED` event.
    #[must_use]
    pub fn deleted(service_name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            tag: tag.into(),
            kind: UpdateKind::Deleted,
            instances: InstanceMap::new(),
        }
    }
}
