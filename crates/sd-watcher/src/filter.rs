//! Tag allow-list filtering for catalog services.
//!
//! The catalog lists every service with its tags. Only services carrying at
//! least one allow-listed tag are watched, and the first such tag (in the
//! order the service lists its tags) becomes the service's tag for its whole
//! watched lifetime.
//!
//! # Examples
//!
//! ```
//! use sd_watcher::TagFilter;
//!
//! let filter = TagFilter::new(["prod", "canary"]);
//!
//! let tags = vec!["v2".to_owned(), "canary".to_owned(), "prod".to_owned()];
//! assert_eq!(filter.select_tag(&tags), Some("canary"));
//!
//! let tags = vec!["internal".to_owned()];
//! assert_eq!(filter.select_tag(&tags), None);
//! ```

use smallvec::SmallVec;

/// The set of tags that make a service worth watching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagFilter {
    tags: SmallVec<[String; 4]>,
}

impl TagFilter {
    /// Creates a filter from the configured tags. Duplicates are dropped.
    #[must_use]
    pub fn new<I>(tags: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut filter = Self::default();
        for tag in tags {
            let tag = tag.into();
            if !filter.tags.contains(&tag) {
                filter.tags.push(tag);
            }
        }
        filter
    }

    /// Returns the tag a service is watched under, if any.
    ///
    /// First match wins: the earliest entry of `service_tags` that is
    /// allow-listed is returned. The order of the allow-list itself does not
    /// matter.
    #[must_use]
    pub fn select_tag<'a>(&self, service_tags: &'a [String]) -> Option<&'a str> {
        service_tags
            .iter()
            .find(|tag| self.tags.contains(tag))
            .map(String::as_str)
    }

    /// Returns `true` if no tag is allow-listed, in which case nothing is watched.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Returns the allow-listed tags.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }
}
