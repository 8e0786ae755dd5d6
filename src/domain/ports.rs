//! Domain Ports - Resource store boundary
//!
//! Drive and Volume records are owned by an external cluster store. The
//! agent only ever reads them and writes them back conditionally: every
//! update carries the resource version it was read at, and the store
//! reports a conflict when someone else wrote in between.

use crate::crd::{Drive, Volume};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// List Filter
// =============================================================================

/// Equality label filter applied to list calls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Labels that must all be present with the given values
    pub labels: BTreeMap<String, String>,
}

impl ListFilter {
    /// Filter matching everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key=value`
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Check a label set against the filter
    pub fn matches(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        self.labels.iter().all(|(key, value)| {
            labels
                .and_then(|l| l.get(key))
                .map(|v| v == value)
                .unwrap_or(false)
        })
    }

    /// Render as a Kubernetes label selector (`k1=v1,k2=v2`)
    pub fn to_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

// =============================================================================
// Resource Store Port
// =============================================================================

/// Port for versioned access to one kind of cluster resource
///
/// `update` must fail with an error for which
/// [`Error::is_conflict`](crate::error::Error::is_conflict) holds when the
/// object's resource version is stale.
#[async_trait]
pub trait ResourceStore<K: Send + Sync + 'static>: Send + Sync {
    /// Kind name used in errors and logs
    fn kind(&self) -> &str;

    /// Fetch the latest copy of a resource
    async fn get(&self, name: &str) -> Result<K>;

    /// List resources matching the filter
    async fn list(&self, filter: &ListFilter) -> Result<Vec<K>>;

    /// Create a new resource
    async fn create(&self, object: &K) -> Result<K>;

    /// Conditionally replace a resource (metadata and status)
    ///
    /// The write may land in two steps, status first. A failure can then
    /// leave the new status stored next to the old metadata.
    async fn update(&self, object: &K) -> Result<K>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type DriveStoreRef = Arc<dyn ResourceStore<Drive>>;
pub type VolumeStoreRef = Arc<dyn ResourceStore<Volume>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_filter_matches() {
        let filter = ListFilter::new().label("node", "n1").label("path", "sdb");

        let mut labels = BTreeMap::new();
        labels.insert("node".to_string(), "n1".to_string());
        assert!(!filter.matches(Some(&labels)));

        labels.insert("path".to_string(), "sdb".to_string());
        assert!(filter.matches(Some(&labels)));

        assert!(!filter.matches(None));
        assert!(ListFilter::new().matches(None));
    }

    #[test]
    fn test_list_filter_selector() {
        let filter = ListFilter::new().label("b", "2").label("a", "1");
        assert_eq!(filter.to_selector(), "a=1,b=2");
        assert_eq!(ListFilter::new().to_selector(), "");
    }
}
