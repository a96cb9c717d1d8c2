//! Bucket location cache
//!
//! Remembers the region (or deployment marker) reported for each bucket so
//! listing can pick a protocol without asking again.

use dashmap::DashMap;
use std::sync::Arc;

/// Location reported by appliance-style deployments that only speak
/// the v1 listing protocol
pub const SNOWBALL_LOCATION: &str = "snowball";

#[derive(Debug, Default, Clone)]
pub struct BucketLocationCache {
    locations: Arc<DashMap<String, String>>,
}

impl BucketLocationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, bucket: &str) -> Option<String> {
        self.locations.get(bucket).map(|entry| entry.value().clone())
    }

    pub fn set(&self, bucket: impl Into<String>, location: impl Into<String>) {
        self.locations.insert(bucket.into(), location.into());
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Whether listing `bucket` must use the v1 protocol
    pub fn requires_v1_listing(&self, bucket: &str) -> bool {
        self.locations
            .get(bucket)
            .is_some_and(|entry| entry.value() == SNOWBALL_LOCATION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let cache = BucketLocationCache::new();
        assert!(cache.get("bucket").is_none());

        cache.set("bucket", "eu-west-1");
        assert_eq!(cache.get("bucket").as_deref(), Some("eu-west-1"));
        assert!(!cache.requires_v1_listing("bucket"));
    }

    #[test]
    fn test_snowball_requires_v1() {
        let cache = BucketLocationCache::new();
        cache.set("appliance", SNOWBALL_LOCATION);
        assert!(cache.requires_v1_listing("appliance"));
        assert!(!cache.requires_v1_listing("unknown"));
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = BucketLocationCache::new();
        let other = cache.clone();
        other.set("bucket", "us-west-2");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("bucket").as_deref(), Some("us-west-2"));
    }

    #[test]
    fn test_set_replaces_location() {
        let cache = BucketLocationCache::new();
        cache.set("bucket", SNOWBALL_LOCATION);
        cache.set("bucket", "us-east-1");
        assert_eq!(cache.len(), 1);
        assert!(!cache.requires_v1_listing("bucket"));
    }
}
