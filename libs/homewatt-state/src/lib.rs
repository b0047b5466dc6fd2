//! Latest-record cache shared by all modules
//!
//! One entry per module name holding the serialized form of that module's
//! most recent successful record. Writers always replace the whole entry, so a
//! reader sees either the old or the new value, never a mix. There is no TTL
//! and no eviction: a module whose queries keep failing simply leaves its last
//! entry in place.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use errors::{HomewattError, HomewattResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

/// One cached snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRecord {
    pub payload: Bytes,
    pub updated_at: DateTime<Utc>,
}

/// Concurrent map from module name to its latest serialized record
///
/// Cloning is cheap and yields a handle to the same map.
#[derive(Debug, Clone, Default)]
pub struct StateCache {
    entries: Arc<DashMap<String, CachedRecord>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry for `key` unconditionally
    pub fn put(&self, key: &str, payload: impl Into<Bytes>) {
        let payload = payload.into();
        trace!("state cache put {} ({} bytes)", key, payload.len());
        self.entries.insert(
            key.to_string(),
            CachedRecord {
                payload,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.entries.get(key).map(|entry| entry.payload.clone())
    }

    pub fn entry(&self, key: &str) -> Option<CachedRecord> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Module names with an entry, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of every entry
    pub fn snapshot(&self) -> BTreeMap<String, CachedRecord> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Serialize `record` as JSON and store it under `key`
    pub fn put_json<T: Serialize + ?Sized>(&self, key: &str, record: &T) -> HomewattResult<()> {
        let payload = serde_json::to_vec(record)?;
        self.put(key, payload);
        Ok(())
    }

    /// Decode the entry under `key`, `NotFound` if absent
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> HomewattResult<T> {
        let payload = self.get(key).ok_or_else(|| HomewattError::NotFound {
            resource: format!("state for module \"{}\"", key),
        })?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Reading {
        temperature: f64,
        humidity: f64,
    }

    #[test]
    fn test_put_then_get() {
        let cache = StateCache::new();
        cache.put("fronius", Bytes::from_static(b"{\"p_pv\":1200}"));
        assert_eq!(cache.get("fronius").unwrap(), Bytes::from_static(b"{\"p_pv\":1200}"));
        assert!(cache.contains("fronius"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_absent_key() {
        let cache = StateCache::new();
        assert!(cache.get("weather").is_none());
        assert!(cache.entry("weather").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_last_write_wins() {
        let cache = StateCache::new();
        cache.put("senec", "first");
        cache.put("senec", "second");
        assert_eq!(cache.get("senec").unwrap(), Bytes::from("second"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clones_share_entries() {
        let cache = StateCache::new();
        let reader = cache.clone();
        cache.put("solvis", "x");
        assert_eq!(reader.get("solvis").unwrap(), Bytes::from("x"));
    }

    #[test]
    fn test_json_helpers() {
        let cache = StateCache::new();
        let reading = Reading {
            temperature: 21.5,
            humidity: 48.0,
        };
        cache.put_json("weather", &reading).unwrap();
        let back: Reading = cache.get_json("weather").unwrap();
        assert_eq!(back, reading);

        let err = cache.get_json::<Reading>("missing").unwrap_err();
        assert!(matches!(err, HomewattError::NotFound { .. }));
    }

    #[test]
    fn test_keys_sorted_and_snapshot() {
        let cache = StateCache::new();
        cache.put("weather", "w");
        cache.put("fronius", "f");
        cache.put("senec", "s");
        assert_eq!(cache.keys(), vec!["fronius", "senec", "weather"]);

        let snapshot = cache.snapshot();
        cache.put("fronius", "changed");
        assert_eq!(snapshot["fronius"].payload, Bytes::from("f"));
    }
}
