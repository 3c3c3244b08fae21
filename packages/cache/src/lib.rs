#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Read-through query cache for snapshot and route-score responses.
//!
//! Keys are deterministic SHA-256 fingerprints of the query shape
//! (operation, spatial input, lookback, time-of-day, overrides, current
//! month). Values carry the grid version they were produced under: an
//! entry is a miss once it is older than the TTL *or* the grid version has
//! moved past it, which bounds staleness after an ingestion to at most one
//! TTL window. Staleness is resolved internally; callers only ever see
//! hit-or-miss.
//!
//! Writes are last-writer-wins; two handlers racing to fill the same key
//! produce equivalent values by construction (same fingerprint, same grid
//! version).

use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

/// Default entry TTL: 15 minutes.
const DEFAULT_TTL: Duration = Duration::from_secs(900);

/// One cached response.
#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    version: u64,
    inserted_at: Instant,
}

/// In-process read-through cache keyed by query fingerprint.
pub struct QueryCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl QueryCache {
    /// Creates a cache with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Creates a cache from `SAFEROUTE_CACHE_TTL_SECS` (default 900).
    #[must_use]
    pub fn from_env() -> Self {
        let ttl = std::env::var("SAFEROUTE_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map_or(DEFAULT_TTL, Duration::from_secs);
        Self::new(ttl)
    }

    /// Looks up a cached response.
    ///
    /// Entries past their TTL or produced under a grid version older than
    /// `current_version` are evicted and reported as misses.
    #[must_use]
    pub fn get(&self, key: &str, current_version: u64) -> Option<serde_json::Value> {
        let hit = {
            let entry = self.entries.get(key)?;

            if entry.inserted_at.elapsed() > self.ttl {
                log::debug!("Cache entry expired: {key}");
                None
            } else if entry.version < current_version {
                log::debug!(
                    "Cache entry stale (version {} < {current_version}): {key}",
                    entry.version,
                );
                None
            } else {
                Some(entry.value.clone())
            }
        };

        if hit.is_none() {
            self.entries.remove(key);
        }
        hit
    }

    /// Stores a response produced under the given grid version.
    pub fn insert(&self, key: String, version: u64, value: serde_json::Value) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                version,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Number of live entries (expired entries may still be counted until
    /// their next lookup).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry. Used by admin tooling after destructive
    /// maintenance; normal invalidation goes through the version check.
    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

/// Builds a deterministic fingerprint for a query.
///
/// `parts` is the canonical serialization of every input that affects the
/// response (spatial input, lookback, time-of-day, overrides, current
/// month). Identical queries always produce identical keys.
#[must_use]
pub fn fingerprint(operation: &str, parts: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_bytes());
    for part in parts {
        hasher.update([0u8]);
        hasher.update(part.as_bytes());
    }

    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("{operation}:{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn fingerprints_are_deterministic_and_distinct() {
        let a = fingerprint("snapshot", &parts(&["-1.46,50.87,-1.32,50.95", "12", "night"]));
        let b = fingerprint("snapshot", &parts(&["-1.46,50.87,-1.32,50.95", "12", "night"]));
        assert_eq!(a, b);

        let other_lookback =
            fingerprint("snapshot", &parts(&["-1.46,50.87,-1.32,50.95", "6", "night"]));
        assert_ne!(a, other_lookback);

        let other_op = fingerprint("route", &parts(&["-1.46,50.87,-1.32,50.95", "12", "night"]));
        assert_ne!(a, other_op);

        // Part boundaries matter: ["ab", "c"] != ["a", "bc"].
        assert_ne!(
            fingerprint("snapshot", &parts(&["ab", "c"])),
            fingerprint("snapshot", &parts(&["a", "bc"])),
        );
    }

    #[test]
    fn hit_within_ttl_and_version() {
        let cache = QueryCache::new(Duration::from_secs(60));
        let key = fingerprint("snapshot", &parts(&["bbox", "12"]));

        cache.insert(key.clone(), 3, serde_json::json!({"cells": []}));
        assert_eq!(
            cache.get(&key, 3),
            Some(serde_json::json!({"cells": []})),
        );
    }

    #[test]
    fn version_bump_invalidates() {
        let cache = QueryCache::new(Duration::from_secs(60));
        let key = fingerprint("snapshot", &parts(&["bbox", "12"]));

        cache.insert(key.clone(), 3, serde_json::json!(1));

        // A rebuild bumped the grid to version 4: the entry is stale and
        // must read as a miss, never as data.
        assert_eq!(cache.get(&key, 4), None);

        // The stale entry is also gone.
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entries_miss() {
        let cache = QueryCache::new(Duration::from_secs(0));
        let key = fingerprint("route", &parts(&["hash"]));

        cache.insert(key.clone(), 1, serde_json::json!(1));
        assert_eq!(cache.get(&key, 1), None);
    }

    #[test]
    fn newer_entry_survives_older_version_query() {
        let cache = QueryCache::new(Duration::from_secs(60));
        let key = fingerprint("snapshot", &parts(&["bbox"]));

        cache.insert(key.clone(), 5, serde_json::json!("fresh"));

        // A reader that fetched the version just before a bump still gets
        // the newer entry; last writer wins.
        assert_eq!(cache.get(&key, 4), Some(serde_json::json!("fresh")));
    }

    #[test]
    fn clear_drops_everything() {
        let cache = QueryCache::default();
        cache.insert("a".to_string(), 1, serde_json::json!(1));
        cache.insert("b".to_string(), 1, serde_json::json!(2));
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }
}
