//! Bounded cache of context-query results, keyed by a normalized query fingerprint

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::storage::OutboxStore;

/// A cached context payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// SHA-256 of the normalized query
    pub fingerprint: String,

    /// The normalized query text
    pub query: String,

    pub payload: String,

    /// When the payload came back from the memory worker
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Whether the entry is still within `ttl` of its fetch
    pub fn is_fresh(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now - self.fetched_at < ttl
    }
}

/// Lowercase, trim, and collapse whitespace so trivially different phrasings
/// share a cache slot
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Hex SHA-256 of the normalized query
pub fn fingerprint(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_query(query).as_bytes());
    let digest = hasher.finalize();

    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

/// Size- and TTL-bounded context cache stored alongside the outbox
#[derive(Clone)]
pub struct ContextCache {
    store: Arc<OutboxStore>,
    max_entries: usize,
    ttl: chrono::Duration,
}

impl ContextCache {
    pub fn new(store: Arc<OutboxStore>, max_entries: usize, ttl: chrono::Duration) -> Self {
        Self {
            store,
            max_entries,
            ttl,
        }
    }

    pub fn ttl(&self) -> chrono::Duration {
        self.ttl
    }

    /// Cached entry for `query`, stale or not
    pub fn get(&self, query: &str) -> Result<Option<CacheEntry>> {
        self.store.cache_get(&fingerprint(query))
    }

    /// Store a fresh payload, evicting the oldest fetches past capacity
    pub fn put(&self, query: &str, payload: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        let entry = CacheEntry {
            fingerprint: fingerprint(query),
            query: normalize_query(query),
            payload: payload.into(),
            fetched_at: now,
        };

        let evicted = self.store.cache_put(&entry, self.max_entries)?;
        if evicted > 0 {
            tracing::debug!(evicted, "Evicted context cache entries over capacity");
        }
        Ok(())
    }

    /// Drop entries older than the TTL
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.store.cache_purge_older_than(now - self.ttl)
    }

    pub fn len(&self) -> Result<usize> {
        self.store.cache_len()
    }
}
