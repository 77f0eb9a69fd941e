//! Keyed value store gateway with TTL and prefix listing.
//!
//! A thin facade over the storage substrate: per-key TTLs map to absolute
//! expirations, listing is prefix-only with cursor pagination, and a small
//! in-process read-through cache keyed by `(namespace, key)` models the
//! platform's edge cache for reads that pass a `cache_ttl`. The read-through
//! cache is distinct from the HTTP cache gateway.
//!
//! # Examples
//!
//! ```rust
//! use kumo::kv::{KvGateway, KvPutOptions};
//! use kumo::storage::MemoryStorage;
//! use kumo::clock::system_clock;
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! # async fn example() -> kumo::error::Result<()> {
//! let clock = system_clock();
//! let kv = KvGateway::new("NAMESPACE", Arc::new(MemoryStorage::new(clock.clone())), clock);
//! kv.put("k", Bytes::from("v"), KvPutOptions::default()).await?;
//! assert!(kv.get("k", None).await?.is_some());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    clock::SharedClock,
    error::Result,
    storage::{ListOptions, Listing, Storage, StoredEntry},
};

/// Read-through cache capacity; the oldest insertion is evicted beyond it.
const READ_CACHE_CAPACITY: usize = 1024;

/// Default page size for listings.
const DEFAULT_LIST_LIMIT: usize = 1000;

/// Options for a KV put.
#[derive(Debug, Clone, Default)]
pub struct KvPutOptions {
    /// Absolute expiration in unix seconds.
    pub expiration: Option<u64>,
    /// Relative TTL in seconds, resolved against the gateway clock.
    /// Ignored when `expiration` is set.
    pub expiration_ttl: Option<u64>,
    /// Arbitrary JSON metadata stored beside the value.
    pub metadata: Option<serde_json::Value>,
}

/// Options for a KV list.
#[derive(Debug, Clone, Default)]
pub struct KvListOptions {
    /// Only keys with this prefix are listed.
    pub prefix: Option<String>,
    /// Page size, defaulting to 1000.
    pub limit: Option<usize>,
    /// Cursor from a previous page.
    pub cursor: Option<String>,
}

struct CachedRead {
    entry: StoredEntry,
    fresh_until_millis: u64,
}

/// Keyed value store over the substrate.
pub struct KvGateway {
    namespace: String,
    storage: Arc<dyn Storage>,
    clock: SharedClock,
    read_cache: Mutex<HashMap<(String, String), CachedRead>>,
    read_cache_order: Mutex<Vec<(String, String)>>,
}

impl KvGateway {
    /// Creates a gateway for one namespace over the given backend.
    pub fn new(namespace: impl Into<String>, storage: Arc<dyn Storage>, clock: SharedClock) -> Self {
        Self {
            namespace: namespace.into(),
            storage,
            clock,
            read_cache: Mutex::new(HashMap::new()),
            read_cache_order: Mutex::new(Vec::new()),
        }
    }

    /// The namespace this gateway serves.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Reads a value. With `cache_ttl` (seconds) the result is served from
    /// and kept in the in-process read-through cache.
    pub async fn get(&self, key: &str, cache_ttl: Option<u64>) -> Result<Option<StoredEntry>> {
        if let Some(ttl) = cache_ttl {
            let cache_key = (self.namespace.clone(), key.to_string());
            {
                let cache = self.read_cache.lock();
                if let Some(hit) = cache.get(&cache_key) {
                    if self.clock.now_millis() < hit.fresh_until_millis {
                        return Ok(Some(hit.entry.clone()));
                    }
                }
            }
            let entry = self.storage.get(key, false).await?;
            if let Some(entry) = &entry {
                let mut cache = self.read_cache.lock();
                let mut order = self.read_cache_order.lock();
                if !cache.contains_key(&cache_key) {
                    order.push(cache_key.clone());
                }
                cache.insert(
                    cache_key,
                    CachedRead {
                        entry: entry.clone(),
                        fresh_until_millis: self.clock.now_millis() + ttl * 1000,
                    },
                );
                while cache.len() > READ_CACHE_CAPACITY {
                    let oldest = order.remove(0);
                    cache.remove(&oldest);
                }
            }
            return Ok(entry);
        }
        self.storage.get(key, false).await
    }

    /// Stores a value, mapping TTL options to an absolute expiration.
    pub async fn put(&self, key: &str, value: Bytes, options: KvPutOptions) -> Result<()> {
        let expiration = match (options.expiration, options.expiration_ttl) {
            (Some(at), _) => Some(at),
            (None, Some(ttl)) => Some(self.clock.now_secs() + ttl),
            (None, None) => None,
        };
        self.invalidate(key);
        self.storage
            .put(
                key,
                StoredEntry {
                    value,
                    expiration,
                    metadata: options.metadata,
                },
            )
            .await
    }

    /// Deletes a key. Returns whether a live entry existed.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.invalidate(key);
        self.storage.delete(key).await
    }

    /// Lists keys by prefix with cursor pagination.
    pub async fn list(&self, options: KvListOptions) -> Result<Listing> {
        self.storage
            .list(
                ListOptions {
                    prefix: options.prefix,
                    limit: Some(options.limit.unwrap_or(DEFAULT_LIST_LIMIT)),
                    cursor: options.cursor,
                    ..Default::default()
                },
                false,
            )
            .await
    }

    fn invalidate(&self, key: &str) {
        let cache_key = (self.namespace.clone(), key.to_string());
        self.read_cache.lock().remove(&cache_key);
        self.read_cache_order.lock().retain(|k| *k != cache_key);
    }
}
