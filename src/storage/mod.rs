//! Uniform key/value + range-read storage substrate.
//!
//! Every gateway in the simulator goes through the [`Storage`] contract:
//! `has`/`head`/`get`/`get_range`/`put`/`delete`/`list` plus batch variants
//! with the same semantics as iterated singletons. Values are opaque bytes
//! with an optional absolute expiration (unix seconds) and an optional
//! JSON-like metadata tree. An entry is considered absent once the clock
//! reaches its expiration; reads that observe expiry may lazily delete, and
//! listings must skip expired entries.
//!
//! Backends are safe for concurrent callers on the same key at the
//! single-operation granularity; only the durable-object transactional path
//! promises multi-key atomicity.
//!
//! # Examples
//!
//! ```rust
//! use kumo::storage::{MemoryStorage, Storage, StoredEntry};
//! use kumo::clock::system_clock;
//! use bytes::Bytes;
//!
//! # async fn example() -> kumo::error::Result<()> {
//! let storage = MemoryStorage::new(system_clock());
//! storage.put("greeting", StoredEntry::from_value(Bytes::from("hi"))).await?;
//! let entry = storage.get("greeting", false).await?.unwrap();
//! assert_eq!(&entry.value[..], b"hi");
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    clock::SharedClock,
    error::{ErrorKind, KumoError, Result},
};

mod file;
pub(crate) mod list;
mod memory;
pub(crate) mod range;
mod sqlite;

pub use file::FileStorage;
pub use list::{ListOptions, ListedKey, Listing};
pub use memory::MemoryStorage;
pub use range::{RangeOptions, ResolvedRange};
pub use sqlite::SqliteHandle;

/// Maximum key length in bytes.
pub const MAX_KEY_SIZE: usize = 1024;

/// A stored value with its optional expiration and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    /// Opaque value bytes.
    pub value: Bytes,
    /// Absolute expiration in unix seconds. The entry is absent once the
    /// clock reaches this instant.
    pub expiration: Option<u64>,
    /// Arbitrary JSON-serializable metadata, bounded in size by callers.
    pub metadata: Option<serde_json::Value>,
}

impl StoredEntry {
    /// Creates an entry with neither expiration nor metadata.
    pub fn from_value(value: Bytes) -> Self {
        Self {
            value,
            expiration: None,
            metadata: None,
        }
    }

    /// Returns true once the clock has reached the entry's expiration.
    pub fn is_expired(&self, clock: &SharedClock) -> bool {
        match self.expiration {
            Some(at) => clock.now_millis() >= at * 1000,
            None => false,
        }
    }
}

/// Expiration and metadata of an entry, without the value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredMeta {
    /// Absolute expiration in unix seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<u64>,
    /// Arbitrary JSON-serializable metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A stored entry restricted to a byte range of its value.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeStoredEntry {
    /// The entry with `value` sliced to the resolved range.
    pub entry: StoredEntry,
    /// The resolved absolute range within the full value.
    pub range: ResolvedRange,
}

/// Validates a storage key: UTF-8, non-empty, at most [`MAX_KEY_SIZE`]
/// bytes. Rust strings cannot contain unpaired surrogates, so only the
/// length bound needs checking here.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(KumoError::type_error("Key names must not be empty"));
    }
    if key.len() > MAX_KEY_SIZE {
        return Err(KumoError::new(
            ErrorKind::Validation,
            "TypeError",
            format!(
                "Keys must be less than {} bytes in length, got {}",
                MAX_KEY_SIZE,
                key.len()
            ),
        ));
    }
    Ok(())
}

/// The storage substrate contract shared by all backends.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Returns whether a live (non-expired) entry exists for `key`.
    async fn has(&self, key: &str) -> Result<bool> {
        Ok(self.head(key).await?.is_some())
    }

    /// Returns expiration and metadata of the entry without its value.
    async fn head(&self, key: &str) -> Result<Option<StoredMeta>>;

    /// Returns the entry, or `None` if absent or expired. With
    /// `skip_metadata` the backend may omit loading metadata.
    async fn get(&self, key: &str, skip_metadata: bool) -> Result<Option<StoredEntry>>;

    /// Returns a byte range of the entry's value, resolved against the
    /// current value size per [`range::resolve`].
    async fn get_range(&self, key: &str, range: RangeOptions) -> Result<Option<RangeStoredEntry>>;

    /// Stores an entry, replacing any existing value for `key`.
    async fn put(&self, key: &str, entry: StoredEntry) -> Result<()>;

    /// Deletes an entry. Returns true iff it existed and was not expired.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Lists live keys per the filter/sort/paginate pipeline in
    /// [`ListOptions`].
    async fn list(&self, options: ListOptions, skip_metadata: bool) -> Result<Listing>;

    /// Batch get with the same semantics as iterated [`Storage::get`].
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<StoredEntry>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key, false).await?);
        }
        Ok(out)
    }

    /// Batch put with the same semantics as iterated [`Storage::put`].
    async fn put_many(&self, entries: Vec<(String, StoredEntry)>) -> Result<()> {
        for (key, entry) in entries {
            self.put(&key, entry).await?;
        }
        Ok(())
    }

    /// Batch delete; returns the number of entries that existed.
    async fn delete_many(&self, keys: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for key in keys {
            if self.delete(key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Batch existence check; returns the number of live entries.
    async fn has_many(&self, keys: &[String]) -> Result<usize> {
        let mut found = 0;
        for key in keys {
            if self.has(key).await? {
                found += 1;
            }
        }
        Ok(found)
    }

    /// Returns the backend's embedded SQL handle for SQL-needing callers,
    /// such as the object-store gateway. Backends without one report a
    /// configuration error.
    fn sql_database(&self) -> Result<SqliteHandle> {
        Err(KumoError::new(
            ErrorKind::Configuration,
            "Error",
            "This storage backend does not provide an embedded SQL database",
        ))
    }
}
