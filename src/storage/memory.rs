//! In-memory storage backend.
//!
//! Entries live in an ordered map under a lock; `put` clones value bytes
//! and metadata so later caller mutation cannot reach stored state. Reads
//! that observe an expired entry lazily delete it. An embedded `:memory:`
//! SQL handle is created on first use for SQL-needing callers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::{
    clock::SharedClock,
    error::Result,
    storage::{
        ListOptions, ListedKey, Listing, RangeOptions, RangeStoredEntry, SqliteHandle, Storage,
        StoredEntry, StoredMeta, list, range, validate_key,
    },
};

/// Storage backend keeping every entry in process memory.
///
/// # Examples
///
/// ```rust
/// use kumo::storage::{MemoryStorage, Storage, StoredEntry};
/// use kumo::clock::system_clock;
/// use bytes::Bytes;
///
/// # async fn example() -> kumo::error::Result<()> {
/// let storage = MemoryStorage::new(system_clock());
/// storage.put("k", StoredEntry::from_value(Bytes::from("v"))).await?;
/// assert!(storage.has("k").await?);
/// # Ok(())
/// # }
/// ```
pub struct MemoryStorage {
    clock: SharedClock,
    entries: Mutex<BTreeMap<String, StoredEntry>>,
    sql: OnceCell<SqliteHandle>,
}

impl MemoryStorage {
    /// Creates an empty in-memory backend using the given clock.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            entries: Mutex::new(BTreeMap::new()),
            sql: OnceCell::new(),
        }
    }

    /// Removes the entry if it has expired, returning whether it is live.
    fn take_if_live(&self, key: &str) -> Option<StoredEntry> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired(&self.clock) => {
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn head(&self, key: &str) -> Result<Option<StoredMeta>> {
        validate_key(key)?;
        Ok(self.take_if_live(key).map(|e| StoredMeta {
            expiration: e.expiration,
            metadata: e.metadata,
        }))
    }

    async fn get(&self, key: &str, skip_metadata: bool) -> Result<Option<StoredEntry>> {
        validate_key(key)?;
        Ok(self.take_if_live(key).map(|mut e| {
            if skip_metadata {
                e.metadata = None;
            }
            e
        }))
    }

    async fn get_range(&self, key: &str, options: RangeOptions) -> Result<Option<RangeStoredEntry>> {
        validate_key(key)?;
        let Some(entry) = self.take_if_live(key) else {
            return Ok(None);
        };
        let resolved = range::resolve(options, entry.value.len() as u64)?;
        let start = resolved.offset as usize;
        let end = start + resolved.length as usize;
        Ok(Some(RangeStoredEntry {
            entry: StoredEntry {
                value: entry.value.slice(start..end),
                expiration: entry.expiration,
                metadata: entry.metadata,
            },
            range: resolved,
        }))
    }

    async fn put(&self, key: &str, entry: StoredEntry) -> Result<()> {
        validate_key(key)?;
        // Clone bytes and metadata so the caller cannot mutate stored state.
        let stored = StoredEntry {
            value: bytes::Bytes::copy_from_slice(&entry.value),
            expiration: entry.expiration,
            metadata: entry.metadata.clone(),
        };
        self.entries.lock().insert(key.to_string(), stored);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let mut entries = self.entries.lock();
        match entries.remove(key) {
            Some(entry) => Ok(!entry.is_expired(&self.clock)),
            None => Ok(false),
        }
    }

    async fn list(&self, options: ListOptions, skip_metadata: bool) -> Result<Listing> {
        let keys: Vec<ListedKey> = {
            let mut entries = self.entries.lock();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.is_expired(&self.clock))
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                entries.remove(&key);
            }
            entries
                .iter()
                .map(|(name, entry)| ListedKey {
                    name: name.clone(),
                    expiration: entry.expiration,
                    metadata: if skip_metadata {
                        None
                    } else {
                        entry.metadata.clone()
                    },
                })
                .collect()
        };
        Ok(list::paginate(keys, &options))
    }

    fn sql_database(&self) -> Result<SqliteHandle> {
        self.sql.get_or_try_init(SqliteHandle::in_memory).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::clock::{Clock, FakeClock};

    fn setup() -> (Arc<FakeClock>, MemoryStorage) {
        let clock = Arc::new(FakeClock::new(1_000_000_000_000));
        (clock.clone(), MemoryStorage::new(clock))
    }

    fn entry(value: &str) -> StoredEntry {
        StoredEntry::from_value(Bytes::copy_from_slice(value.as_bytes()))
    }

    #[tokio::test]
    async fn round_trip() {
        let (_, storage) = setup();
        storage.put("k", entry("v")).await.unwrap();
        let got = storage.get("k", false).await.unwrap().unwrap();
        assert_eq!(&got.value[..], b"v");
        assert!(storage.has("k").await.unwrap());
        assert!(storage.delete("k").await.unwrap());
        assert!(!storage.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_invisible() {
        let (clock, storage) = setup();
        let now_secs = clock.now_millis() / 1000;
        let mut e = entry("v");
        e.expiration = Some(now_secs + 2);
        storage.put("k", e).await.unwrap();

        clock.advance(1_000);
        assert!(storage.get("k", false).await.unwrap().is_some());
        let listing = storage.list(ListOptions::default(), false).await.unwrap();
        assert_eq!(listing.keys.len(), 1);

        clock.advance(2_000);
        assert!(storage.get("k", false).await.unwrap().is_none());
        assert!(!storage.has("k").await.unwrap());
        let listing = storage.list(ListOptions::default(), false).await.unwrap();
        assert!(listing.keys.is_empty());
        // Deleting an already-expired entry reports absence.
        assert!(!storage.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn range_reads_slice_the_value() {
        let (_, storage) = setup();
        storage.put("k", entry("0123456789")).await.unwrap();
        let r = storage
            .get_range(
                "k",
                RangeOptions {
                    offset: Some(2),
                    length: Some(3),
                    suffix: None,
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&r.entry.value[..], b"234");
        assert_eq!(r.range.offset, 2);
        assert_eq!(r.range.length, 3);
    }

    #[tokio::test]
    async fn put_clones_metadata() {
        let (_, storage) = setup();
        let mut e = entry("v");
        e.metadata = Some(serde_json::json!({"a": 1}));
        storage.put("k", e).await.unwrap();

        let head = storage.head("k").await.unwrap().unwrap();
        assert_eq!(head.metadata, Some(serde_json::json!({"a": 1})));

        let skipped = storage.get("k", true).await.unwrap().unwrap();
        assert!(skipped.metadata.is_none());
    }

    #[tokio::test]
    async fn batch_variants_match_singletons() {
        let (_, storage) = setup();
        storage
            .put_many(vec![
                ("a".to_string(), entry("1")),
                ("b".to_string(), entry("2")),
            ])
            .await
            .unwrap();
        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let got = storage.get_many(&keys).await.unwrap();
        assert!(got[0].is_some() && got[1].is_some() && got[2].is_none());
        assert_eq!(storage.has_many(&keys).await.unwrap(), 2);
        assert_eq!(storage.delete_many(&keys).await.unwrap(), 2);
    }
}
