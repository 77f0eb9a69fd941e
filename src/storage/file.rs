//! File-system storage backend.
//!
//! Each key maps to `<root>/<sanitised key>` holding the raw value bytes,
//! with an optional sibling `<path>.meta.json` carrying the original key,
//! expiration, and metadata; storing the original key keeps sanitisation
//! reversible. Sanitisation is optional so read-only mount points can be
//! listed as-is; with it disabled, keys that would resolve outside the root
//! are rejected with `ERR_TRAVERSAL`. Writing under a key whose parent path
//! is already a key file fails with `ERR_NAMESPACE_KEY_CHILD`.
//!
//! A co-located `<root>.sqlite` database serves SQL-needing callers. Range
//! reads use positioned file reads rather than loading the whole value.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{
    clock::SharedClock,
    error::{ErrorKind, KumoError, Result},
    storage::{
        ListOptions, ListedKey, Listing, RangeOptions, RangeStoredEntry, SqliteHandle, Storage,
        StoredEntry, StoredMeta, list, range, validate_key,
    },
};

const META_SUFFIX: &str = ".meta.json";

/// Sidecar metadata file contents.
#[derive(Debug, Serialize, Deserialize)]
struct MetaFile {
    /// The original (unsanitised) key.
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expiration: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metadata: Option<serde_json::Value>,
}

/// Storage backend persisting entries under a root directory.
///
/// # Examples
///
/// ```rust
/// use kumo::storage::{FileStorage, Storage, StoredEntry};
/// use kumo::clock::system_clock;
/// use bytes::Bytes;
///
/// # async fn example() -> kumo::error::Result<()> {
/// let storage = FileStorage::new("/tmp/kumo-kv", true, system_clock());
/// storage.put("section/key", StoredEntry::from_value(Bytes::from("v"))).await?;
/// # Ok(())
/// # }
/// ```
pub struct FileStorage {
    root: PathBuf,
    sanitise: bool,
    clock: SharedClock,
    sql: OnceCell<SqliteHandle>,
}

impl FileStorage {
    /// Creates a file backend rooted at `root`. With `sanitise` disabled
    /// keys are used as relative paths verbatim, which only read-only mount
    /// points should do.
    pub fn new(root: impl Into<PathBuf>, sanitise: bool, clock: SharedClock) -> Self {
        Self {
            root: root.into(),
            sanitise,
            clock,
            sql: OnceCell::new(),
        }
    }

    /// Resolves a key to its value path inside the root.
    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let relative: PathBuf = if self.sanitise {
            key.split('/').map(sanitise_segment).collect()
        } else {
            PathBuf::from(key)
        };

        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(KumoError::new(
                        ErrorKind::Configuration,
                        "ERR_TRAVERSAL",
                        format!("Cannot access \"{key}\": path would be outside the storage root"),
                    ));
                }
            }
        }

        Ok(self.root.join(relative))
    }

    fn meta_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(META_SUFFIX);
        PathBuf::from(name)
    }

    async fn read_meta(&self, path: &Path) -> Result<Option<MetaFile>> {
        match tokio::fs::read(Self::meta_path(path)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn meta_expired(&self, meta: &Option<MetaFile>) -> bool {
        match meta.as_ref().and_then(|m| m.expiration) {
            Some(at) => self.clock.now_millis() >= at * 1000,
            None => false,
        }
    }

    async fn remove_entry_files(&self, path: &Path) {
        let _ = tokio::fs::remove_file(path).await;
        let _ = tokio::fs::remove_file(Self::meta_path(path)).await;
    }

    /// Loads meta and checks liveness; expired entries are lazily deleted.
    /// Returns `None` when the value file does not exist.
    async fn live_meta(&self, path: &Path) -> Result<Option<Option<MetaFile>>> {
        let meta = self.read_meta(path).await?;
        if self.meta_expired(&meta) {
            self.remove_entry_files(path).await;
            return Ok(None);
        }
        match tokio::fs::try_exists(path).await {
            Ok(true) => Ok(Some(meta)),
            Ok(false) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn prepare_parent(&self, key: &str, path: &Path) -> Result<()> {
        // A parent path that is itself a key file cannot become a directory.
        let mut ancestor = path.parent();
        while let Some(dir) = ancestor {
            if dir == self.root.as_path() {
                break;
            }
            if let Ok(meta) = tokio::fs::metadata(dir).await {
                if meta.is_file() {
                    return Err(KumoError::new(
                        ErrorKind::Configuration,
                        "ERR_NAMESPACE_KEY_CHILD",
                        format!("Cannot put key \"{key}\": parent path is an existing key"),
                    ));
                }
                break;
            }
            ancestor = dir.parent();
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Walks the root collecting `(key, meta)` pairs for live entries.
    async fn walk(&self) -> Result<Vec<(String, Option<MetaFile>)>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.to_string_lossy().ends_with(META_SUFFIX) {
                    continue;
                }
                let meta = self.read_meta(&path).await?;
                if self.meta_expired(&meta) {
                    self.remove_entry_files(&path).await;
                    continue;
                }
                let key = match &meta {
                    Some(m) => m.key.clone(),
                    None => path
                        .strip_prefix(&self.root)
                        .map(|p| p.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"))
                        .unwrap_or_default(),
                };
                out.push((key, meta));
            }
        }
        Ok(out)
    }
}

/// Replaces path-unsafe characters in one key segment. Dot segments become
/// plain underscores so a sanitised key can never traverse upward.
fn sanitise_segment(segment: &str) -> String {
    if segment.is_empty() || segment == "." || segment == ".." {
        return "_".to_string();
    }
    segment
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\\' => '_',
            c if (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect()
}

#[async_trait]
impl Storage for FileStorage {
    async fn head(&self, key: &str) -> Result<Option<StoredMeta>> {
        validate_key(key)?;
        let path = self.key_path(key)?;
        Ok(self.live_meta(&path).await?.map(|meta| StoredMeta {
            expiration: meta.as_ref().and_then(|m| m.expiration),
            metadata: meta.and_then(|m| m.metadata),
        }))
    }

    async fn get(&self, key: &str, skip_metadata: bool) -> Result<Option<StoredEntry>> {
        validate_key(key)?;
        let path = self.key_path(key)?;
        let Some(meta) = self.live_meta(&path).await? else {
            return Ok(None);
        };
        let value = match tokio::fs::read(&path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(StoredEntry {
            value,
            expiration: meta.as_ref().and_then(|m| m.expiration),
            metadata: if skip_metadata {
                None
            } else {
                meta.and_then(|m| m.metadata)
            },
        }))
    }

    async fn get_range(&self, key: &str, options: RangeOptions) -> Result<Option<RangeStoredEntry>> {
        validate_key(key)?;
        let path = self.key_path(key)?;
        let Some(meta) = self.live_meta(&path).await? else {
            return Ok(None);
        };
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata().await?.len();
        let resolved = range::resolve(options, size)?;
        file.seek(SeekFrom::Start(resolved.offset)).await?;
        let mut value = vec![0u8; resolved.length as usize];
        file.read_exact(&mut value).await?;
        Ok(Some(RangeStoredEntry {
            entry: StoredEntry {
                value: Bytes::from(value),
                expiration: meta.as_ref().and_then(|m| m.expiration),
                metadata: meta.and_then(|m| m.metadata),
            },
            range: resolved,
        }))
    }

    async fn put(&self, key: &str, entry: StoredEntry) -> Result<()> {
        validate_key(key)?;
        let path = self.key_path(key)?;
        self.prepare_parent(key, &path).await?;
        tokio::fs::write(&path, &entry.value).await?;

        let needs_meta = entry.expiration.is_some()
            || entry.metadata.is_some()
            || path
                .strip_prefix(&self.root)
                .map(|p| p.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/") != key)
                .unwrap_or(true);
        if needs_meta {
            let meta = MetaFile {
                key: key.to_string(),
                expiration: entry.expiration,
                metadata: entry.metadata,
            };
            tokio::fs::write(Self::meta_path(&path), serde_json::to_vec(&meta)?).await?;
        } else {
            let _ = tokio::fs::remove_file(Self::meta_path(&path)).await;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let path = self.key_path(key)?;
        let live = self.live_meta(&path).await?.is_some();
        self.remove_entry_files(&path).await;
        Ok(live)
    }

    async fn list(&self, options: ListOptions, skip_metadata: bool) -> Result<Listing> {
        let keys = self
            .walk()
            .await?
            .into_iter()
            .map(|(name, meta)| ListedKey {
                name,
                expiration: meta.as_ref().and_then(|m| m.expiration),
                metadata: if skip_metadata {
                    None
                } else {
                    meta.and_then(|m| m.metadata)
                },
            })
            .collect();
        Ok(list::paginate(keys, &options))
    }

    fn sql_database(&self) -> Result<SqliteHandle> {
        self.sql
            .get_or_try_init(|| {
                let mut name = self.root.as_os_str().to_owned();
                name.push(".sqlite");
                SqliteHandle::at_path(PathBuf::from(name))
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::{Clock, FakeClock};

    fn setup(sanitise: bool) -> (Arc<FakeClock>, tempfile::TempDir, FileStorage) {
        let clock = Arc::new(FakeClock::new(1_700_000_000_000));
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("ns"), sanitise, clock.clone());
        (clock, dir, storage)
    }

    fn entry(value: &str) -> StoredEntry {
        StoredEntry::from_value(Bytes::copy_from_slice(value.as_bytes()))
    }

    #[tokio::test]
    async fn round_trip_with_nested_key() {
        let (_, _dir, storage) = setup(true);
        storage.put("a/b/c", entry("v")).await.unwrap();
        let got = storage.get("a/b/c", false).await.unwrap().unwrap();
        assert_eq!(&got.value[..], b"v");
        assert!(storage.delete("a/b/c").await.unwrap());
        assert!(storage.get("a/b/c", false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sanitisation_is_reversible_through_meta() {
        let (_, _dir, storage) = setup(true);
        storage.put("what?key:is*this", entry("v")).await.unwrap();
        let listing = storage.list(ListOptions::default(), false).await.unwrap();
        assert_eq!(listing.keys.len(), 1);
        assert_eq!(listing.keys[0].name, "what?key:is*this");
        assert!(storage.has("what?key:is*this").await.unwrap());
    }

    #[tokio::test]
    async fn dot_segments_cannot_traverse_when_sanitised() {
        let (_, dir, storage) = setup(true);
        storage.put("../escape", entry("v")).await.unwrap();
        // The value landed inside the root, not beside it.
        assert!(!dir.path().join("escape").exists());
        assert!(storage.get("../escape", false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn traversal_rejected_when_sanitisation_disabled() {
        let (_, _dir, storage) = setup(false);
        let err = storage.put("../escape", entry("v")).await.unwrap_err();
        assert_eq!(err.name(), "ERR_TRAVERSAL");
    }

    #[tokio::test]
    async fn parent_key_file_blocks_children() {
        let (_, _dir, storage) = setup(true);
        storage.put("parent", entry("v")).await.unwrap();
        let err = storage.put("parent/child", entry("v")).await.unwrap_err();
        assert_eq!(err.name(), "ERR_NAMESPACE_KEY_CHILD");
    }

    #[tokio::test]
    async fn expiration_round_trips_and_expires() {
        let (clock, _dir, storage) = setup(true);
        let now_secs = clock.now_millis() / 1000;
        let mut e = entry("v");
        e.expiration = Some(now_secs + 2);
        e.metadata = Some(serde_json::json!({"tag": true}));
        storage.put("k", e).await.unwrap();

        let head = storage.head("k").await.unwrap().unwrap();
        assert_eq!(head.expiration, Some(now_secs + 2));
        assert_eq!(head.metadata, Some(serde_json::json!({"tag": true})));

        clock.advance(3_000);
        assert!(storage.get("k", false).await.unwrap().is_none());
        assert!(storage.list(ListOptions::default(), false).await.unwrap().keys.is_empty());
    }

    #[tokio::test]
    async fn positioned_range_read() {
        let (_, _dir, storage) = setup(true);
        storage.put("k", entry("0123456789")).await.unwrap();
        let r = storage
            .get_range(
                "k",
                RangeOptions {
                    offset: None,
                    length: None,
                    suffix: Some(4),
                },
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&r.entry.value[..], b"6789");
        assert_eq!(r.range.offset, 6);
    }

    #[tokio::test]
    async fn sql_database_is_colocated() {
        let (_, dir, storage) = setup(true);
        let db = storage.sql_database().unwrap();
        db.execute_batch("CREATE TABLE t (n INTEGER);").unwrap();
        assert!(db.path().unwrap().starts_with(dir.path()));
    }
}
